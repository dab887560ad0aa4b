//! Admission-time validation
//!
//! Field-level errors plus the Kubernetes name grammars (DNS-1123 subdomain,
//! qualified name) shared by StorageClass validation and the plugin registry.
//! The provisioning controller skips classes that fail
//! [`validate_storage_class`].

pub mod storage_class;

pub use storage_class::{validate_storage_class, validate_storage_class_update, ValidationOptions};

use once_cell::sync::Lazy;
use regex::Regex;

// =============================================================================
// Field Errors
// =============================================================================

/// Kind of a field validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorType {
    Required,
    Invalid,
    NotSupported,
    Forbidden,
    TooLong,
    TooMany,
}

impl std::fmt::Display for FieldErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldErrorType::Required => write!(f, "Required value"),
            FieldErrorType::Invalid => write!(f, "Invalid value"),
            FieldErrorType::NotSupported => write!(f, "Unsupported value"),
            FieldErrorType::Forbidden => write!(f, "Forbidden"),
            FieldErrorType::TooLong => write!(f, "Too long"),
            FieldErrorType::TooMany => write!(f, "Too many"),
        }
    }
}

/// A single validation failure on one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub error_type: FieldErrorType,
    /// Dotted path of the offending field, e.g. `metadata.name`
    pub field: String,
    pub value: Option<String>,
    pub detail: String,
}

impl FieldError {
    pub fn required(field: &str, detail: &str) -> Self {
        Self::new(FieldErrorType::Required, field, None, detail)
    }

    pub fn invalid(field: &str, value: &str, detail: &str) -> Self {
        Self::new(FieldErrorType::Invalid, field, Some(value), detail)
    }

    pub fn not_supported(field: &str, value: &str, supported: &[&str]) -> Self {
        let quoted: Vec<String> = supported.iter().map(|s| format!("{:?}", s)).collect();
        Self::new(
            FieldErrorType::NotSupported,
            field,
            Some(value),
            &format!("supported values: {}", quoted.join(", ")),
        )
    }

    pub fn forbidden(field: &str, detail: &str) -> Self {
        Self::new(FieldErrorType::Forbidden, field, None, detail)
    }

    pub fn too_long(field: &str, max: usize) -> Self {
        Self::new(
            FieldErrorType::TooLong,
            field,
            None,
            &format!("must have at most {} bytes", max),
        )
    }

    pub fn too_many(field: &str, max: usize) -> Self {
        Self::new(
            FieldErrorType::TooMany,
            field,
            None,
            &format!("must have at most {} items", max),
        )
    }

    fn new(error_type: FieldErrorType, field: &str, value: Option<&str>, detail: &str) -> Self {
        Self {
            error_type,
            field: field.to_string(),
            value: value.map(str::to_string),
            detail: detail.to_string(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(
                f,
                "{}: {}: {:?}: {}",
                self.field, self.error_type, value, self.detail
            ),
            None => write!(f, "{}: {}: {}", self.field, self.error_type, self.detail),
        }
    }
}

/// Ordered list of field errors; empty means valid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, err: FieldError) {
        self.0.push(err);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Convert into a `Result`, failing when any error was collected
    pub fn into_result(self) -> crate::error::Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(crate::error::Error::Validation(self))
        }
    }
}

impl Extend<FieldError> for FieldErrors {
    fn extend<T: IntoIterator<Item = FieldError>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

// =============================================================================
// Name Grammars
// =============================================================================

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const QUALIFIED_NAME_MAX_LENGTH: usize = 63;

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static regex")
});

static QUALIFIED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex")
});

/// Check a DNS-1123 subdomain; returns human-readable problems
pub fn is_dns1123_subdomain(value: &str) -> Vec<String> {
    let mut errs = Vec::new();
    if value.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
        errs.push(format!(
            "must be no more than {} characters",
            DNS1123_SUBDOMAIN_MAX_LENGTH
        ));
    }
    if !DNS1123_SUBDOMAIN.is_match(value) {
        errs.push(
            "a DNS-1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    errs
}

/// Check a qualified name (`[prefix/]name`); returns human-readable problems
pub fn is_qualified_name(value: &str) -> Vec<String> {
    let mut errs = Vec::new();
    let parts: Vec<&str> = value.split('/').collect();
    let name = match parts.as_slice() {
        [name] => *name,
        [prefix, name] => {
            if prefix.is_empty() {
                errs.push("prefix part must be non-empty".to_string());
            } else {
                errs.extend(
                    is_dns1123_subdomain(prefix)
                        .into_iter()
                        .map(|msg| format!("prefix part {}", msg)),
                );
            }
            *name
        }
        _ => {
            errs.push(
                "a qualified name must consist of alphanumeric characters, '-', '_' or '.', \
                 with an optional DNS subdomain prefix and '/' (e.g. 'example.com/MyName')"
                    .to_string(),
            );
            return errs;
        }
    };

    if name.is_empty() {
        errs.push("name part must be non-empty".to_string());
    } else if name.len() > QUALIFIED_NAME_MAX_LENGTH {
        errs.push(format!(
            "name part must be no more than {} characters",
            QUALIFIED_NAME_MAX_LENGTH
        ));
    }
    if !name.is_empty() && !QUALIFIED_NAME.is_match(name) {
        errs.push(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    errs
}
