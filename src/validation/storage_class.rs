//! StorageClass validation
//!
//! Create-time checks and update-time immutability rules for StorageClass
//! objects. Validation never touches the cluster and is never retried.

use super::{is_dns1123_subdomain, is_qualified_name, FieldError, FieldErrors};
use k8s_openapi::api::storage::v1::StorageClass;

/// Maximum combined size of parameter keys and values
pub const MAX_PARAMETERS_SIZE: usize = 256 * (1 << 10);

/// Maximum number of parameters
pub const MAX_PARAMETERS_LEN: usize = 512;

/// Reclaim policies a StorageClass may request
pub const SUPPORTED_RECLAIM_POLICIES: [&str; 2] = ["Delete", "Retain"];

/// Reclaim policy applied when a class leaves it empty
pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// Validation switches that would otherwise be cluster feature gates
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Permit `allowVolumeExpansion` on classes
    pub allow_volume_expansion: bool,
}

/// Validate a new StorageClass
pub fn validate_storage_class(class: &StorageClass, options: &ValidationOptions) -> FieldErrors {
    let mut errs = FieldErrors::default();
    errs.extend(validate_metadata(class));
    errs.extend(validate_provisioner(&class.provisioner));
    errs.extend(validate_parameters(class));
    errs.extend(validate_reclaim_policy(class.reclaim_policy.as_deref()));

    if class.allow_volume_expansion.is_some() && !options.allow_volume_expansion {
        errs.push(FieldError::forbidden(
            "allowVolumeExpansion",
            "field is disabled by configuration",
        ));
    }
    errs
}

/// Validate an update from `old` to `class`
pub fn validate_storage_class_update(class: &StorageClass, old: &StorageClass) -> FieldErrors {
    let mut errs = FieldErrors::default();

    if class.metadata.name != old.metadata.name {
        errs.push(FieldError::invalid(
            "metadata.name",
            class.metadata.name.as_deref().unwrap_or_default(),
            "field is immutable",
        ));
    }

    // An empty map and a missing map are the same set of parameters
    let params = class.parameters.clone().unwrap_or_default();
    let old_params = old.parameters.clone().unwrap_or_default();
    if params != old_params {
        errs.push(FieldError::forbidden(
            "parameters",
            "updates to parameters are forbidden.",
        ));
    }

    if class.provisioner != old.provisioner {
        errs.push(FieldError::forbidden(
            "provisioner",
            "updates to provisioner are forbidden.",
        ));
    }

    if effective_reclaim_policy(class) != effective_reclaim_policy(old) {
        errs.push(FieldError::forbidden(
            "reclaimPolicy",
            "updates to reclaimPolicy are forbidden.",
        ));
    }
    errs
}

/// The reclaim policy a class applies, with the default filled in
pub fn effective_reclaim_policy(class: &StorageClass) -> &str {
    match class.reclaim_policy.as_deref() {
        Some(policy) if !policy.is_empty() => policy,
        _ => DEFAULT_RECLAIM_POLICY,
    }
}

fn validate_metadata(class: &StorageClass) -> Vec<FieldError> {
    let mut errs = Vec::new();
    match class.metadata.name.as_deref() {
        None | Some("") => errs.push(FieldError::required(
            "metadata.name",
            "name or generateName is required",
        )),
        Some(name) => {
            for msg in is_dns1123_subdomain(name) {
                errs.push(FieldError::invalid("metadata.name", name, &msg));
            }
        }
    }
    if let Some(namespace) = class.metadata.namespace.as_deref() {
        if !namespace.is_empty() {
            errs.push(FieldError::forbidden(
                "metadata.namespace",
                "not allowed on this type",
            ));
        }
    }
    errs
}

fn validate_provisioner(provisioner: &str) -> Vec<FieldError> {
    if provisioner.is_empty() {
        return vec![FieldError::required("provisioner", "")];
    }
    is_qualified_name(&provisioner.to_lowercase())
        .into_iter()
        .map(|msg| FieldError::invalid("provisioner", provisioner, &msg))
        .collect()
}

fn validate_parameters(class: &StorageClass) -> Vec<FieldError> {
    let Some(params) = &class.parameters else {
        return Vec::new();
    };

    if params.len() > MAX_PARAMETERS_LEN {
        return vec![FieldError::too_many("parameters", MAX_PARAMETERS_LEN)];
    }

    let mut errs = Vec::new();
    let mut total_size = 0usize;
    for (key, value) in params {
        if key.is_empty() {
            errs.push(FieldError::invalid("parameters", key, "field can not be empty."));
        }
        total_size += key.len() + value.len();
    }
    if total_size > MAX_PARAMETERS_SIZE {
        errs.push(FieldError::too_long("parameters", MAX_PARAMETERS_SIZE));
    }
    errs
}

fn validate_reclaim_policy(policy: Option<&str>) -> Vec<FieldError> {
    match policy {
        Some(policy) if !policy.is_empty() && !SUPPORTED_RECLAIM_POLICIES.contains(&policy) => {
            vec![FieldError::not_supported(
                "reclaimPolicy",
                policy,
                &SUPPORTED_RECLAIM_POLICIES,
            )]
        }
        _ => Vec::new(),
    }
}
