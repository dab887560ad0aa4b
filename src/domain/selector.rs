//! Label selectors
//!
//! Compiles a Kubernetes `LabelSelector` into a matcher with the API server's
//! semantics: every `matchLabels` pair AND every `matchExpressions` requirement
//! must hold. An empty selector matches everything.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet};

/// Operator of a single selector requirement
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operator {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.operator {
            Operator::In(values) => value.map_or(false, |v| values.contains(v)),
            Operator::NotIn(values) => value.map_or(true, |v| !values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A validated label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector that matches every label set
    pub fn everything() -> Self {
        Self::default()
    }

    /// Compile a `LabelSelector`, rejecting unknown operators and malformed values
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();

        if let Some(match_labels) = &selector.match_labels {
            for (key, value) in match_labels {
                requirements.push(Requirement {
                    key: key.clone(),
                    operator: Operator::In(BTreeSet::from([value.clone()])),
                });
            }
        }

        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let operator = match expr.operator.as_str() {
                "In" | "NotIn" if values.is_empty() => {
                    return Err(Error::InvalidSelector(format!(
                        "{}: values must be non-empty for operator {}",
                        expr.key, expr.operator
                    )));
                }
                "In" => Operator::In(values),
                "NotIn" => Operator::NotIn(values),
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    return Err(Error::InvalidSelector(format!(
                        "{}: values must be empty for operator {}",
                        expr.key, expr.operator
                    )));
                }
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(Error::InvalidSelector(format!(
                        "{}: {:?} is not a valid selector operator",
                        expr.key, other
                    )));
                }
            };
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
            });
        }

        Ok(Self { requirements })
    }

    /// Compile an optional selector; `None` matches everything
    pub fn from_optional(selector: Option<&LabelSelector>) -> Result<Self> {
        selector.map_or(Ok(Self::everything()), Self::from_label_selector)
    }

    /// Whether this selector has no requirements
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Check a label set against every requirement
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);
        self.requirements.iter().all(|r| r.matches(labels))
    }
}
