//! Claim accessors shared by the binder, the matcher and provisioners

use super::quantity::quantity_bytes;
use crate::error::Result;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Legacy annotation naming the storage class of a claim
pub const BETA_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// `namespace/name` of a claim
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or("default"),
        claim.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Explicit storage class of a claim, from the spec or the beta annotation
///
/// An empty name is treated as no class.
pub fn claim_class_name(claim: &PersistentVolumeClaim) -> Option<String> {
    let from_spec = claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone());
    let from_annotation = || {
        claim
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BETA_STORAGE_CLASS_ANNOTATION).cloned())
    };
    from_spec
        .or_else(from_annotation)
        .filter(|name| !name.is_empty())
}

/// Requested storage quantity
pub fn requested_storage(claim: &PersistentVolumeClaim) -> Option<Quantity> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage").cloned())
}

/// Requested storage in bytes; zero when nothing is requested
pub fn requested_bytes(claim: &PersistentVolumeClaim) -> Result<u64> {
    match requested_storage(claim) {
        Some(q) => quantity_bytes(&q),
        None => Ok(0),
    }
}

/// Requested access modes
pub fn claim_access_modes(claim: &PersistentVolumeClaim) -> Vec<String> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_default()
}

/// Name given to a volume provisioned for `claim`
pub fn provisioned_volume_name(claim: &PersistentVolumeClaim) -> String {
    match claim.metadata.uid.as_deref() {
        Some(uid) => format!("pvc-{}", uid),
        None => format!(
            "pvc-{}-{}",
            claim.metadata.namespace.as_deref().unwrap_or("default"),
            claim.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}
