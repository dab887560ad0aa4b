//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the provisioning logic and the
//! cluster it runs against. The kube-backed adapters live next to their
//! consumers; tests substitute in-memory implementations.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Volume Provisioner Port
// =============================================================================

/// Port for plugins that create and destroy backing volumes
///
/// `provision` returns the PersistentVolume object describing the new backing
/// volume. The object is not persisted by the plugin; the controller stamps the
/// claim reference onto it and creates it.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create a backing volume satisfying `claim` with the class parameters
    async fn provision(
        &self,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
    ) -> Result<PersistentVolume>;

    /// Destroy the backing volume behind `volume`
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;

    /// Provisioner identifier, as referenced by `StorageClass.provisioner`
    fn provisioner_name(&self) -> &str;
}

// =============================================================================
// Claim Store Port
// =============================================================================

/// Port for reading and writing claims, volumes and classes
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Get a claim by namespace and name
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// List all claims in the cluster
    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>>;

    /// List all persistent volumes
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// List all storage classes
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;

    /// Create a persistent volume object
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Point `volume` at `claim` (sets `spec.claimRef`)
    async fn bind_volume(
        &self,
        volume: &PersistentVolume,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolume>;

    /// Point `claim` at `volume` and mark it Bound
    async fn bind_claim(
        &self,
        claim: &PersistentVolumeClaim,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolumeClaim>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Event severity, mirroring the Kubernetes event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Port for publishing events against a claim
///
/// Recording is best effort: failures are logged by the implementation and
/// never propagated into reconciliation.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        claim: &PersistentVolumeClaim,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

// =============================================================================
// Object Lookup Port
// =============================================================================

/// Port for the node-side object lookups volume plugins need
#[async_trait]
pub trait ObjectLookup: Send + Sync {
    /// The node this process runs on
    async fn node(&self) -> Result<Node>;

    /// Get a secret
    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Get a config map
    async fn config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;
}

// =============================================================================
// Cloud Provider Port
// =============================================================================

/// Handle to the cloud the cluster runs in, passed through to plugins
pub trait CloudProvider: Send + Sync {
    /// Provider name, e.g. "aws" or "gce"
    fn provider_name(&self) -> &str;

    /// Failure-domain zone of this node, when the provider knows it
    fn zone(&self) -> Option<String> {
        None
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeProvisionerRef = Arc<dyn VolumeProvisioner>;
pub type ClaimStoreRef = Arc<dyn ClaimStore>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type ObjectLookupRef = Arc<dyn ObjectLookup>;
pub type CloudProviderRef = Arc<dyn CloudProvider>;

#[cfg(test)]
impl std::fmt::Debug for dyn VolumeProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeProvisioner")
            .field("provisioner_name", &self.provisioner_name())
            .finish()
    }
}
