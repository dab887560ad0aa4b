//! Dynamic provisioning
//!
//! Pending claims flow through a keyed [`WorkQueue`] into the
//! [`ProvisioningController`], which first tries to bind an existing volume,
//! then picks a storage class with the [`StorageClassMatcher`] and drives the
//! class's provisioner.
//!
//! ```text
//!   watch events / resync
//!            │
//!            ▼
//!   ┌─────────────────┐    ┌──────────────┐    ┌──────────────────────┐
//!   │    WorkQueue    │───▶│  sync_claim  │───▶│ find_matching_volume │
//!   │ (per-key serial)│    └──────┬───────┘    └──────────────────────┘
//!   └─────────────────┘           │
//!                                 ▼
//!                    ┌────────────────────────┐   ┌──────────────────────┐
//!                    │  StorageClassMatcher   │──▶│  VolumeProvisioner   │
//!                    └────────────────────────┘   └──────────────────────┘
//! ```

pub mod binder;
pub mod cluster;
pub mod controller;
pub mod events;
pub mod matcher;
pub mod metrics;
pub mod queue;

pub use binder::find_matching_volume;
pub use cluster::{run_watchers, KubeClaimStore, KubeEventRecorder};
pub use controller::{ClaimState, ControllerConfig, ProvisioningController};
pub use events::ProvisioningEvent;
pub use matcher::StorageClassMatcher;
pub use queue::{WorkQueue, WorkQueueConfig};

/// Annotation marking the cluster default storage class
pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Annotation naming the provisioner that created a volume
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Annotation set on objects bound by the controller rather than a user
pub const BOUND_BY_CONTROLLER_ANNOTATION: &str = "pv.kubernetes.io/bound-by-controller";

/// Annotation set on a claim once binding finished
pub const BIND_COMPLETED_ANNOTATION: &str = "pv.kubernetes.io/bind-completed";
