//! Volume Provisioner - Dynamic Provisioning & Mount Execution
//!
//! Matches pending PersistentVolumeClaims to storage classes, drives volume
//! plugins to create backing volumes, and performs the mount, unmount and
//! format operations that attach volumes to pods on a node.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Provisioning Controller                              │
//! │   WorkQueue ──▶ sync_claim ──▶ binder / StorageClassMatcher ──▶ provision   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                        Volume Plugin Registry                               │
//! │   host-path │ empty-dir │ secret │ nfs │ local-volume                       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                            Volume Host                                      │
//! │   directories │ mounter / exec lookup │ wrapper plugins │ node lookups      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Mount Execution                                    │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────────────────┐   │
//! │  │ LinuxMounter │  │  ExecMounter     │  │ SafeFormatAndMount           │   │
//! │  │ (local)      │  │  (socket / pod)  │  │ (fsck, mkfs, mount)          │   │
//! │  └──────────────┘  └──────────────────┘  └──────────────────────────────┘   │
//! │          MountPropagationInspector (/proc/mounts, mountinfo)                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioning`]: claim matching, provisioning and binding
//! - [`volume`]: volume plugins, the plugin registry and the node's volume host
//! - [`mount`]: mounters, command execution and mount-table inspection
//! - [`rpc`]: helper-process exec protocol over Unix sockets
//! - [`validation`]: StorageClass validation
//! - [`domain`]: ports and Kubernetes selector/quantity semantics
//! - [`error`]: Error types and handling

pub mod domain;
pub mod error;
pub mod mount;
pub mod provisioning;
pub mod rpc;
pub mod validation;
pub mod volume;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use domain::ports::{
    ClaimStore, EventRecorder, EventType, ObjectLookup, VolumeProvisioner,
};

pub use error::{Error, ErrorAction, Result};

pub use mount::{Exec, ExecResult, LinuxMounter, MountPoint, Mounter, MounterConfig};

pub use provisioning::{
    ClaimState, ControllerConfig, ProvisioningController, StorageClassMatcher, WorkQueue,
};

pub use volume::{
    MountPodManager, NodeVolumeHost, VolumeHost, VolumeHostConfig, VolumePluginRegistry,
    VolumeSpec,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
