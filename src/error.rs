//! Error types for the volume provisioner
//!
//! Provides structured error types for every component: claim provisioning,
//! the plugin registry, mount execution, the helper exec RPC and
//! StorageClass validation.

use std::time::Duration;
use thiserror::Error;

use crate::validation::FieldErrors;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("No provisionable volume plugin registered for provisioner {provisioner}")]
    ProvisionerNotFound { provisioner: String },

    #[error("Failed to provision volume for claim {claim}: {reason}")]
    ProvisioningFailed { claim: String, reason: String },

    #[error("Failed to create volume {volume} after {attempts} attempts: {reason}")]
    VolumeCreationFailed {
        volume: String,
        attempts: u32,
        reason: String,
    },

    #[error("Failed to bind claim {claim} to volume {volume}: {reason}")]
    BindFailed {
        claim: String,
        volume: String,
        reason: String,
    },

    // =========================================================================
    // Volume Plugin Errors
    // =========================================================================
    #[error("No volume plugin matched: {0}")]
    PluginNotFound(String),

    #[error("Multiple volume plugins matched: {}", .names.join(","))]
    MultiplePluginsMatched { names: Vec<String> },

    #[error("Volume plugin registration failed: {plugin} - {reason}")]
    PluginRegistration { plugin: String, reason: String },

    #[error("Unsupported volume: {0}")]
    UnsupportedVolume(String),

    // =========================================================================
    // Mount Errors
    // =========================================================================
    #[error(
        "mount failed: {reason}\nMounting command: {command}\nMounting arguments: {}\nOutput: {output}",
        .args.join(" ")
    )]
    MountFailed {
        command: String,
        args: Vec<String>,
        output: String,
        reason: String,
    },

    #[error("Unmount failed: {reason}\nUnmounting arguments: {target}\nOutput: {output}")]
    UnmountFailed {
        target: String,
        output: String,
        reason: String,
    },

    #[error("'fsck' found errors on device {device} but could not correct them: {output}")]
    FsckUncorrected { device: String, output: String },

    #[error(
        "failed to mount the volume as {requested:?}, it already contains {existing}. Mount error: {mount_error}"
    )]
    FormatConflict {
        requested: String,
        existing: String,
        mount_error: String,
    },

    #[error("Failed to format device {device} as {fs_type}: {reason}")]
    FormatFailed {
        device: String,
        fs_type: String,
        reason: String,
    },

    #[error("failed to get a consistent snapshot of {path} after {tries} tries")]
    InconsistentMountTable { path: String, tries: usize },

    #[error("Malformed mount table {path}: {reason}")]
    MalformedMountTable { path: String, reason: String },

    #[error("cannot find mount point for {path:?}")]
    MountPointNotFound { path: String },

    #[error("Directory {path} is still mounted after unmount")]
    StillMounted { path: String },

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Executable not found: {command}")]
    ExecutableNotFound { command: String },

    #[error("Command {command} timed out after {timeout:?}")]
    ExecTimeout { command: String, timeout: Duration },

    #[error("Command {command} failed with exit code {exit_code}: {output}")]
    ExecFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Helper RPC error: {0}")]
    Rpc(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the work queue treats a failed claim sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with the queue's per-key backoff
    RequeueWithBackoff,
    /// Requeue once the delay has passed
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes or the next resync
    NoRequeue,
}

impl Error {
    /// Queue handling for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Flaky API server or helper process
            Error::Kube(_)
            | Error::Rpc(_)
            | Error::ProvisioningFailed { .. }
            | Error::BindFailed { .. } => ErrorAction::RequeueWithBackoff,

            // Backing volume already released
            Error::VolumeCreationFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Picked up again by the periodic resync or a watch event
            Error::ProvisionerNotFound { .. } | Error::PluginNotFound(_) => {
                ErrorAction::NoRequeue
            }

            // Wait for the user or a resync to fix these
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::InvalidSelector(_)
            | Error::QuantityParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Whether a sync failing with this error is retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Whether this error comes from a flaky dependency
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Rpc(_) | Error::ExecTimeout { .. }
        )
    }

    /// Check if this error reports a missing file or object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error reports an object that already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
