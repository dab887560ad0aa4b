//! Mount execution
//!
//! The [`Mounter`] contract and its implementations:
//!
//! - [`LinuxMounter`]: runs `mount(8)`/`umount(8)` on the host
//! - [`ExecMounter`]: routes mount/unmount through an [`Exec`] (helper socket
//!   or mount pod) and forwards read-only queries to a local mounter
//! - [`SafeFormatAndMount`]: fsck, mount, and format-on-first-use for devices
//!
//! Command execution itself is abstracted behind [`Exec`] so the same mount
//! logic can run locally, through the helper RPC, or inside a mount pod.

pub mod exec;
pub mod exec_mounter;
pub mod format;
pub mod linux;
pub mod pod_exec;
pub mod propagation;

pub use exec::{ErrorExec, OsExec};
pub use exec_mounter::ExecMounter;
pub use format::SafeFormatAndMount;
pub use linux::{LinuxMounter, MounterConfig};
pub use pod_exec::PodExec;
pub use propagation::{MountInfo, MountPropagationInspector};

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default upper bound for a single proxied command
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Directory under a plugin dir holding device-global mounts
pub const MOUNTS_IN_GLOBAL_PD_PATH: &str = "mounts";

// =============================================================================
// Mount Table Entries
// =============================================================================

/// One line of the live mount table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub opts: Vec<String>,
    pub freq: i32,
    pub pass: i32,
}

// =============================================================================
// Command Execution
// =============================================================================

/// Outcome of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, lossily decoded
    pub fn combined_output(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }

    /// Turn a non-zero exit status into [`Error::ExecFailed`]
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ExecFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

/// Port for running a command somewhere
///
/// A command that starts and exits, whatever its status, is `Ok`; errors are
/// reserved for commands that could not be run or were killed on timeout.
/// A zero timeout means no limit.
#[async_trait]
pub trait Exec: Send + Sync {
    async fn run(&self, command: &str, args: &[String], timeout: Duration) -> Result<ExecResult>;
}

pub type ExecRef = Arc<dyn Exec>;

// =============================================================================
// Mounter Port
// =============================================================================

/// Mount, unmount and inspect mount points
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` at `target`
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// Unmount `target`
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Snapshot of the mount table
    async fn list(&self) -> Result<Vec<MountPoint>>;

    /// Cheap mount-point check; misses same-device bind mounts.
    /// A missing path is reported as a not-found error.
    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool>;

    /// Whether the block device at `path` is held open by someone else
    async fn device_opened(&self, path: &Path) -> Result<bool>;

    /// Whether `path` is a device node
    async fn path_is_device(&self, path: &Path) -> Result<bool>;

    /// Volume or device name behind `mount_path`
    async fn get_device_name_from_mount(&self, mount_path: &Path, plugin_dir: &Path)
        -> Result<String>;

    /// Ensure `path` propagates mounts recursively (shared)
    async fn make_shared(&self, path: &Path) -> Result<()>;
}

pub type MounterRef = Arc<dyn Mounter>;

// =============================================================================
// Shared Helpers
// =============================================================================

/// Split mount options for a bind mount
///
/// Returns `Some(remount_options)` when `options` requests a bind mount. The
/// remount pass carries `remount` plus every other option, minus `bind` and
/// any duplicate `remount`.
pub fn bind_remount_options(options: &[String]) -> Option<Vec<String>> {
    if !options.iter().any(|o| o == "bind") {
        return None;
    }
    let mut remount = vec!["remount".to_string()];
    remount.extend(
        options
            .iter()
            .filter(|o| *o != "bind" && *o != "remount")
            .cloned(),
    );
    Some(remount)
}

/// Arguments for `mount(8)`: `[-t type] [-o opts] [source] target`
pub fn make_mount_args(source: &str, target: &Path, fs_type: &str, options: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    if !fs_type.is_empty() {
        args.push("-t".to_string());
        args.push(fs_type.to_string());
    }
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    if !source.is_empty() {
        args.push(source.to_string());
    }
    args.push(target.to_string_lossy().into_owned());
    args
}

/// Every other mount path sharing the device mounted at `path`
pub async fn get_mount_refs(mounter: &dyn Mounter, path: &Path) -> Result<Vec<PathBuf>> {
    let mounts = mounter.list().await?;
    let device = mounts
        .iter()
        .find(|m| m.path == path)
        .map(|m| m.device.clone());

    let Some(device) = device else {
        return Ok(Vec::new());
    };
    Ok(mounts
        .into_iter()
        .filter(|m| m.device == device && m.path != path)
        .map(|m| m.path)
        .collect())
}

/// Resolve the volume name behind a pod mount
///
/// If another mount of the same device lives under `<plugin_dir>/mounts/`, the
/// remainder of that path is the volume name; otherwise the base name of
/// `mount_path` is used.
pub async fn device_name_from_mount(
    mounter: &dyn Mounter,
    mount_path: &Path,
    plugin_dir: &Path,
) -> Result<String> {
    let refs = get_mount_refs(mounter, mount_path).await?;
    let global = plugin_dir.join(MOUNTS_IN_GLOBAL_PD_PATH);
    for r in &refs {
        if let Ok(rest) = r.strip_prefix(&global) {
            let name = rest.to_string_lossy().into_owned();
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }
    Ok(mount_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default())
}

/// Whether `path` is a device node; a missing path is not a device
pub fn path_is_device(path: &Path) -> Result<bool> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let ft = meta.file_type();
            Ok(ft.is_block_device() || ft.is_char_device())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether an exclusive open of the device fails with `EBUSY`
pub fn exclusive_open_fails_on_device(path: &Path) -> Result<bool> {
    use nix::errno::Errno;
    use std::os::unix::fs::OpenOptionsExt;

    if !path_is_device(path)? {
        tracing::warn!("Path {:?} is not referring to a device", path);
        return Ok(false);
    }
    match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_EXCL)
        .open(path)
    {
        Ok(_file) => Ok(false),
        Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => Ok(true),
        Err(e) => Err(e.into()),
    }
}
