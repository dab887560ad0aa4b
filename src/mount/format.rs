//! Format-on-first-use mounting for block devices
//!
//! Runs `fsck` before mounting, and formats a device only when the mount
//! failed and `lsblk` reports no filesystem on it. A device formatted with a
//! different filesystem is never reformatted.

use super::{ExecRef, MounterRef, DEFAULT_EXEC_TIMEOUT};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// `fsck` exit status: errors found and corrected
const FSCK_ERRORS_CORRECTED: i32 = 1;

/// `fsck` exit status: errors found but left uncorrected
const FSCK_ERRORS_UNCORRECTED: i32 = 4;

/// Filesystem used when the caller does not ask for one
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Reported by the probe when a device has no filesystem but has children
const PARTITIONED_DEVICE: &str = "unknown data, probably partitions";

/// A mounter plus an executor for the filesystem utilities
#[derive(Clone)]
pub struct SafeFormatAndMount {
    mounter: MounterRef,
    exec: ExecRef,
}

impl SafeFormatAndMount {
    pub fn new(mounter: MounterRef, exec: ExecRef) -> Self {
        Self { mounter, exec }
    }

    /// Mount `source` at `target`, formatting it first if it is blank
    pub async fn format_and_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mut options = options.to_vec();
        options.push("defaults".to_string());

        self.check_filesystem(source).await?;

        debug!("Attempting to mount disk: {} {} {:?}", fs_type, source, target);
        let mount_err = match self.mounter.mount(source, target, fs_type, &options).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // The mount failed: either the disk is blank or it holds something else
        let existing = self.get_disk_format(source).await?;
        if existing.is_empty() {
            let fs_type = if fs_type.is_empty() { DEFAULT_FS_TYPE } else { fs_type };
            let args = if fs_type == "ext4" || fs_type == "ext3" {
                vec!["-F".to_string(), source.to_string()]
            } else {
                vec![source.to_string()]
            };

            info!(
                "Disk {:?} appears to be unformatted, attempting to format as type: {:?} with options: {:?}",
                source, fs_type, args
            );
            let mkfs = format!("mkfs.{}", fs_type);
            let formatted = self
                .exec
                .run(&mkfs, &args, DEFAULT_EXEC_TIMEOUT)
                .await
                .and_then(|r| r.check(&mkfs));
            if let Err(e) = formatted {
                error!(
                    "Format of disk {:?} failed: type {:?} target {:?}: {}",
                    source, fs_type, target, e
                );
                return Err(Error::FormatFailed {
                    device: source.to_string(),
                    fs_type: fs_type.to_string(),
                    reason: e.to_string(),
                });
            }

            info!("Disk successfully formatted ({}): {} {:?}", mkfs, source, target);
            return self.mounter.mount(source, target, fs_type, &options).await;
        }

        if fs_type.is_empty() || fs_type == existing {
            return Err(mount_err);
        }
        Err(Error::FormatConflict {
            requested: fs_type.to_string(),
            existing,
            mount_error: mount_err.to_string(),
        })
    }

    /// Filesystem type on `disk`; empty when the disk is blank
    pub async fn get_disk_format(&self, disk: &str) -> Result<String> {
        let args: Vec<String> = ["-n", "-o", "FSTYPE", disk]
            .iter()
            .map(|s| s.to_string())
            .collect();
        debug!("Probing filesystem of {:?} with lsblk {:?}", disk, args);

        let result = self
            .exec
            .run("lsblk", &args, DEFAULT_EXEC_TIMEOUT)
            .await
            .and_then(|r| r.check("lsblk"))
            .map_err(|e| {
                error!("Could not determine if disk {:?} is formatted: {}", disk, e);
                e
            })?;

        let output = String::from_utf8_lossy(&result.stdout).into_owned();
        Ok(classify_lsblk_output(&output))
    }

    async fn check_filesystem(&self, source: &str) -> Result<()> {
        debug!("Checking for issues with fsck on disk: {}", source);
        let args = vec!["-a".to_string(), source.to_string()];
        let result = match self.exec.run("fsck", &args, DEFAULT_EXEC_TIMEOUT).await {
            Ok(result) => result,
            Err(Error::ExecutableNotFound { .. }) => {
                warn!("'fsck' not found on system; continuing mount without running 'fsck'");
                return Ok(());
            }
            Err(e) => {
                warn!("Running fsck on {} failed, continuing: {}", source, e);
                return Ok(());
            }
        };

        match result.exit_code {
            0 => Ok(()),
            FSCK_ERRORS_CORRECTED => {
                info!("Device {} has errors which were corrected by fsck", source);
                Ok(())
            }
            FSCK_ERRORS_UNCORRECTED => Err(Error::FsckUncorrected {
                device: source.to_string(),
                output: result.combined_output(),
            }),
            code => {
                info!("fsck on {} exited with {}: {}", source, code, result.combined_output());
                Ok(())
            }
        }
    }
}

/// Interpret `lsblk -n -o FSTYPE` output
///
/// A first non-empty line is the filesystem. A single empty line is a blank
/// device; further lines are children (partitions).
fn classify_lsblk_output(output: &str) -> String {
    let output = output.strip_suffix('\n').unwrap_or(output);
    let lines: Vec<&str> = output.split('\n').collect();
    if !lines[0].is_empty() {
        return lines[0].to_string();
    }
    if lines.len() == 1 {
        return String::new();
    }
    PARTITIONED_DEVICE.to_string()
}
