//! Host mounter
//!
//! Issues `mount(8)` and `umount(8)` on this host. Network filesystems whose
//! client tools may be missing from the host image are mounted through a
//! containerized mounter binary when one is configured.

use super::exec::OsExec;
use super::propagation::{MountPropagationInspector, PROC_MOUNTINFO_PATH, PROC_MOUNTS_PATH};
use super::{
    bind_remount_options, device_name_from_mount, exclusive_open_fails_on_device,
    make_mount_args, path_is_device, ExecRef, MountPoint, Mounter, DEFAULT_EXEC_TIMEOUT,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

// =============================================================================
// Constants
// =============================================================================

/// Filesystems mounted through the containerized mounter, if configured
pub const FS_TYPES_NEEDING_MOUNTER: [&str; 4] = ["nfs", "glusterfs", "ceph", "cifs"];

// =============================================================================
// Mounter Configuration
// =============================================================================

/// Configuration for the host mounter
#[derive(Debug, Clone)]
pub struct MounterConfig {
    /// Containerized mounter binary for network filesystems
    pub mounter_path: Option<PathBuf>,
    /// Mount table (for testing)
    pub proc_mounts_path: PathBuf,
    /// Mount-info table (for testing)
    pub proc_mountinfo_path: PathBuf,
    /// Upper bound for a single mount/umount invocation
    pub command_timeout: Duration,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            mounter_path: None,
            proc_mounts_path: PathBuf::from(PROC_MOUNTS_PATH),
            proc_mountinfo_path: PathBuf::from(PROC_MOUNTINFO_PATH),
            command_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

// =============================================================================
// Linux Mounter
// =============================================================================

/// Mounter that runs the mount utilities on this host
pub struct LinuxMounter {
    config: MounterConfig,
    inspector: MountPropagationInspector,
    runner: ExecRef,
}

impl LinuxMounter {
    pub fn new(config: MounterConfig) -> Self {
        Self::with_exec(config, Arc::new(OsExec::new()))
    }

    /// Run the mount utilities through `runner` instead of spawning directly
    pub fn with_exec(config: MounterConfig, runner: ExecRef) -> Self {
        let inspector = MountPropagationInspector::new(
            config.proc_mounts_path.clone(),
            config.proc_mountinfo_path.clone(),
        );
        Self {
            config,
            inspector,
            runner,
        }
    }

    pub fn inspector(&self) -> &MountPropagationInspector {
        &self.inspector
    }

    /// Command prefix for a mount of `fs_type`
    fn mount_command(&self, fs_type: &str) -> Vec<String> {
        match &self.config.mounter_path {
            Some(mounter) if FS_TYPES_NEEDING_MOUNTER.contains(&fs_type) => vec![
                mounter.to_string_lossy().into_owned(),
                "mount".to_string(),
            ],
            _ => vec!["mount".to_string()],
        }
    }

    async fn do_mount(
        &self,
        command: &[String],
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let Some((program, prefix)) = command.split_first() else {
            return Err(Error::Configuration("empty mount command".into()));
        };
        let mut args = prefix.to_vec();
        args.extend(make_mount_args(source, target, fs_type, options));

        debug!("Mounting cmd ({}) with arguments ({:?})", program, args);
        let result = self
            .runner
            .run(program, &args, self.config.command_timeout)
            .await
            .map_err(|e| Error::MountFailed {
                command: program.clone(),
                args: args.clone(),
                output: String::new(),
                reason: e.to_string(),
            })?;

        if !result.success() {
            let output = result.combined_output();
            error!(
                "Mount failed: exit status {}\nMounting command: {}\nMounting arguments: {:?}\nOutput: {}",
                result.exit_code, program, args, output
            );
            return Err(Error::MountFailed {
                command: program.clone(),
                args,
                output,
                reason: format!("exit status {}", result.exit_code),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let plain = vec!["mount".to_string()];

        // Bind mounts ignore filesystem options on the first pass
        if let Some(remount) = bind_remount_options(options) {
            self.do_mount(&plain, source, target, fs_type, &["bind".to_string()])
                .await?;
            return self.do_mount(&plain, source, target, fs_type, &remount).await;
        }

        let command = self.mount_command(fs_type);
        self.do_mount(&command, source, target, fs_type, options).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        info!("Unmounting {:?}", target);
        let target_str = target.to_string_lossy().into_owned();
        let result = self
            .runner
            .run("umount", &[target_str.clone()], self.config.command_timeout)
            .await
            .map_err(|e| Error::UnmountFailed {
                target: target_str.clone(),
                output: String::new(),
                reason: e.to_string(),
            })?;

        if !result.success() {
            return Err(Error::UnmountFailed {
                target: target_str,
                output: result.combined_output(),
                reason: format!("exit status {}", result.exit_code),
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MountPoint>> {
        self.inspector.list()
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        self.inspector.is_not_mount_point(path)
    }

    async fn device_opened(&self, path: &Path) -> Result<bool> {
        exclusive_open_fails_on_device(path)
    }

    async fn path_is_device(&self, path: &Path) -> Result<bool> {
        path_is_device(path)
    }

    async fn get_device_name_from_mount(
        &self,
        mount_path: &Path,
        plugin_dir: &Path,
    ) -> Result<String> {
        device_name_from_mount(self, mount_path, plugin_dir).await
    }

    async fn make_shared(&self, path: &Path) -> Result<()> {
        self.inspector
            .make_shared(
                path,
                self.runner.as_ref(),
                &["mount".to_string()],
                self.config.command_timeout,
            )
            .await
    }
}
