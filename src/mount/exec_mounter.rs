//! Mounter over an injected executor
//!
//! Mount and unmount go through an [`Exec`] so they can run inside a helper
//! process or pod that carries the filesystem client tools. Read-only queries
//! are safe to answer locally and are forwarded to the wrapped mounter.

use super::{
    bind_remount_options, make_mount_args, ExecRef, ExecResult, MountPoint, Mounter, MounterRef,
    DEFAULT_EXEC_TIMEOUT,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error};

/// Mounter that proxies privileged operations through an executor
pub struct ExecMounter {
    wrapped: MounterRef,
    exec: ExecRef,
    timeout: Duration,
}

impl ExecMounter {
    pub fn new(exec: ExecRef, wrapped: MounterRef) -> Self {
        Self {
            wrapped,
            exec,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run an arbitrary command through the executor
    pub async fn exec(&self, command: &str, args: &[String]) -> Result<ExecResult> {
        self.exec.run(command, args, self.timeout).await
    }

    async fn do_exec_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        debug!("Exec mounting {} {:?} {} {:?}", source, target, fs_type, options);
        let args = make_mount_args(source, target, fs_type, options);

        let result = self.exec.run("mount", &args, self.timeout).await.map_err(|e| {
            error!("Exec mount of {:?} failed: {}", target, e);
            Error::MountFailed {
                command: "mount".into(),
                args: args.clone(),
                output: String::new(),
                reason: e.to_string(),
            }
        })?;

        if !result.success() {
            let output = result.combined_output();
            error!(
                "Mount failed: exit status {}\nMounting command: mount\nMounting arguments: {:?}\nOutput: {}",
                result.exit_code, args, output
            );
            return Err(Error::MountFailed {
                command: "mount".into(),
                args,
                output,
                reason: format!("exit status {}", result.exit_code),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for ExecMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        if let Some(remount) = bind_remount_options(options) {
            self.do_exec_mount(source, target, fs_type, &["bind".to_string()])
                .await?;
            return self.do_exec_mount(source, target, fs_type, &remount).await;
        }
        self.do_exec_mount(source, target, fs_type, options).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target_str = target.to_string_lossy().into_owned();
        let result = self
            .exec
            .run("umount", &[target_str.clone()], self.timeout)
            .await
            .map_err(|e| Error::UnmountFailed {
                target: target_str.clone(),
                output: String::new(),
                reason: e.to_string(),
            })?;

        let output = result.combined_output();
        if !output.is_empty() {
            debug!("Output of unmounting {}: {}", target_str, output);
        }
        if !result.success() {
            return Err(Error::UnmountFailed {
                target: target_str,
                output,
                reason: format!("exit status {}", result.exit_code),
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MountPoint>> {
        self.wrapped.list().await
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        self.wrapped.is_likely_not_mount_point(path).await
    }

    async fn device_opened(&self, path: &Path) -> Result<bool> {
        self.wrapped.device_opened(path).await
    }

    async fn path_is_device(&self, path: &Path) -> Result<bool> {
        self.wrapped.path_is_device(path).await
    }

    async fn get_device_name_from_mount(
        &self,
        mount_path: &Path,
        plugin_dir: &Path,
    ) -> Result<String> {
        self.wrapped
            .get_device_name_from_mount(mount_path, plugin_dir)
            .await
    }

    async fn make_shared(&self, path: &Path) -> Result<()> {
        self.wrapped.make_shared(path).await
    }
}
