//! Empty-dir volumes: a per-pod directory, tmpfs-backed for medium `Memory`

use super::PluginHost;
use crate::domain::quantity::quantity_bytes;
use crate::error::{Error, Result};
use crate::volume::util::{cleanup_failed_mount, is_mounted, make_mount_dir};
use crate::volume::{pod_uid, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec, VolumeUnmounter};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Pod};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PLUGIN_NAME: &str = "kubernetes.io/empty-dir";

/// Medium backed by RAM
pub const MEDIUM_MEMORY: &str = "Memory";

const EMPTY_DIR_MODE: u32 = 0o777;

pub struct EmptyDirPlugin {
    host: PluginHost,
}

impl EmptyDirPlugin {
    pub fn new() -> Self {
        Self {
            host: PluginHost::default(),
        }
    }
}

impl Default for EmptyDirPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumePlugin for EmptyDirPlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.host.set(PLUGIN_NAME, host)
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.volume
            .as_ref()
            .map(|v| v.empty_dir.is_some())
            .unwrap_or(false)
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        let source = spec
            .volume
            .as_ref()
            .and_then(|v| v.empty_dir.clone())
            .ok_or_else(|| Error::UnsupportedVolume("spec is not an empty-dir volume".into()))?;
        let host = self.host.get(PLUGIN_NAME)?;
        let uid = pod_uid(pod)?;
        Ok(Box::new(EmptyDirMounter {
            path: host.pod_volume_dir(&uid, PLUGIN_NAME, &spec.name()),
            host,
            source,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(PLUGIN_NAME)?;
        Ok(Box::new(EmptyDirUnmounter {
            path: host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name),
            host,
        }))
    }
}

struct EmptyDirMounter {
    host: VolumeHostRef,
    path: PathBuf,
    source: EmptyDirVolumeSource,
}

impl EmptyDirMounter {
    fn tmpfs_options(&self) -> Result<Vec<String>> {
        match &self.source.size_limit {
            Some(limit) => Ok(vec![format!("size={}", quantity_bytes(limit)?)]),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl VolumeMounter for EmptyDirMounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        if self.source.medium.as_deref() != Some(MEDIUM_MEMORY) {
            std::fs::create_dir_all(dir)?;
            set_mode(dir, EMPTY_DIR_MODE)?;
            return Ok(());
        }

        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), dir).await? {
            debug!("Memory-backed empty-dir already mounted at {:?}", dir);
            return Ok(());
        }
        make_mount_dir(dir)?;
        let options = self.tmpfs_options()?;
        if let Err(e) = mounter.mount("tmpfs", dir, "tmpfs", &options).await {
            warn!("tmpfs mount at {:?} failed: {}", dir, e);
            cleanup_failed_mount(mounter.as_ref(), dir).await;
            return Err(e);
        }
        set_mode(dir, EMPTY_DIR_MODE)
    }
}

struct EmptyDirUnmounter {
    host: VolumeHostRef,
    path: PathBuf,
}

#[async_trait]
impl VolumeUnmounter for EmptyDirUnmounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), dir).await? {
            mounter.unmount(dir).await?;
        }
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn set_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}
