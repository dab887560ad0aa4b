//! NFS volumes
//!
//! Mounts go through [`VolumeHost::mounter`](crate::volume::VolumeHost::mounter),
//! so they run in a helper process or mount pod when one serves this plugin.

use super::PluginHost;
use crate::error::{Error, Result};
use crate::volume::util::{cleanup_failed_mount, is_mounted, make_mount_dir, unmount_mount_point};
use crate::volume::{pod_uid, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec, VolumeUnmounter};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NFSVolumeSource, Pod};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

pub const PLUGIN_NAME: &str = "kubernetes.io/nfs";

pub struct NfsPlugin {
    host: PluginHost,
}

impl NfsPlugin {
    pub fn new() -> Self {
        Self {
            host: PluginHost::default(),
        }
    }

    /// Source plus the persistent volume's mount options
    fn source(spec: &VolumeSpec) -> Option<(&NFSVolumeSource, Vec<String>)> {
        if let Some(nfs) = spec.volume.as_ref().and_then(|v| v.nfs.as_ref()) {
            return Some((nfs, Vec::new()));
        }
        let pv_spec = spec.persistent_volume.as_ref()?.spec.as_ref()?;
        let nfs = pv_spec.nfs.as_ref()?;
        Some((nfs, pv_spec.mount_options.clone().unwrap_or_default()))
    }
}

impl Default for NfsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumePlugin for NfsPlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.host.set(PLUGIN_NAME, host)
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        Self::source(spec).is_some()
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        let (source, mount_options) = Self::source(spec)
            .ok_or_else(|| Error::UnsupportedVolume("spec is not an NFS volume".into()))?;
        let host = self.host.get(PLUGIN_NAME)?;
        let uid = pod_uid(pod)?;
        Ok(Box::new(NfsMounter {
            path: host.pod_volume_dir(&uid, PLUGIN_NAME, &spec.name()),
            host,
            server: source.server.clone(),
            export_path: source.path.clone(),
            read_only: spec.read_only || source.read_only.unwrap_or(false),
            mount_options,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(PLUGIN_NAME)?;
        Ok(Box::new(NfsUnmounter {
            path: host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name),
            host,
        }))
    }
}

struct NfsMounter {
    host: VolumeHostRef,
    path: PathBuf,
    server: String,
    export_path: String,
    read_only: bool,
    mount_options: Vec<String>,
}

#[async_trait]
impl VolumeMounter for NfsMounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), dir).await? {
            debug!("NFS volume already mounted at {:?}", dir);
            return Ok(());
        }
        make_mount_dir(dir)?;

        let source = format!("{}:{}", self.server, self.export_path);
        let mut options = self.mount_options.clone();
        if self.read_only {
            options.push("ro".to_string());
        }
        if let Err(e) = mounter.mount(&source, dir, "nfs", &options).await {
            error!("Mount of {} at {:?} failed: {}", source, dir, e);
            cleanup_failed_mount(mounter.as_ref(), dir).await;
            return Err(e);
        }
        Ok(())
    }
}

struct NfsUnmounter {
    host: VolumeHostRef,
    path: PathBuf,
}

#[async_trait]
impl VolumeUnmounter for NfsUnmounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        unmount_mount_point(self.host.mounter(PLUGIN_NAME).as_ref(), dir).await
    }
}
