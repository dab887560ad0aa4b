//! Host path volumes
//!
//! Bind-mounts a directory of the host into the pod. The plugin is also a
//! provisioner: each claim gets a fresh directory `<base>/<volume name>`, and
//! the deleter removes only directories it could have created.

use super::PluginHost;
use crate::domain::claim::{claim_access_modes, claim_key, provisioned_volume_name, requested_storage};
use crate::domain::ports::{VolumeProvisioner, VolumeProvisionerRef};
use crate::error::{Error, Result};
use crate::validation::storage_class::effective_reclaim_policy;
use crate::volume::util::{cleanup_failed_mount, is_mounted, make_mount_dir, unmount_mount_point};
use crate::volume::{
    pod_uid, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec, VolumeUnmounter,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, Pod,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PLUGIN_NAME: &str = "kubernetes.io/host-path";

/// Class parameter overriding the base directory
pub const BASE_PATH_PARAMETER: &str = "basePath";

/// Annotation recording the base directory a volume was provisioned under
pub const BASE_PATH_ANNOTATION: &str = "host-path.volume.kubernetes.io/base-path";

/// Configuration for host path provisioning
#[derive(Debug, Clone)]
pub struct HostPathConfig {
    /// Directory new volumes are created under
    pub base_path: PathBuf,
}

impl Default for HostPathConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/hostpath_pv"),
        }
    }
}

pub struct HostPathPlugin {
    config: HostPathConfig,
    host: PluginHost,
}

impl HostPathPlugin {
    pub fn new(config: HostPathConfig) -> Self {
        Self {
            config,
            host: PluginHost::default(),
        }
    }

    fn source(spec: &VolumeSpec) -> Option<&HostPathVolumeSource> {
        spec.volume
            .as_ref()
            .and_then(|v| v.host_path.as_ref())
            .or_else(|| {
                spec.persistent_volume
                    .as_ref()
                    .and_then(|pv| pv.spec.as_ref())
                    .and_then(|s| s.host_path.as_ref())
            })
    }

    fn base_path_for(&self, class: &StorageClass) -> Result<PathBuf> {
        let mut base = self.config.base_path.clone();
        for (key, value) in class.parameters.iter().flatten() {
            match key.as_str() {
                BASE_PATH_PARAMETER => {
                    let path = PathBuf::from(value);
                    if !path.is_absolute() {
                        return Err(Error::Configuration(format!(
                            "{} must be an absolute path, got {:?}",
                            BASE_PATH_PARAMETER, value
                        )));
                    }
                    base = path;
                }
                other => {
                    return Err(Error::Configuration(format!(
                        "invalid parameter {:?} for provisioner {}",
                        other, PLUGIN_NAME
                    )))
                }
            }
        }
        Ok(base)
    }
}

impl VolumePlugin for HostPathPlugin {
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
        let source = Self::source(spec)
            .ok_or_else(|| Error::UnsupportedVolume("spec does not reference a host path".into()))?;
        let host = self.host.get(PLUGIN_NAME)?;
        let uid = pod_uid(pod)?;
        Ok(Box::new(HostPathMounter {
            path: host.pod_volume_dir(&uid, PLUGIN_NAME, &spec.name()),
            host,
            source: PathBuf::from(&source.path),
            read_only: spec.read_only,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(PLUGIN_NAME)?;
        Ok(Box::new(HostPathUnmounter {
            path: host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name),
            host,
        }))
    }

    fn as_provisioner(self: Arc<Self>) -> Option<VolumeProvisionerRef> {
        Some(self)
    }
}

#[async_trait]
impl VolumeProvisioner for HostPathPlugin {
    async fn provision(
        &self,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
    ) -> Result<PersistentVolume> {
        let base = self.base_path_for(class).map_err(|e| Error::ProvisioningFailed {
            claim: claim_key(claim),
            reason: e.to_string(),
        })?;
        let name = provisioned_volume_name(claim);
        let path = base.join(&name);

        info!("Provisioning host path {:?} for claim {}", path, claim_key(claim));
        std::fs::create_dir_all(&path).map_err(|e| Error::ProvisioningFailed {
            claim: claim_key(claim),
            reason: format!("cannot create {:?}: {}", path, e),
        })?;

        let capacity = requested_storage(claim)
            .map(|q| BTreeMap::from([("storage".to_string(), q)]));

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name),
                annotations: Some(BTreeMap::from([(
                    BASE_PATH_ANNOTATION.to_string(),
                    base.to_string_lossy().into_owned(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity,
                access_modes: Some(claim_access_modes(claim)),
                persistent_volume_reclaim_policy: Some(effective_reclaim_policy(class).to_string()),
                host_path: Some(HostPathVolumeSource {
                    path: path.to_string_lossy().into_owned(),
                    type_: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.clone().unwrap_or_default();
        let path = volume
            .spec
            .as_ref()
            .and_then(|s| s.host_path.as_ref())
            .map(|h| PathBuf::from(&h.path))
            .ok_or_else(|| Error::UnsupportedVolume(format!("{} is not a host path volume", name)))?;
        let base = volume
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BASE_PATH_ANNOTATION))
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.base_path.clone());

        if name.is_empty() || path != base.join(&name) {
            return Err(Error::UnsupportedVolume(format!(
                "host path {:?} was not provisioned under {:?}, refusing to delete it",
                path, base
            )));
        }

        info!("Deleting host path {:?} of volume {}", path, name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Host path {:?} already gone", path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn provisioner_name(&self) -> &str {
        PLUGIN_NAME
    }
}

struct HostPathMounter {
    host: VolumeHostRef,
    path: PathBuf,
    source: PathBuf,
    read_only: bool,
}

#[async_trait]
impl VolumeMounter for HostPathMounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), dir).await? {
            debug!("Host path volume already mounted at {:?}", dir);
            return Ok(());
        }
        make_mount_dir(dir)?;

        let mut options = vec!["bind".to_string()];
        if self.read_only {
            options.push("ro".to_string());
        }
        let source = self.source.to_string_lossy();
        if let Err(e) = mounter.mount(&source, dir, "", &options).await {
            warn!("Bind mount of {:?} at {:?} failed: {}", self.source, dir, e);
            cleanup_failed_mount(mounter.as_ref(), dir).await;
            return Err(e);
        }
        Ok(())
    }
}

struct HostPathUnmounter {
    host: VolumeHostRef,
    path: PathBuf,
}

#[async_trait]
impl VolumeUnmounter for HostPathUnmounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        unmount_mount_point(self.host.mounter(PLUGIN_NAME).as_ref(), dir).await
    }
}
