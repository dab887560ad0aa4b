//! Secret volumes
//!
//! A wrapper plugin: the directory itself is a memory-backed empty-dir built
//! through the host, and the secret's keys are written into it as files.

use super::empty_dir::MEDIUM_MEMORY;
use super::PluginHost;
use crate::error::{Error, Result};
use crate::volume::{pod_uid, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec, VolumeUnmounter};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Pod, SecretVolumeSource, Volume};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub const PLUGIN_NAME: &str = "kubernetes.io/secret";

/// File mode used when the volume does not set one
pub const DEFAULT_FILE_MODE: i32 = 0o644;

pub struct SecretPlugin {
    host: PluginHost,
}

impl SecretPlugin {
    pub fn new() -> Self {
        Self {
            host: PluginHost::default(),
        }
    }
}

impl Default for SecretPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Spec of the inner volume holding the files
fn wrapped_spec(volume_name: &str) -> VolumeSpec {
    VolumeSpec::from_volume(Volume {
        name: volume_name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some(MEDIUM_MEMORY.to_string()),
            size_limit: None,
        }),
        ..Default::default()
    })
}

impl VolumePlugin for SecretPlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.host.set(PLUGIN_NAME, host)
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.volume
            .as_ref()
            .map(|v| v.secret.is_some())
            .unwrap_or(false)
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        let source = spec
            .volume
            .as_ref()
            .and_then(|v| v.secret.clone())
            .ok_or_else(|| Error::UnsupportedVolume("spec is not a secret volume".into()))?;
        let host = self.host.get(PLUGIN_NAME)?;
        let uid = pod_uid(pod)?;
        Ok(Box::new(SecretVolumeMounter {
            path: host.pod_volume_dir(&uid, PLUGIN_NAME, &spec.name()),
            volume_name: spec.name(),
            host,
            pod: pod.clone(),
            source,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(PLUGIN_NAME)?;
        Ok(Box::new(SecretVolumeUnmounter {
            path: host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name),
            volume_name: volume_name.to_string(),
            pod_uid: pod_uid.to_string(),
            host,
        }))
    }
}

struct SecretVolumeMounter {
    host: VolumeHostRef,
    path: PathBuf,
    volume_name: String,
    pod: Pod,
    source: SecretVolumeSource,
}

impl SecretVolumeMounter {
    /// Relative path -> (contents, mode)
    async fn payload(&self) -> Result<BTreeMap<String, (Vec<u8>, u32)>> {
        let namespace = self.pod.metadata.namespace.as_deref().unwrap_or("default");
        let secret_name = self.source.secret_name.clone().unwrap_or_default();
        let optional = self.source.optional.unwrap_or(false);

        let data = match self.host.get_secret(namespace, &secret_name).await {
            Ok(secret) => secret.data.unwrap_or_default(),
            Err(e) if e.is_not_found() && optional => {
                debug!("Optional secret {}/{} not found", namespace, secret_name);
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };

        let default_mode = self.source.default_mode.unwrap_or(DEFAULT_FILE_MODE) as u32;
        let mut payload = BTreeMap::new();
        match &self.source.items {
            Some(items) => {
                for item in items {
                    let Some(value) = data.get(&item.key) else {
                        if optional {
                            continue;
                        }
                        return Err(Error::ResourceNotFound {
                            kind: "SecretKey".into(),
                            name: format!("{}/{}[{}]", namespace, secret_name, item.key),
                        });
                    };
                    let mode = item.mode.map(|m| m as u32).unwrap_or(default_mode);
                    payload.insert(item.path.clone(), (value.0.clone(), mode));
                }
            }
            None => {
                for (key, value) in &data {
                    payload.insert(key.clone(), (value.0.clone(), default_mode));
                }
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl VolumeMounter for SecretVolumeMounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        let payload = self.payload().await?;
        for path in payload.keys() {
            validate_payload_path(path)?;
        }

        let wrapped = self
            .host
            .new_wrapper_mounter(&self.volume_name, wrapped_spec(&self.volume_name), &self.pod)?;
        wrapped.set_up_at(dir).await?;

        write_payload(dir, &payload)?;
        info!(
            "Wrote {} files of secret {:?} to {:?}",
            payload.len(),
            self.source.secret_name.as_deref().unwrap_or_default(),
            dir
        );
        Ok(())
    }
}

struct SecretVolumeUnmounter {
    host: VolumeHostRef,
    path: PathBuf,
    volume_name: String,
    pod_uid: String,
}

#[async_trait]
impl VolumeUnmounter for SecretVolumeUnmounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        let wrapped = self.host.new_wrapper_unmounter(
            &self.volume_name,
            wrapped_spec(&self.volume_name),
            &self.pod_uid,
        )?;
        wrapped.tear_down_at(dir).await
    }
}

/// Reject payload paths that are empty, absolute or walk upwards
fn validate_payload_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() {
        return Err(Error::UnsupportedVolume(format!(
            "invalid secret key path {:?}: must be a non-empty relative path",
            path
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::UnsupportedVolume(format!(
            "invalid secret key path {:?}: must not contain '..'",
            path
        )));
    }
    Ok(())
}

fn write_payload(dir: &Path, payload: &BTreeMap<String, (Vec<u8>, u32)>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for (path, (contents, mode)) in payload {
        let file = dir.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, contents)?;
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(*mode))?;
    }
    Ok(())
}
