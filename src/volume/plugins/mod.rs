//! Built-in volume plugins
//!
//! - host-path: bind-mounts a host directory; provisions directories under a base path
//! - empty-dir: per-pod scratch directory, tmpfs-backed for medium `Memory`
//! - secret: writes a secret's keys into a memory-backed empty-dir
//! - nfs: network filesystem mount, remote-exec capable
//! - local-volume: local directories and block devices from PersistentVolumes

pub mod empty_dir;
pub mod host_path;
pub mod local;
pub mod nfs;
pub mod secret;

pub use empty_dir::EmptyDirPlugin;
pub use host_path::{HostPathConfig, HostPathPlugin};
pub use local::LocalVolumePlugin;
pub use nfs::NfsPlugin;
pub use secret::SecretPlugin;

use super::{VolumeHostRef, VolumePluginRef};
use crate::error::{Error, Result};
use std::sync::{Arc, OnceLock};

/// Factory for the built-in plugins
pub struct PluginFactory;

impl PluginFactory {
    /// Create a plugin by name
    pub fn create(name: &str, config: &PluginConfig) -> Result<VolumePluginRef> {
        match name {
            host_path::PLUGIN_NAME => Ok(Arc::new(HostPathPlugin::new(config.host_path.clone()))),
            empty_dir::PLUGIN_NAME => Ok(Arc::new(EmptyDirPlugin::new())),
            secret::PLUGIN_NAME => Ok(Arc::new(SecretPlugin::new())),
            nfs::PLUGIN_NAME => Ok(Arc::new(NfsPlugin::new())),
            local::PLUGIN_NAME => Ok(Arc::new(LocalVolumePlugin::new())),
            _ => Err(Error::PluginNotFound(format!(
                "no built-in volume plugin named {:?}",
                name
            ))),
        }
    }

    /// Every built-in plugin
    pub fn all(config: &PluginConfig) -> Vec<VolumePluginRef> {
        vec![
            Arc::new(HostPathPlugin::new(config.host_path.clone())),
            Arc::new(EmptyDirPlugin::new()),
            Arc::new(SecretPlugin::new()),
            Arc::new(NfsPlugin::new()),
            Arc::new(LocalVolumePlugin::new()),
        ]
    }
}

/// Combined plugin configuration
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub host_path: HostPathConfig,
}

/// Host handed to a plugin at init
#[derive(Default)]
pub(crate) struct PluginHost(OnceLock<VolumeHostRef>);

impl PluginHost {
    pub(crate) fn set(&self, plugin: &str, host: VolumeHostRef) -> Result<()> {
        self.0.set(host).map_err(|_| Error::PluginRegistration {
            plugin: plugin.to_string(),
            reason: "plugin initialized twice".into(),
        })
    }

    pub(crate) fn get(&self, plugin: &str) -> Result<VolumeHostRef> {
        self.0
            .get()
            .cloned()
            .ok_or_else(|| Error::Internal(format!("volume plugin {} is not initialized", plugin)))
    }
}
