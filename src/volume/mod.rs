//! Volume plugins
//!
//! A [`VolumePlugin`] owns one kind of volume source. The
//! [`VolumePluginRegistry`] resolves a [`VolumeSpec`] to exactly one plugin,
//! and every plugin reaches the node (directories, mounter, exec, API lookups)
//! only through the [`VolumeHost`] it receives at init.

pub mod host;
pub mod mount_pod;
pub mod plugins;
pub mod registry;
pub mod util;

pub use host::{KubeObjectLookup, NodeVolumeHost, VolumeHost, VolumeHostConfig, VolumeHostRef};
pub use mount_pod::MountPodManager;
pub use registry::VolumePluginRegistry;

use crate::domain::ports::VolumeProvisionerRef;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod, Volume};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default node root directory
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/kubelet";

/// Prefix of the inner volume name used by wrapper plugins
pub const WRAPPED_VOLUME_PREFIX: &str = "wrapped_";

/// Make a qualified plugin name usable as one path component
pub fn escape_plugin_name(name: &str) -> String {
    name.replace('/', "~")
}

/// `<root>/plugins/<escaped plugin>`
pub fn plugin_dir(root: &Path, plugin: &str) -> PathBuf {
    root.join("plugins").join(escape_plugin_name(plugin))
}

/// `<root>/pods/<uid>/volumes/<escaped plugin>/<volume>`
pub fn pod_volume_dir(root: &Path, pod_uid: &str, plugin: &str, volume: &str) -> PathBuf {
    root.join("pods")
        .join(pod_uid)
        .join("volumes")
        .join(escape_plugin_name(plugin))
        .join(volume)
}

/// `<root>/pods/<uid>/plugins/<escaped plugin>`
pub fn pod_plugin_dir(root: &Path, pod_uid: &str, plugin: &str) -> PathBuf {
    root.join("pods")
        .join(pod_uid)
        .join("plugins")
        .join(escape_plugin_name(plugin))
}

// =============================================================================
// Volume Spec
// =============================================================================

/// An inline pod volume or a persistent volume, as handed to plugins
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub volume: Option<Volume>,
    pub persistent_volume: Option<PersistentVolume>,
    pub read_only: bool,
}

impl VolumeSpec {
    pub fn from_volume(volume: Volume) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn from_persistent_volume(volume: PersistentVolume, read_only: bool) -> Self {
        Self {
            persistent_volume: Some(volume),
            read_only,
            ..Default::default()
        }
    }

    /// Volume name, or the persistent volume's object name
    pub fn name(&self) -> String {
        if let Some(v) = &self.volume {
            return v.name.clone();
        }
        self.persistent_volume
            .as_ref()
            .and_then(|pv| pv.metadata.name.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Plugin Traits
// =============================================================================

/// Sets up a volume in a pod directory
#[async_trait]
pub trait VolumeMounter: Send + Sync {
    /// Directory the volume is mounted at for its pod
    fn path(&self) -> PathBuf;

    async fn set_up(&self) -> Result<()> {
        self.set_up_at(&self.path()).await
    }

    /// Set the volume up at `dir`; a no-op when already set up
    async fn set_up_at(&self, dir: &Path) -> Result<()>;
}

/// Tears down a volume previously set up by the matching mounter
#[async_trait]
pub trait VolumeUnmounter: Send + Sync {
    fn path(&self) -> PathBuf;

    async fn tear_down(&self) -> Result<()> {
        self.tear_down_at(&self.path()).await
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()>;
}

/// One kind of volume source
pub trait VolumePlugin: Send + Sync {
    /// Called once by the registry before any other method
    fn init(&self, host: VolumeHostRef) -> Result<()>;

    /// Qualified plugin name, e.g. `kubernetes.io/nfs`
    fn name(&self) -> &str;

    /// Whether this plugin handles `spec`
    fn can_support(&self, spec: &VolumeSpec) -> bool;

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>>;

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>>;

    /// The provisioner half of this plugin, if it creates backing volumes
    fn as_provisioner(self: Arc<Self>) -> Option<VolumeProvisionerRef> {
        None
    }
}

pub type VolumePluginRef = Arc<dyn VolumePlugin>;

/// UID of `pod`, required to derive its volume directories
pub(crate) fn pod_uid(pod: &Pod) -> Result<String> {
    pod.metadata.uid.clone().ok_or_else(|| {
        crate::error::Error::UnsupportedVolume(format!(
            "pod {} has no uid",
            pod.metadata.name.as_deref().unwrap_or_default()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_directory_layout() {
        let root = Path::new("/var/lib/kubelet");
        assert_eq!(
            pod_volume_dir(root, "uid-1", "kubernetes.io/nfs", "data"),
            PathBuf::from("/var/lib/kubelet/pods/uid-1/volumes/kubernetes.io~nfs/data")
        );
        assert_eq!(
            pod_plugin_dir(root, "uid-1", "kubernetes.io/nfs"),
            PathBuf::from("/var/lib/kubelet/pods/uid-1/plugins/kubernetes.io~nfs")
        );
        assert_eq!(
            plugin_dir(root, "kubernetes.io/local-volume"),
            PathBuf::from("/var/lib/kubelet/plugins/kubernetes.io~local-volume")
        );
    }

    #[test]
    fn test_plugin_dirs_stay_under_root() {
        let root = Path::new("/var/lib/kubelet");
        let dir = plugin_dir(root, "../../etc");
        assert_eq!(dir, PathBuf::from("/var/lib/kubelet/plugins/..~..~etc"));
        assert_eq!(dir.parent(), Some(Path::new("/var/lib/kubelet/plugins")));
        assert_eq!(
            pod_plugin_dir(root, "uid-1", "../../etc").parent(),
            Some(Path::new("/var/lib/kubelet/pods/uid-1/plugins"))
        );
    }

    #[test]
    fn test_spec_name() {
        let spec = VolumeSpec::from_volume(Volume {
            name: "cache".into(),
            ..Default::default()
        });
        assert_eq!(spec.name(), "cache");

        let spec = VolumeSpec::from_persistent_volume(
            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some("pv-7".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
            true,
        );
        assert_eq!(spec.name(), "pv-7");
        assert!(spec.read_only);
    }
}

#[cfg(test)]
impl std::fmt::Debug for dyn VolumePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePlugin").field("name", &self.name()).finish()
    }
}
