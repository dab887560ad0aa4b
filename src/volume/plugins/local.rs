//! Local persistent volumes
//!
//! A directory source is bind-mounted into the pod. A block device is first
//! formatted (if blank) and mounted at `<plugin dir>/mounts/<pv name>`, then
//! bind-mounted from there; the global mount is removed when its last pod
//! mount goes away.

use super::PluginHost;
use crate::error::{Error, Result};
use crate::mount::{get_mount_refs, SafeFormatAndMount, MOUNTS_IN_GLOBAL_PD_PATH};
use crate::volume::util::{cleanup_failed_mount, is_mounted, make_mount_dir, unmount_mount_point};
use crate::volume::{pod_uid, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec, VolumeUnmounter};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const PLUGIN_NAME: &str = "kubernetes.io/local-volume";

pub struct LocalVolumePlugin {
    host: PluginHost,
}

impl LocalVolumePlugin {
    pub fn new() -> Self {
        Self {
            host: PluginHost::default(),
        }
    }
}

impl Default for LocalVolumePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumePlugin for LocalVolumePlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.host.set(PLUGIN_NAME, host)
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.persistent_volume
            .as_ref()
            .and_then(|pv| pv.spec.as_ref())
            .map(|s| s.local.is_some())
            .unwrap_or(false)
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        let pv = spec
            .persistent_volume
            .as_ref()
            .ok_or_else(|| Error::UnsupportedVolume("local volumes need a PersistentVolume".into()))?;
        let pv_spec = pv.spec.as_ref();
        let local = pv_spec
            .and_then(|s| s.local.as_ref())
            .ok_or_else(|| Error::UnsupportedVolume("spec is not a local volume".into()))?;
        let host = self.host.get(PLUGIN_NAME)?;
        let uid = pod_uid(pod)?;
        let volume_name = spec.name();

        Ok(Box::new(LocalVolumeMounter {
            path: host.pod_volume_dir(&uid, PLUGIN_NAME, &volume_name),
            global_path: host
                .plugin_dir(PLUGIN_NAME)
                .join(MOUNTS_IN_GLOBAL_PD_PATH)
                .join(&volume_name),
            host,
            source: local.path.clone(),
            fs_type: local.fs_type.clone().unwrap_or_default(),
            mount_options: pv_spec
                .and_then(|s| s.mount_options.clone())
                .unwrap_or_default(),
            read_only: spec.read_only,
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(PLUGIN_NAME)?;
        Ok(Box::new(LocalVolumeUnmounter {
            path: host.pod_volume_dir(pod_uid, PLUGIN_NAME, volume_name),
            host,
        }))
    }
}

struct LocalVolumeMounter {
    host: VolumeHostRef,
    path: PathBuf,
    global_path: PathBuf,
    source: String,
    fs_type: String,
    mount_options: Vec<String>,
    read_only: bool,
}

impl LocalVolumeMounter {
    /// Format-and-mount the device at the global path unless already mounted
    async fn mount_device(&self) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), &self.global_path).await? {
            debug!("Device {} already mounted at {:?}", self.source, self.global_path);
            return Ok(());
        }
        make_mount_dir(&self.global_path)?;

        let safe = SafeFormatAndMount::new(mounter.clone(), self.host.exec(PLUGIN_NAME));
        if let Err(e) = safe
            .format_and_mount(&self.source, &self.global_path, &self.fs_type, &self.mount_options)
            .await
        {
            error!(
                "Mount of device {} at {:?} failed: {}",
                self.source, self.global_path, e
            );
            cleanup_failed_mount(mounter.as_ref(), &self.global_path).await;
            return Err(e);
        }
        info!("Mounted device {} at {:?}", self.source, self.global_path);
        Ok(())
    }
}

#[async_trait]
impl VolumeMounter for LocalVolumeMounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        if is_mounted(mounter.as_ref(), dir).await? {
            debug!("Local volume already mounted at {:?}", dir);
            return Ok(());
        }

        let bind_source = if mounter.path_is_device(Path::new(&self.source)).await? {
            self.mount_device().await?;
            self.global_path.to_string_lossy().into_owned()
        } else {
            self.source.clone()
        };

        make_mount_dir(dir)?;
        let mut options = vec!["bind".to_string()];
        if self.read_only {
            options.push("ro".to_string());
        }
        if let Err(e) = mounter.mount(&bind_source, dir, "", &options).await {
            error!("Bind mount of {} at {:?} failed: {}", bind_source, dir, e);
            cleanup_failed_mount(mounter.as_ref(), dir).await;
            return Err(e);
        }
        Ok(())
    }
}

struct LocalVolumeUnmounter {
    host: VolumeHostRef,
    path: PathBuf,
}

#[async_trait]
impl VolumeUnmounter for LocalVolumeUnmounter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        let mounter = self.host.mounter(PLUGIN_NAME);
        let plugin_dir = self.host.plugin_dir(PLUGIN_NAME);

        if !is_mounted(mounter.as_ref(), dir).await? {
            return unmount_mount_point(mounter.as_ref(), dir).await;
        }

        let volume_name = mounter.get_device_name_from_mount(dir, &plugin_dir).await?;
        unmount_mount_point(mounter.as_ref(), dir).await?;

        let global_path = plugin_dir.join(MOUNTS_IN_GLOBAL_PD_PATH).join(&volume_name);
        if !is_mounted(mounter.as_ref(), &global_path).await? {
            return Ok(());
        }
        let refs = get_mount_refs(mounter.as_ref(), &global_path).await?;
        if refs.is_empty() {
            info!("Last pod mount of {} gone, unmounting {:?}", volume_name, global_path);
            unmount_mount_point(mounter.as_ref(), &global_path).await?;
        } else {
            debug!("{:?} still referenced by {} mounts", global_path, refs.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{ExecResult, Mounter};
    use crate::testing::{pod, test_host_with, FakeExec, FakeMounter};
    use crate::volume::VolumeHost;
    use k8s_openapi::api::core::v1::{LocalVolumeSource, PersistentVolume, PersistentVolumeSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn local_spec(name: &str, path: &str) -> VolumeSpec {
        VolumeSpec::from_persistent_volume(
            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(name.into()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    local: Some(LocalVolumeSource {
                        path: path.into(),
                        fs_type: Some("ext4".into()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        )
    }

    #[tokio::test]
    async fn test_directory_is_bind_mounted() {
        let mounter = Arc::new(FakeMounter::new());
        let (host, _root) = test_host_with(mounter.clone(), Arc::new(FakeExec::new()));
        let plugin = LocalVolumePlugin::new();
        plugin.init(host).unwrap();

        let m = plugin
            .new_mounter(&local_spec("pv-dir", "/mnt/disks/vol1"), &pod("web", "uid-1"))
            .unwrap();
        m.set_up().await.unwrap();

        let mounts = mounter.list().await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].device, "/mnt/disks/vol1");
        assert_eq!(mounts[0].opts, vec!["bind"]);
    }

    #[tokio::test]
    async fn test_block_device_global_mount_lifecycle() {
        let mounter = Arc::new(FakeMounter::new());
        mounter.add_device("/dev/sdb");
        let exec = Arc::new(FakeExec::with_handler(|cmd, _| match cmd {
            "lsblk" => ExecResult {
                stdout: b"ext4\n".to_vec(),
                ..Default::default()
            },
            _ => ExecResult::default(),
        }));
        let (host, _root) = test_host_with(mounter.clone(), exec.clone());
        let plugin = LocalVolumePlugin::new();
        plugin.init(host.clone()).unwrap();
        let spec = local_spec("pv-1", "/dev/sdb");

        let first = plugin.new_mounter(&spec, &pod("a", "uid-a")).unwrap();
        let second = plugin.new_mounter(&spec, &pod("b", "uid-b")).unwrap();
        first.set_up().await.unwrap();
        second.set_up().await.unwrap();

        let global = host
            .plugin_dir(PLUGIN_NAME)
            .join(MOUNTS_IN_GLOBAL_PD_PATH)
            .join("pv-1");
        assert!(global.ends_with("plugins/kubernetes.io~local-volume/mounts/pv-1"));
        let mounts = mounter.list().await.unwrap();
        assert_eq!(mounts.len(), 3);
        assert!(mounts.iter().all(|m| m.device == "/dev/sdb"));
        // The device was checked and mounted once
        assert_eq!(
            exec.calls().iter().filter(|(c, _)| c == "fsck").count(),
            1
        );

        plugin
            .new_unmounter("pv-1", "uid-a")
            .unwrap()
            .tear_down()
            .await
            .unwrap();
        assert!(is_mounted(mounter.as_ref(), &global).await.unwrap());

        // Pod directories are named after the spec, so the volume name is
        // resolved through the global mount
        plugin
            .new_unmounter("pv-1", "uid-b")
            .unwrap()
            .tear_down()
            .await
            .unwrap();
        assert!(mounter.list().await.unwrap().is_empty());
        assert!(!global.exists());
    }
}
