//! Volume Host
//!
//! The node-side services volume plugins are allowed to use. Exec and mount
//! calls for a plugin are routed, in order of preference, to:
//!
//! 1. the helper exec server listening on the plugin's socket
//! 2. a running mount pod labelled for the plugin
//! 3. this host

use super::{
    pod_plugin_dir, pod_volume_dir, MountPodManager, VolumeMounter,
    VolumePluginRegistry, VolumeSpec, VolumeUnmounter, WRAPPED_VOLUME_PREFIX,
};
use crate::domain::ports::{CloudProviderRef, ObjectLookup, ObjectLookupRef};
use crate::error::{Error, Result};
use crate::mount::{ErrorExec, ExecMounter, ExecRef, MounterRef, PodExec};
use crate::rpc::{volume_plugin_socket_path, SocketExec};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::Client;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

// =============================================================================
// Host Port
// =============================================================================

/// Services a volume plugin may use
#[async_trait]
pub trait VolumeHost: Send + Sync {
    /// Node-global directory of `plugin`
    fn plugin_dir(&self, plugin: &str) -> PathBuf;

    /// Directory a pod's volume is set up at
    fn pod_volume_dir(&self, pod_uid: &str, plugin: &str, volume: &str) -> PathBuf;

    /// Per-pod scratch directory of `plugin`
    fn pod_plugin_dir(&self, pod_uid: &str, plugin: &str) -> PathBuf;

    /// Mounter to use for `plugin`
    fn mounter(&self, plugin: &str) -> MounterRef;

    /// Executor to use for `plugin`
    fn exec(&self, plugin: &str) -> ExecRef;

    fn cloud_provider(&self) -> Option<CloudProviderRef>;

    fn hostname(&self) -> &str;

    async fn host_ip(&self) -> Result<IpAddr>;

    async fn node_allocatable(&self) -> Result<BTreeMap<String, Quantity>>;

    async fn node_labels(&self) -> Result<BTreeMap<String, String>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    /// Mounter for an inner volume of a wrapper plugin, named `wrapped_<volume_name>`
    fn new_wrapper_mounter(
        &self,
        volume_name: &str,
        spec: VolumeSpec,
        pod: &Pod,
    ) -> Result<Box<dyn VolumeMounter>>;

    /// Unmounter for an inner volume created by [`VolumeHost::new_wrapper_mounter`]
    fn new_wrapper_unmounter(
        &self,
        volume_name: &str,
        spec: VolumeSpec,
        pod_uid: &str,
    ) -> Result<Box<dyn VolumeUnmounter>>;
}

pub type VolumeHostRef = Arc<dyn VolumeHost>;

// =============================================================================
// Node Volume Host
// =============================================================================

/// Configuration for the node volume host
#[derive(Debug, Clone)]
pub struct VolumeHostConfig {
    /// Root of the plugin and pod directories
    pub root_dir: PathBuf,
    /// Name of this node
    pub hostname: String,
    /// Address reported to plugins; looked up on the Node object when unset
    pub host_ip: Option<IpAddr>,
}

impl Default for VolumeHostConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(super::DEFAULT_ROOT_DIR),
            hostname: String::new(),
            host_ip: None,
        }
    }
}

struct MountPods {
    manager: Arc<MountPodManager>,
    client: Client,
}

/// [`VolumeHost`] backed by this node
pub struct NodeVolumeHost {
    config: VolumeHostConfig,
    mounter: MounterRef,
    exec: ExecRef,
    lookup: ObjectLookupRef,
    cloud: Option<CloudProviderRef>,
    registry: OnceLock<Weak<VolumePluginRegistry>>,
    mount_pods: OnceLock<MountPods>,
}

impl NodeVolumeHost {
    /// Create a host around the local mounter and executor
    pub fn new(
        config: VolumeHostConfig,
        mounter: MounterRef,
        exec: ExecRef,
        lookup: ObjectLookupRef,
    ) -> Self {
        Self {
            config,
            mounter,
            exec,
            lookup,
            cloud: None,
            registry: OnceLock::new(),
            mount_pods: OnceLock::new(),
        }
    }

    pub fn with_cloud_provider(mut self, cloud: CloudProviderRef) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Initialize `plugins` against this host
    ///
    /// Only one registry can be attached to a host.
    pub fn initialize_plugins(
        self: &Arc<Self>,
        plugins: Vec<super::VolumePluginRef>,
    ) -> Result<Arc<VolumePluginRegistry>> {
        if self.registry.get().is_some() {
            return Err(Error::Configuration(
                "volume plugins already initialized for this host".into(),
            ));
        }
        let host: super::VolumeHostRef = self.clone();
        let registry = VolumePluginRegistry::init(plugins, host)?;
        self.registry
            .set(Arc::downgrade(&registry))
            .map_err(|_| Error::Configuration("volume plugins initialized concurrently".into()))?;
        Ok(registry)
    }

    /// Route exec for plugins with a running mount pod into that pod
    pub fn set_mount_pods(&self, manager: Arc<MountPodManager>, client: Client) -> Result<()> {
        self.mount_pods
            .set(MountPods { manager, client })
            .map_err(|_| Error::Configuration("mount pod manager already set".into()))
    }

    fn registry(&self) -> Result<Arc<VolumePluginRegistry>> {
        self.registry
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Internal("volume plugins are not initialized".into()))
    }

    /// Executor that runs outside this host for `plugin`, if any
    fn remote_exec(&self, plugin: &str) -> Option<ExecRef> {
        let socket = volume_plugin_socket_path(&self.config.root_dir, plugin);
        if is_socket(&socket) {
            debug!("Using exec socket {} for {}", socket.display(), plugin);
            let exec: ExecRef = match SocketExec::probe(&socket) {
                Ok(exec) => Arc::new(exec),
                Err(e) => {
                    warn!("Exec socket for {} is not usable: {}", plugin, e);
                    Arc::new(ErrorExec::new(e.to_string()))
                }
            };
            return Some(exec);
        }

        let mount_pods = self.mount_pods.get()?;
        let pod = mount_pods.manager.get_pod(plugin)?;
        debug!(
            "Using mount pod {}/{} for {}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
            plugin
        );
        let exec: ExecRef = Arc::new(PodExec::new(
            pod.as_ref().clone(),
            mount_pods.client.clone(),
        ));
        Some(exec)
    }

    async fn node(&self) -> Result<Node> {
        self.lookup.node().await
    }
}

#[async_trait]
impl VolumeHost for NodeVolumeHost {
    fn plugin_dir(&self, plugin: &str) -> PathBuf {
        super::plugin_dir(&self.config.root_dir, plugin)
    }

    fn pod_volume_dir(&self, pod_uid: &str, plugin: &str, volume: &str) -> PathBuf {
        pod_volume_dir(&self.config.root_dir, pod_uid, plugin, volume)
    }

    fn pod_plugin_dir(&self, pod_uid: &str, plugin: &str) -> PathBuf {
        pod_plugin_dir(&self.config.root_dir, pod_uid, plugin)
    }

    fn mounter(&self, plugin: &str) -> MounterRef {
        match self.remote_exec(plugin) {
            Some(exec) => {
                let mounter: MounterRef = Arc::new(ExecMounter::new(exec, self.mounter.clone()));
                mounter
            }
            None => self.mounter.clone(),
        }
    }

    fn exec(&self, plugin: &str) -> ExecRef {
        self.remote_exec(plugin)
            .unwrap_or_else(|| self.exec.clone())
    }

    fn cloud_provider(&self) -> Option<CloudProviderRef> {
        self.cloud.clone()
    }

    fn hostname(&self) -> &str {
        &self.config.hostname
    }

    async fn host_ip(&self) -> Result<IpAddr> {
        if let Some(ip) = self.config.host_ip {
            return Ok(ip);
        }
        let node = self.node().await?;
        let addresses = node
            .status
            .and_then(|s| s.addresses)
            .unwrap_or_default();
        for kind in ["InternalIP", "ExternalIP"] {
            if let Some(ip) = addresses
                .iter()
                .filter(|a| a.type_ == kind)
                .find_map(|a| a.address.parse::<IpAddr>().ok())
            {
                return Ok(ip);
            }
        }
        Err(Error::Configuration(format!(
            "node {} has no usable address",
            self.config.hostname
        )))
    }

    async fn node_allocatable(&self) -> Result<BTreeMap<String, Quantity>> {
        let node = self.node().await?;
        Ok(node
            .status
            .and_then(|s| s.allocatable)
            .unwrap_or_default())
    }

    async fn node_labels(&self) -> Result<BTreeMap<String, String>> {
        let node = self.node().await?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.lookup.secret(namespace, name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.lookup.config_map(namespace, name).await
    }

    fn new_wrapper_mounter(
        &self,
        volume_name: &str,
        mut spec: VolumeSpec,
        pod: &Pod,
    ) -> Result<Box<dyn VolumeMounter>> {
        if let Some(volume) = spec.volume.as_mut() {
            volume.name = format!("{}{}", WRAPPED_VOLUME_PREFIX, volume_name);
        }
        let plugin = self.registry()?.find_plugin_by_spec(&spec)?;
        plugin.new_mounter(&spec, pod)
    }

    fn new_wrapper_unmounter(
        &self,
        volume_name: &str,
        mut spec: VolumeSpec,
        pod_uid: &str,
    ) -> Result<Box<dyn VolumeUnmounter>> {
        if let Some(volume) = spec.volume.as_mut() {
            volume.name = format!("{}{}", WRAPPED_VOLUME_PREFIX, volume_name);
        }
        let plugin = self.registry()?.find_plugin_by_spec(&spec)?;
        plugin.new_unmounter(&spec.name(), pod_uid)
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

// =============================================================================
// Kubernetes Lookups
// =============================================================================

/// [`ObjectLookup`] reading straight from the API server
#[derive(Clone)]
pub struct KubeObjectLookup {
    client: Client,
    node_name: String,
}

impl KubeObjectLookup {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl ObjectLookup for KubeObjectLookup {
    async fn node(&self) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(&self.node_name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get(name).await?)
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(maps.get(name).await?)
    }
}
