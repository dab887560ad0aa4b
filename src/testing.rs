//! In-memory test doubles for the crate's ports

use crate::domain::claim::{claim_access_modes, claim_key, provisioned_volume_name, requested_storage};
use crate::domain::ports::{
    ClaimStore, EventRecorder, EventType, ObjectLookup, VolumeProvisioner, VolumeProvisionerRef,
};
use crate::error::{Error, Result};
use crate::mount::{
    device_name_from_mount, make_mount_args, Exec, ExecResult, MountPoint, Mounter,
};
use crate::volume::plugins::PluginHost;
use crate::volume::{
    NodeVolumeHost, VolumeHostConfig, VolumeHostRef, VolumeMounter, VolumePlugin, VolumeSpec,
    VolumeUnmounter,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec, Pod, Secret,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Exec
// =============================================================================

type ExecHandler = Box<dyn Fn(&str, &[String]) -> Result<ExecResult> + Send + Sync>;

/// Records every command and answers through a handler
pub struct FakeExec {
    handler: ExecHandler,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExec {
    /// Every command succeeds with no output
    pub fn new() -> Self {
        Self::with_result_handler(|_, _| Ok(ExecResult::default()))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> ExecResult + Send + Sync + 'static,
    {
        Self::with_result_handler(move |cmd, args| Ok(handler(cmd, args)))
    }

    pub fn with_result_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<ExecResult> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Exec for FakeExec {
    async fn run(&self, command: &str, args: &[String], _timeout: Duration) -> Result<ExecResult> {
        self.calls
            .lock()
            .push((command.to_string(), args.to_vec()));
        (self.handler)(command, args)
    }
}

// =============================================================================
// Mounter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAction {
    Mount {
        source: String,
        target: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    Unmount {
        target: PathBuf,
    },
    MakeShared {
        path: PathBuf,
    },
}

/// Mount table kept in memory
///
/// Bind mounts of a mounted path inherit its device, like the kernel table.
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<MountPoint>>,
    actions: Mutex<Vec<MountAction>>,
    devices: Mutex<HashSet<PathBuf>>,
    failing_mounts: AtomicUsize,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts(mounts: Vec<MountPoint>) -> Self {
        let mounter = Self::default();
        *mounter.mounts.lock() = mounts;
        mounter
    }

    /// The next `n` mounts fail
    pub fn fail_next_mounts(&self, n: usize) {
        self.failing_mounts.store(n, Ordering::SeqCst);
    }

    /// Report `path` as a device node
    pub fn add_device(&self, path: impl Into<PathBuf>) {
        self.devices.lock().insert(path.into());
    }

    pub fn actions(&self) -> Vec<MountAction> {
        self.actions.lock().clone()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let failing = self.failing_mounts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_mounts.store(failing - 1, Ordering::SeqCst);
            return Err(Error::MountFailed {
                command: "mount".into(),
                args: make_mount_args(source, target, fs_type, options),
                output: "mount: wrong fs type, bad option, bad superblock".into(),
                reason: "exit status 32".into(),
            });
        }

        self.actions.lock().push(MountAction::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });

        let mut mounts = self.mounts.lock();
        let device = if options.iter().any(|o| o == "bind") {
            mounts
                .iter()
                .rev()
                .find(|m| m.path == Path::new(source))
                .map(|m| m.device.clone())
                .unwrap_or_else(|| source.to_string())
        } else {
            source.to_string()
        };
        mounts.push(MountPoint {
            device,
            path: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            opts: options.to_vec(),
            freq: 0,
            pass: 0,
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.actions.lock().push(MountAction::Unmount {
            target: target.to_path_buf(),
        });
        let mut mounts = self.mounts.lock();
        match mounts.iter().rposition(|m| m.path == target) {
            Some(i) => {
                mounts.remove(i);
                Ok(())
            }
            None => Err(Error::UnmountFailed {
                target: target.display().to_string(),
                output: "umount: not mounted".into(),
                reason: "exit status 32".into(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<MountPoint>> {
        Ok(self.mounts.lock().clone())
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        if self.mounts.lock().iter().any(|m| m.path == path) {
            return Ok(false);
        }
        if path.exists() {
            Ok(true)
        } else {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound).into())
        }
    }

    async fn device_opened(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    async fn path_is_device(&self, path: &Path) -> Result<bool> {
        Ok(self.devices.lock().contains(path))
    }

    async fn get_device_name_from_mount(
        &self,
        mount_path: &Path,
        plugin_dir: &Path,
    ) -> Result<String> {
        device_name_from_mount(self, mount_path, plugin_dir).await
    }

    async fn make_shared(&self, path: &Path) -> Result<()> {
        self.actions.lock().push(MountAction::MakeShared {
            path: path.to_path_buf(),
        });
        Ok(())
    }
}

// =============================================================================
// Object Lookup
// =============================================================================

#[derive(Default)]
pub struct FakeObjectLookup {
    node: Option<Node>,
    secrets: HashMap<(String, String), Secret>,
    config_maps: HashMap<(String, String), ConfigMap>,
}

fn namespaced_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".into()),
        meta.name.clone().unwrap_or_default(),
    )
}

impl FakeObjectLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secrets.insert(namespaced_key(&secret.metadata), secret);
        self
    }

    pub fn with_config_map(mut self, map: ConfigMap) -> Self {
        self.config_maps.insert(namespaced_key(&map.metadata), map);
        self
    }
}

#[async_trait]
impl ObjectLookup for FakeObjectLookup {
    async fn node(&self) -> Result<Node> {
        self.node.clone().ok_or_else(|| Error::ResourceNotFound {
            kind: "Node".into(),
            name: "self".into(),
        })
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Secret".into(),
                name: format!("{}/{}", namespace, name),
            })
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "ConfigMap".into(),
                name: format!("{}/{}", namespace, name),
            })
    }
}

// =============================================================================
// Volume Host & Plugins
// =============================================================================

/// Host rooted in a fresh temp dir with fake mounter and exec
pub fn test_host() -> (Arc<NodeVolumeHost>, tempfile::TempDir) {
    test_host_with(Arc::new(FakeMounter::new()), Arc::new(FakeExec::new()))
}

pub fn test_host_with(
    mounter: Arc<FakeMounter>,
    exec: Arc<FakeExec>,
) -> (Arc<NodeVolumeHost>, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("temp dir");
    let host = NodeVolumeHost::new(
        VolumeHostConfig {
            root_dir: root.path().to_path_buf(),
            hostname: "node-1".into(),
            host_ip: None,
        },
        mounter,
        exec,
        Arc::new(FakeObjectLookup::new()),
    );
    (Arc::new(host), root)
}

/// Plugin claiming inline volumes by name; set-up just creates the directory
pub struct FakePlugin {
    name: String,
    supported: Vec<String>,
    host: PluginHost,
}

impl FakePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            supported: Vec::new(),
            host: PluginHost::default(),
        }
    }

    pub fn supporting(mut self, volume_names: &[&str]) -> Self {
        self.supported = volume_names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn initialized(&self) -> bool {
        self.host.get(&self.name).is_ok()
    }
}

impl VolumePlugin for FakePlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.host.set(&self.name, host)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.volume
            .as_ref()
            .map(|v| self.supported.contains(&v.name))
            .unwrap_or(false)
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let host = self.host.get(&self.name)?;
        Ok(Box::new(FakeVolume {
            path: host.pod_volume_dir(&uid, &self.name, &spec.name()),
        }))
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        let host = self.host.get(&self.name)?;
        Ok(Box::new(FakeVolume {
            path: host.pod_volume_dir(pod_uid, &self.name, volume_name),
        }))
    }
}

struct FakeVolume {
    path: PathBuf,
}

#[async_trait]
impl VolumeMounter for FakeVolume {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn set_up_at(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }
}

#[async_trait]
impl VolumeUnmounter for FakeVolume {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn tear_down_at(&self, dir: &Path) -> Result<()> {
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}

/// Provisionable plugin with scripted failures
pub struct FakeProvisionablePlugin {
    inner: FakePlugin,
    failing_provisions: AtomicUsize,
    failing_deletes: AtomicBool,
    provisions: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FakeProvisionablePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            inner: FakePlugin::new(name),
            failing_provisions: AtomicUsize::new(0),
            failing_deletes: AtomicBool::new(false),
            provisions: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_provisions(&self, n: usize) {
        self.failing_provisions.store(n, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.failing_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of provision calls, failed ones included
    pub fn provision_calls(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

impl VolumePlugin for FakeProvisionablePlugin {
    fn init(&self, host: VolumeHostRef) -> Result<()> {
        self.inner.init(host)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        self.inner.can_support(spec)
    }

    fn new_mounter(&self, spec: &VolumeSpec, pod: &Pod) -> Result<Box<dyn VolumeMounter>> {
        self.inner.new_mounter(spec, pod)
    }

    fn new_unmounter(&self, volume_name: &str, pod_uid: &str) -> Result<Box<dyn VolumeUnmounter>> {
        self.inner.new_unmounter(volume_name, pod_uid)
    }

    fn as_provisioner(self: Arc<Self>) -> Option<VolumeProvisionerRef> {
        Some(self)
    }
}

#[async_trait]
impl VolumeProvisioner for FakeProvisionablePlugin {
    async fn provision(
        &self,
        claim: &PersistentVolumeClaim,
        _class: &StorageClass,
    ) -> Result<PersistentVolume> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_provisions.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_provisions.store(failing - 1, Ordering::SeqCst);
            return Err(Error::ProvisioningFailed {
                claim: claim_key(claim),
                reason: "backend out of capacity".into(),
            });
        }

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(provisioned_volume_name(claim)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: requested_storage(claim)
                    .map(|q| BTreeMap::from([("storage".to_string(), q)])),
                access_modes: Some(claim_access_modes(claim)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        if self.failing_deletes.load(Ordering::SeqCst) {
            return Err(Error::Rpc("backend unreachable".into()));
        }
        self.deleted
            .lock()
            .push(volume.metadata.name.clone().unwrap_or_default());
        Ok(())
    }

    fn provisioner_name(&self) -> &str {
        self.inner.name()
    }
}

// =============================================================================
// Claim Store & Events
// =============================================================================

/// Claims, volumes and classes held in memory
#[derive(Default)]
pub struct MemoryClaimStore {
    claims: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
    volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    classes: Mutex<BTreeMap<String, StorageClass>>,
    failing_creates: AtomicUsize,
    create_attempts: AtomicUsize,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        self.claims.lock().insert(claim_key(&claim), claim);
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.volumes.lock().insert(name, volume);
    }

    pub fn add_class(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.classes.lock().insert(name, class);
    }

    pub fn claim(&self, key: &str) -> Option<PersistentVolumeClaim> {
        self.claims.lock().get(key).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().get(name).cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().len()
    }

    /// The next `n` volume creations fail
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claim(&format!("{}/{}", namespace, name)))
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims.lock().values().cloned().collect())
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes.lock().values().cloned().collect())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.classes.lock().values().cloned().collect())
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Rpc("etcd unavailable".into()));
        }

        let name = volume.metadata.name.clone().unwrap_or_default();
        let mut volumes = self.volumes.lock();
        if volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        let mut created = volume.clone();
        created.metadata.resource_version = Some("1".into());
        volumes.insert(name, created.clone());
        Ok(created)
    }

    async fn bind_volume(
        &self,
        volume: &PersistentVolume,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolume> {
        let name = volume.metadata.name.clone().unwrap_or_default();
        let mut volumes = self.volumes.lock();
        let stored = volumes.get_mut(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: "PersistentVolume".into(),
            name: name.clone(),
        })?;
        stored
            .spec
            .get_or_insert_with(Default::default)
            .claim_ref = Some(ObjectReference {
            kind: Some("PersistentVolumeClaim".into()),
            namespace: claim.metadata.namespace.clone(),
            name: claim.metadata.name.clone(),
            uid: claim.metadata.uid.clone(),
            ..Default::default()
        });
        Ok(stored.clone())
    }

    async fn bind_claim(
        &self,
        claim: &PersistentVolumeClaim,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolumeClaim> {
        let key = claim_key(claim);
        let mut claims = self.claims.lock();
        let stored = claims.get_mut(&key).ok_or_else(|| Error::ResourceNotFound {
            kind: "PersistentVolumeClaim".into(),
            name: key.clone(),
        })?;
        stored.spec.get_or_insert_with(Default::default).volume_name =
            volume.metadata.name.clone();
        stored.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });
        Ok(stored.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub claim: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn record(
        &self,
        claim: &PersistentVolumeClaim,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().push(RecordedEvent {
            claim: claim_key(claim),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

// =============================================================================
// Object Builders
// =============================================================================

pub fn pod(name: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Pending ReadWriteOnce claim with uid `uid-<name>`
pub fn claim(
    namespace: &str,
    name: &str,
    request: Option<&str>,
    class: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: class.map(String::from),
            resources: request.map(|r| VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(r.into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        }),
    }
}

pub fn storage_class(
    name: &str,
    provisioner: &str,
    parameters: &[(&str, &str)],
    is_default: bool,
) -> StorageClass {
    let annotations = is_default.then(|| {
        BTreeMap::from([(
            crate::provisioning::DEFAULT_CLASS_ANNOTATION.to_string(),
            "true".to_string(),
        )])
    });
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations,
            ..Default::default()
        },
        provisioner: provisioner.into(),
        parameters: (!parameters.is_empty()).then(|| {
            parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }),
        ..Default::default()
    }
}

/// `class` with `labels` added
pub fn labeled(mut class: StorageClass, labels: &[(&str, &str)]) -> StorageClass {
    class.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    class
}

/// Available volume of `capacity` in `class`
pub fn volume(name: &str, capacity: &str, class: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(capacity.into()),
            )])),
            access_modes: Some(vec!["ReadWriteOnce".into(), "ReadOnlyMany".into()]),
            storage_class_name: Some(class.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
