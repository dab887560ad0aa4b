//! Provisioning Controller
//!
//! Drives each pending claim towards a bound volume:
//! - bind an existing volume when one fits
//! - otherwise pick a storage class and provision a new volume through the
//!   class's provisioner
//! - persist the volume object with bounded retries, releasing the backing
//!   volume again if that never succeeds
//!
//! Claims are processed through a [`WorkQueue`], so a claim is never synced
//! by two workers at once.

use super::binder::{find_matching_volume, is_prebound_to};
use super::events::ProvisioningEvent;
use super::matcher::StorageClassMatcher;
use super::metrics::{
    record_provision, BINDS, OUTCOME_CLEANED_UP, OUTCOME_FAILED, OUTCOME_SUCCEEDED,
    PROVISION_DURATION, QUEUE_DEPTH, SYNC_ERRORS,
};
use super::queue::{WorkQueue, WorkQueueConfig};
use super::{BOUND_BY_CONTROLLER_ANNOTATION, DEFAULT_CLASS_ANNOTATION, PROVISIONED_BY_ANNOTATION};
use crate::domain::claim::{claim_key, provisioned_volume_name};
use crate::domain::ports::{ClaimStoreRef, EventRecorderRef, VolumeProvisionerRef};
use crate::error::{Error, ErrorAction, Result};
use crate::validation::{validate_storage_class, ValidationOptions};
use crate::volume::VolumePluginRegistry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the provisioning controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Class used for claims without one; falls back to the annotated default
    pub default_storage_class: Option<String>,
    /// Interval at which every unbound claim is queued again
    pub resync_period: Duration,
    /// Number of concurrent workers
    pub workers: usize,
    /// Attempts at persisting a provisioned volume object
    pub create_attempts: u32,
    /// First delay between volume object creation attempts
    pub create_initial_backoff: Duration,
    /// Cap for the delay between volume object creation attempts
    pub create_max_backoff: Duration,
    /// Per-claim retry delays
    pub queue: WorkQueueConfig,
    /// Fixed seed for class selection
    pub seed: Option<u64>,
    /// Rules a class must pass before it is used
    pub validation: ValidationOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_storage_class: None,
            resync_period: Duration::from_secs(15),
            workers: 4,
            create_attempts: 5,
            create_initial_backoff: Duration::from_millis(100),
            create_max_backoff: Duration::from_secs(10),
            queue: WorkQueueConfig::default(),
            seed: None,
            validation: ValidationOptions::default(),
        }
    }
}

// =============================================================================
// Claim State
// =============================================================================

/// Where a claim is in the provisioning flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimState {
    Unbound,
    MatchingVolume,
    Provisioning,
    Binding,
    CleaningUp,
    Bound,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimState::Unbound => "Unbound",
            ClaimState::MatchingVolume => "MatchingVolume",
            ClaimState::Provisioning => "Provisioning",
            ClaimState::Binding => "Binding",
            ClaimState::CleaningUp => "CleaningUp",
            ClaimState::Bound => "Bound",
        };
        write!(f, "{}", s)
    }
}

fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    let has_volume = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .map_or(false, |v| !v.is_empty());
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    has_volume && phase == Some("Bound")
}

fn is_lost(claim: &PersistentVolumeClaim) -> bool {
    claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Lost")
}

/// Reference stamped into `spec.claimRef` of a volume reserved for `claim`
pub fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("PersistentVolumeClaim".into()),
        namespace: Some(
            claim
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".into()),
        ),
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .ok_or_else(|| Error::Internal(format!("malformed claim key {:?}", key)))
}

// =============================================================================
// Provisioning Controller
// =============================================================================

pub struct ProvisioningController {
    config: ControllerConfig,
    store: ClaimStoreRef,
    plugins: Arc<VolumePluginRegistry>,
    events: EventRecorderRef,
    matcher: StorageClassMatcher,
    queue: Arc<WorkQueue>,
    states: DashMap<String, ClaimState>,
}

impl ProvisioningController {
    pub fn new(
        config: ControllerConfig,
        store: ClaimStoreRef,
        plugins: Arc<VolumePluginRegistry>,
        events: EventRecorderRef,
    ) -> Arc<Self> {
        let matcher = match config.seed {
            Some(seed) => StorageClassMatcher::with_seed(seed),
            None => StorageClassMatcher::new(),
        };
        let queue = WorkQueue::new(config.queue.clone());

        Arc::new(Self {
            config,
            store,
            plugins,
            events,
            matcher,
            queue,
            states: DashMap::new(),
        })
    }

    /// Last observed state of the claim `namespace/name`
    pub fn claim_state(&self, key: &str) -> Option<ClaimState> {
        self.states.get(key).map(|s| *s)
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Queue a claim for syncing
    pub fn enqueue(&self, key: &str) {
        self.queue.add(key);
        QUEUE_DEPTH.set(self.queue.len() as i64);
    }

    /// Queue every claim that is not bound yet; returns how many were queued
    pub async fn enqueue_unbound(&self) -> Result<usize> {
        let claims = self.store.list_claims().await?;
        let mut queued = 0;
        for claim in claims.iter().filter(|c| !is_bound(c) && !is_lost(c)) {
            self.enqueue(&claim_key(claim));
            queued += 1;
        }
        debug!("Resync queued {} unbound claims", queued);
        Ok(queued)
    }

    fn set_state(&self, key: &str, state: ClaimState) {
        let previous = self.states.insert(key.to_string(), state);
        if previous != Some(state) {
            debug!("Claim {} is now {}", key, state);
        }
    }

    async fn emit(&self, claim: &PersistentVolumeClaim, event: ProvisioningEvent) {
        self.events
            .record(claim, event.event_type(), event.reason(), &event.message())
            .await;
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Bring one claim as far towards Bound as possible
    pub async fn sync_claim(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let Some(claim) = self.store.get_claim(namespace, name).await? else {
            debug!("Claim {} no longer exists", key);
            self.states.remove(key);
            return Ok(());
        };

        if is_bound(&claim) {
            self.set_state(key, ClaimState::Bound);
            return Ok(());
        }
        if is_lost(&claim) {
            warn!("Claim {} lost its volume, not provisioning", key);
            return Ok(());
        }

        let result = self.reconcile(key, &claim).await;
        if result.is_err() {
            self.set_state(key, ClaimState::Unbound);
        }
        result
    }

    async fn reconcile(&self, key: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        self.set_state(key, ClaimState::Unbound);
        let volumes = self.store.list_volumes().await?;
        if let Some(volume) = find_matching_volume(claim, &volumes)? {
            info!(
                "Claim {} matches existing volume {}",
                key,
                volume.metadata.name.as_deref().unwrap_or_default()
            );
            return self.bind(key, claim, volume).await;
        }

        self.set_state(key, ClaimState::MatchingVolume);
        let classes: Vec<StorageClass> = self
            .store
            .list_storage_classes()
            .await?
            .into_iter()
            .filter(|c| self.usable_class(c))
            .collect();
        let default_class = self.default_class_name(&classes);
        let Some(class) = self
            .matcher
            .select_class(claim, &classes, default_class.as_deref())?
        else {
            info!("No storage class matches claim {}, leaving it pending", key);
            self.set_state(key, ClaimState::Unbound);
            return Ok(());
        };

        self.provision(key, claim, &class).await
    }

    fn usable_class(&self, class: &StorageClass) -> bool {
        let errs = validate_storage_class(class, &self.config.validation);
        if !errs.is_empty() {
            warn!(
                "Ignoring invalid storage class {}: {}",
                class.metadata.name.as_deref().unwrap_or_default(),
                errs
            );
        }
        errs.is_empty()
    }

    fn default_class_name(&self, classes: &[StorageClass]) -> Option<String> {
        if let Some(name) = &self.config.default_storage_class {
            return Some(name.clone());
        }
        classes
            .iter()
            .find(|c| {
                c.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
                    .map_or(false, |v| v == "true")
            })
            .and_then(|c| c.metadata.name.clone())
    }

    async fn provision(
        &self,
        key: &str,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
    ) -> Result<()> {
        self.set_state(key, ClaimState::Provisioning);
        let class_name = class.metadata.name.clone().unwrap_or_default();

        let provisioner = match self.plugins.find_provisionable_plugin_by_name(&class.provisioner) {
            Ok(p) => p,
            Err(e) => {
                warn!("Claim {}: {}", key, e);
                self.emit(
                    claim,
                    ProvisioningEvent::ProvisionerMissing {
                        class: class_name,
                        provisioner: class.provisioner.clone(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        info!(
            "Provisioning claim {} with class {} ({})",
            key, class_name, class.provisioner
        );
        let timer = PROVISION_DURATION.start_timer();
        let provisioned = provisioner.provision(claim, class).await;
        timer.observe_duration();

        let volume = match provisioned {
            Ok(v) => self.prepare_volume(v, claim, class),
            Err(e) => {
                error!("Provisioning claim {} failed: {}", key, e);
                record_provision(OUTCOME_FAILED);
                self.emit(
                    claim,
                    ProvisioningEvent::ProvisioningFailed {
                        class: class_name,
                        reason: e.to_string(),
                    },
                )
                .await;
                return Err(match e {
                    Error::ProvisioningFailed { .. } => e,
                    other => Error::ProvisioningFailed {
                        claim: key.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };
        let volume_name = volume.metadata.name.clone().unwrap_or_default();

        let created = match self.create_volume(&volume).await {
            Ok(created) => created,
            Err((attempts, e)) => {
                return self
                    .clean_up(key, claim, &provisioner, &volume, attempts, e)
                    .await;
            }
        };

        info!("Volume {} provisioned for claim {}", volume_name, key);
        record_provision(OUTCOME_SUCCEEDED);
        self.emit(
            claim,
            ProvisioningEvent::Provisioned {
                volume: volume_name,
                provisioner: class.provisioner.clone(),
            },
        )
        .await;

        self.bind(key, claim, created).await
    }

    /// Reserve the provisioned volume for `claim` and stamp its origin
    fn prepare_volume(
        &self,
        mut volume: PersistentVolume,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
    ) -> PersistentVolume {
        if volume.metadata.name.as_deref().map_or(true, str::is_empty) {
            volume.metadata.name = Some(provisioned_volume_name(claim));
        }
        let annotations = volume.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(PROVISIONED_BY_ANNOTATION.into(), class.provisioner.clone());
        annotations.insert(BOUND_BY_CONTROLLER_ANNOTATION.into(), "yes".into());

        let spec = volume.spec.get_or_insert_with(Default::default);
        spec.claim_ref = Some(claim_reference(claim));
        if spec.storage_class_name.is_none() {
            spec.storage_class_name = class.metadata.name.clone();
        }
        if spec.persistent_volume_reclaim_policy.is_none() {
            spec.persistent_volume_reclaim_policy =
                Some(class.reclaim_policy.clone().unwrap_or_else(|| "Delete".into()));
        }
        volume
    }

    /// Persist `volume`, retrying with exponential backoff
    ///
    /// On failure returns the number of attempts made with the last error.
    async fn create_volume(
        &self,
        volume: &PersistentVolume,
    ) -> std::result::Result<PersistentVolume, (u32, Error)> {
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.create_initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.config.create_max_backoff)
            .with_max_elapsed_time(None)
            .build();
        let max_attempts = self.config.create_attempts.max(1);
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let store = &self.store;
        let name = volume.metadata.name.as_deref().unwrap_or_default();

        let result = backoff::future::retry(policy, move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            match store.create_volume(volume).await {
                Ok(created) => Ok(created),
                Err(e) if e.is_already_exists() => {
                    info!("Volume {} already exists", name);
                    Ok(volume.clone())
                }
                Err(e) if attempt >= max_attempts => Err(backoff::Error::permanent(e)),
                Err(e) => {
                    warn!(
                        "Creating volume {} failed (attempt {}/{}): {}",
                        name, attempt, max_attempts, e
                    );
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await;

        result.map_err(|e| (attempts.load(Ordering::SeqCst), e))
    }

    /// Release a backing volume whose object could not be persisted
    async fn clean_up(
        &self,
        key: &str,
        claim: &PersistentVolumeClaim,
        provisioner: &VolumeProvisionerRef,
        volume: &PersistentVolume,
        attempts: u32,
        cause: Error,
    ) -> Result<()> {
        self.set_state(key, ClaimState::CleaningUp);
        let volume_name = volume.metadata.name.clone().unwrap_or_default();
        error!(
            "Giving up on creating volume {} for claim {} after {} attempts: {}",
            volume_name, key, attempts, cause
        );

        match provisioner.delete(volume).await {
            Ok(()) => info!("Released backing volume {}", volume_name),
            Err(e) => {
                error!("Releasing backing volume {} failed: {}", volume_name, e);
                self.emit(
                    claim,
                    ProvisioningEvent::CleanupFailed {
                        volume: volume_name.clone(),
                        reason: e.to_string(),
                    },
                )
                .await;
            }
        }

        record_provision(OUTCOME_CLEANED_UP);
        self.emit(
            claim,
            ProvisioningEvent::VolumeCreationFailed {
                volume: volume_name.clone(),
                attempts,
                reason: cause.to_string(),
            },
        )
        .await;

        Err(Error::VolumeCreationFailed {
            volume: volume_name,
            attempts,
            reason: cause.to_string(),
        })
    }

    async fn bind(
        &self,
        key: &str,
        claim: &PersistentVolumeClaim,
        volume: PersistentVolume,
    ) -> Result<()> {
        self.set_state(key, ClaimState::Binding);
        let volume_name = volume.metadata.name.clone().unwrap_or_default();
        let bind_failed = |e: Error| Error::BindFailed {
            claim: key.to_string(),
            volume: volume_name.clone(),
            reason: e.to_string(),
        };

        let volume = if is_prebound_to(&volume, claim) {
            volume
        } else {
            self.store
                .bind_volume(&volume, claim)
                .await
                .map_err(bind_failed)?
        };
        self.store
            .bind_claim(claim, &volume)
            .await
            .map_err(bind_failed)?;

        info!("Claim {} bound to volume {}", key, volume_name);
        BINDS.inc();
        self.emit(
            claim,
            ProvisioningEvent::Bound {
                volume: volume_name.clone(),
            },
        )
        .await;
        self.set_state(key, ClaimState::Bound);
        Ok(())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    fn handle_result(&self, key: &str, result: Result<()>) {
        let Err(e) = result else {
            self.queue.forget(key);
            return;
        };

        SYNC_ERRORS.inc();
        match e.action() {
            ErrorAction::RequeueWithBackoff => {
                warn!("Syncing claim {} failed, retrying: {}", key, e);
                self.queue.add_rate_limited(key);
            }
            ErrorAction::RequeueAfter(delay) => {
                warn!("Syncing claim {} failed, retrying in {:?}: {}", key, delay, e);
                self.queue.forget(key);
                self.queue.add_after(key, delay);
            }
            ErrorAction::NoRequeue => {
                warn!("Syncing claim {} failed, waiting for resync: {}", key, e);
                self.queue.forget(key);
            }
        }
    }

    /// Process one queued claim; `false` once the queue has shut down
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = self.sync_claim(&key).await;
        self.handle_result(&key, result);
        self.queue.done(&key);
        QUEUE_DEPTH.set(self.queue.len() as i64);
        true
    }

    /// Run workers and the periodic resync until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting provisioning controller ({} workers, resync every {:?})",
            self.config.workers, self.config.resync_period
        );

        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers.max(1) {
            let controller = Arc::clone(&self);
            workers.push(tokio::spawn(async move {
                while controller.process_next().await {}
                debug!("Provisioning worker {} stopped", id);
            }));
        }

        let mut resync = tokio::time::interval(self.config.resync_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => {
                    if let Err(e) = self.enqueue_unbound().await {
                        warn!("Resync failed: {}", e);
                    }
                }
            }
        }

        info!("Provisioning controller stopping");
        self.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Provisioning worker panicked: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::claim::claim_key;
    use crate::testing::{
        claim, labeled, storage_class, test_host, volume, FakeProvisionablePlugin,
        MemoryClaimStore, RecordingEventRecorder,
    };
    use crate::volume::{NodeVolumeHost, VolumePluginRef};
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    const PROVISIONER: &str = "example.com/fake-provisioner";
    const KEY: &str = "default/data";

    struct Fixture {
        controller: Arc<ProvisioningController>,
        store: Arc<MemoryClaimStore>,
        events: Arc<RecordingEventRecorder>,
        plugin: Arc<FakeProvisionablePlugin>,
        _host: Arc<NodeVolumeHost>,
        _root: tempfile::TempDir,
    }

    fn fixture_with(config: ControllerConfig) -> Fixture {
        let (host, root) = test_host();
        let plugin = Arc::new(FakeProvisionablePlugin::new(PROVISIONER));
        let registry =
            VolumePluginRegistry::init(vec![plugin.clone() as VolumePluginRef], host.clone())
                .unwrap();
        let store = Arc::new(MemoryClaimStore::new());
        let events = Arc::new(RecordingEventRecorder::new());
        let controller =
            ProvisioningController::new(config, store.clone(), registry, events.clone());
        Fixture {
            controller,
            store,
            events,
            plugin,
            _host: host,
            _root: root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ControllerConfig {
            create_attempts: 3,
            create_initial_backoff: Duration::from_millis(1),
            create_max_backoff: Duration::from_millis(4),
            seed: Some(1),
            ..Default::default()
        })
    }

    fn bound_volume(store: &MemoryClaimStore) -> Option<String> {
        store
            .claim(KEY)
            .and_then(|c| c.spec)
            .and_then(|s| s.volume_name)
    }

    #[tokio::test]
    async fn test_provisions_and_binds_new_volume() {
        let f = fixture();
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        f.controller.sync_claim(KEY).await.unwrap();

        let pv = f.store.volume("pvc-uid-data").unwrap();
        let spec = pv.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        let claim_ref = spec.claim_ref.as_ref().unwrap();
        assert_eq!(claim_ref.name.as_deref(), Some("data"));
        assert_eq!(claim_ref.uid.as_deref(), Some("uid-data"));
        let annotations = pv.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[PROVISIONED_BY_ANNOTATION], PROVISIONER);
        assert_eq!(annotations[BOUND_BY_CONTROLLER_ANNOTATION], "yes");

        assert_eq!(bound_volume(&f.store).as_deref(), Some("pvc-uid-data"));
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Bound));
        assert_eq!(f.events.reasons(), vec!["ProvisioningSucceeded", "VolumeBound"]);
    }

    #[tokio::test]
    async fn test_existing_volume_preferred_over_provisioning() {
        let f = fixture();
        f.store.add_class(storage_class("fast", PROVISIONER, &[], false));
        f.store.add_volume(volume("pv-existing", "10Gi", "fast"));
        f.store.add_claim(claim("default", "data", Some("1Gi"), Some("fast")));

        f.controller.sync_claim(KEY).await.unwrap();

        assert_eq!(f.plugin.provision_calls(), 0);
        assert_eq!(bound_volume(&f.store).as_deref(), Some("pv-existing"));
        let pv = f.store.volume("pv-existing").unwrap();
        assert!(is_prebound_to(&pv, &f.store.claim(KEY).unwrap()));
    }

    #[tokio::test]
    async fn test_no_matching_class_stays_pending() {
        let f = fixture();
        f.store.add_class(labeled(
            storage_class("aws-slow-zone1", PROVISIONER, &[], true),
            &[("zone", "zone1")],
        ));
        f.store.add_class(labeled(
            storage_class("aws-fast-zone1", PROVISIONER, &[], false),
            &[("zone", "zone1")],
        ));
        let mut pvc = claim("default", "data", Some("1Gi"), None);
        pvc.spec.as_mut().unwrap().selector = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("zone".to_string(), "zone3".to_string())])),
            ..Default::default()
        });
        f.store.add_claim(pvc);

        f.controller.sync_claim(KEY).await.unwrap();

        assert_eq!(f.plugin.provision_calls(), 0);
        assert_eq!(f.store.volume_count(), 0);
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Unbound));
        let phase = f.store.claim(KEY).and_then(|c| c.status).and_then(|s| s.phase);
        assert_eq!(phase.as_deref(), Some("Pending"));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_provisioner_waits_for_resync() {
        let f = fixture();
        f.store.add_class(storage_class("fast", "example.com/unknown", &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        let err = f.controller.sync_claim(KEY).await.unwrap_err();
        assert_matches!(err, Error::ProvisionerNotFound { .. });
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert_eq!(f.events.reasons(), vec!["ProvisioningFailed"]);
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Unbound));
    }

    #[tokio::test]
    async fn test_provision_failure_then_retry_succeeds() {
        let f = fixture();
        f.plugin.fail_next_provisions(1);
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        let err = f.controller.sync_claim(KEY).await.unwrap_err();
        assert_matches!(err, Error::ProvisioningFailed { .. });
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert_eq!(f.store.volume_count(), 0);

        f.controller.sync_claim(KEY).await.unwrap();
        assert_eq!(f.plugin.provision_calls(), 2);
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Bound));
    }

    #[tokio::test]
    async fn test_volume_creation_retried() {
        let f = fixture();
        f.store.fail_next_creates(2);
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        f.controller.sync_claim(KEY).await.unwrap();

        assert_eq!(f.store.create_attempts(), 3);
        assert!(f.plugin.deleted().is_empty());
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Bound));
    }

    #[tokio::test]
    async fn test_volume_creation_exhausted_releases_backing_volume() {
        let f = fixture();
        f.store.fail_next_creates(100);
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        let err = f.controller.sync_claim(KEY).await.unwrap_err();
        assert_matches!(err, Error::VolumeCreationFailed { attempts: 3, .. });
        assert_eq!(f.store.create_attempts(), 3);
        assert_eq!(f.plugin.deleted(), vec!["pvc-uid-data"]);
        assert_eq!(f.events.reasons(), vec!["ProvisioningFailed"]);
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Unbound));
        assert!(bound_volume(&f.store).is_none());
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_reported() {
        let f = fixture();
        f.store.fail_next_creates(100);
        f.plugin.fail_deletes(true);
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        assert!(f.controller.sync_claim(KEY).await.is_err());
        assert_eq!(
            f.events.reasons(),
            vec!["ProvisioningCleanupFailed", "ProvisioningFailed"]
        );
    }

    #[tokio::test]
    async fn test_bound_claim_is_not_provisioned_again() {
        let f = fixture();
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        f.controller.sync_claim(KEY).await.unwrap();
        f.controller.sync_claim(KEY).await.unwrap();

        assert_eq!(f.plugin.provision_calls(), 1);
        assert_eq!(f.store.volume_count(), 1);
        assert_eq!(f.controller.enqueue_unbound().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_configured_default_class_wins() {
        let f = fixture_with(ControllerConfig {
            default_storage_class: Some("silver".into()),
            ..Default::default()
        });
        f.store.add_class(storage_class("gold", PROVISIONER, &[], true));
        f.store.add_class(storage_class("silver", PROVISIONER, &[], false));
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        f.controller.sync_claim(KEY).await.unwrap();

        let pv = f.store.volume("pvc-uid-data").unwrap();
        assert_eq!(pv.spec.unwrap().storage_class_name.as_deref(), Some("silver"));
    }

    #[tokio::test]
    async fn test_invalid_class_is_never_used() {
        let f = fixture();
        let mut recycle = storage_class("recycle", PROVISIONER, &[], true);
        recycle.reclaim_policy = Some("Recycle".into());
        f.store.add_class(recycle);
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));

        f.controller.sync_claim(KEY).await.unwrap();
        assert_eq!(f.plugin.provision_calls(), 0);
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Unbound));

        f.store.add_class(storage_class("retain", PROVISIONER, &[], false));
        f.controller.sync_claim(KEY).await.unwrap();
        let pv = f.store.volume("pvc-uid-data").unwrap();
        assert_eq!(pv.spec.unwrap().storage_class_name.as_deref(), Some("retain"));
    }

    #[tokio::test]
    async fn test_deleted_claim_is_forgotten() {
        let f = fixture();
        f.store.add_claim(claim("default", "data", Some("1Gi"), None));
        f.controller.sync_claim(KEY).await.unwrap();
        assert_eq!(f.controller.claim_state(KEY), Some(ClaimState::Unbound));

        f.controller.sync_claim("default/gone").await.unwrap();
        assert_eq!(f.controller.claim_state("default/gone"), None);
        assert_matches!(
            f.controller.sync_claim("no-namespace").await,
            Err(Error::Internal(_))
        );
    }

    #[tokio::test]
    async fn test_run_binds_queued_claims() {
        let f = fixture();
        f.store.add_class(storage_class("fast", PROVISIONER, &[], true));
        let pvc = claim("default", "data", Some("1Gi"), None);
        f.controller.enqueue(&claim_key(&pvc));
        f.store.add_claim(pvc);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.controller.clone().run(shutdown.clone()));

        let mut bound = false;
        for _ in 0..200 {
            if f.controller.claim_state(KEY) == Some(ClaimState::Bound) {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(bound);
        assert_eq!(f.plugin.provision_calls(), 1);
    }
}
