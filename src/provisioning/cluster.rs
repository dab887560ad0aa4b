//! Kubernetes-backed adapters for the provisioning controller
//!
//! [`KubeClaimStore`] and [`KubeEventRecorder`] implement the controller's
//! ports against the API server; [`run_watchers`] turns watch events on
//! claims, volumes and classes into queued claims.

use super::controller::{claim_reference, ProvisioningController};
use super::{BIND_COMPLETED_ANNOTATION, BOUND_BY_CONTROLLER_ANNOTATION};
use crate::domain::claim::claim_key;
use crate::domain::ports::{ClaimStore, EventRecorder, EventType};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Claim Store
// =============================================================================

/// [`ClaimStore`] reading and writing through the API server
#[derive(Clone)]
pub struct KubeClaimStore {
    client: Client,
}

impl KubeClaimStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

fn namespace_of(claim: &PersistentVolumeClaim) -> &str {
    claim.metadata.namespace.as_deref().unwrap_or("default")
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims(namespace).get_opt(name).await?)
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes().list(&ListParams::default()).await?.items)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        Ok(self.volumes().create(&PostParams::default(), volume).await?)
    }

    async fn bind_volume(
        &self,
        volume: &PersistentVolume,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolume> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "annotations": { BOUND_BY_CONTROLLER_ANNOTATION: "yes" }
            },
            "spec": { "claimRef": claim_reference(claim) }
        });
        Ok(self
            .volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn bind_claim(
        &self,
        claim: &PersistentVolumeClaim,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolumeClaim> {
        let api = self.claims(namespace_of(claim));
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        let volume_spec = volume.spec.clone().unwrap_or_default();

        let patch = json!({
            "metadata": {
                "annotations": {
                    BIND_COMPLETED_ANNOTATION: "yes",
                    BOUND_BY_CONTROLLER_ANNOTATION: "yes"
                }
            },
            "spec": { "volumeName": volume.metadata.name }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        let status = json!({
            "status": {
                "phase": "Bound",
                "accessModes": volume_spec.access_modes,
                "capacity": volume_spec.capacity
            }
        });
        Ok(api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await?)
    }
}

// =============================================================================
// Event Recorder
// =============================================================================

/// [`EventRecorder`] publishing Kubernetes events on the claim
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        claim: &PersistentVolumeClaim,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            claim.object_ref(&()),
        );
        let event = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Provisioning".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                "Failed to record {} event on claim {}: {}",
                reason,
                claim_key(claim),
                e
            );
        }
    }
}

// =============================================================================
// Watchers
// =============================================================================

/// Feed the controller's queue from claim, volume and class watches
///
/// Every claim event queues that claim. Volume and class changes can unblock
/// any pending claim, so they queue all unbound claims.
pub async fn run_watchers(
    controller: Arc<ProvisioningController>,
    client: Client,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut claims = watcher(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .boxed();
    let mut volumes = watcher(
        Api::<PersistentVolume>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .boxed();
    let mut classes = watcher(Api::<StorageClass>::all(client), watcher::Config::default())
        .default_backoff()
        .boxed();
    info!("Watching claims, volumes and storage classes");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Provisioning watchers stopping");
                return Ok(());
            }
            Some(event) = claims.next() => match event {
                Ok(watcher::Event::Applied(claim)) | Ok(watcher::Event::Deleted(claim)) => {
                    controller.enqueue(&claim_key(&claim));
                }
                Ok(watcher::Event::Restarted(all)) => {
                    debug!("Claim watch restarted with {} claims", all.len());
                    for claim in &all {
                        controller.enqueue(&claim_key(claim));
                    }
                }
                Err(e) => warn!("Claim watch error: {}", e),
            },
            Some(event) = volumes.next() => match event {
                Ok(watcher::Event::Applied(volume)) => {
                    if is_available(&volume) {
                        requeue_unbound(&controller).await;
                    }
                }
                Ok(watcher::Event::Restarted(all)) => {
                    if all.iter().any(is_available) {
                        requeue_unbound(&controller).await;
                    }
                }
                Ok(watcher::Event::Deleted(_)) => {}
                Err(e) => warn!("Volume watch error: {}", e),
            },
            Some(event) = classes.next() => match event {
                Ok(watcher::Event::Deleted(_)) => {}
                Ok(_) => requeue_unbound(&controller).await,
                Err(e) => warn!("Storage class watch error: {}", e),
            },
            else => return Ok(()),
        }
    }
}

/// Whether `volume` could still be bound to a pending claim
fn is_available(volume: &PersistentVolume) -> bool {
    let unclaimed = volume
        .spec
        .as_ref()
        .map_or(true, |spec| spec.claim_ref.is_none());
    let phase = volume.status.as_ref().and_then(|s| s.phase.as_deref());
    unclaimed && matches!(phase, None | Some("Pending") | Some("Available"))
}

async fn requeue_unbound(controller: &ProvisioningController) {
    if let Err(e) = controller.enqueue_unbound().await {
        warn!("Requeueing unbound claims failed: {}", e);
    }
}
