//! Mount Pod Manager
//!
//! Tracks running helper pods that carry filesystem tools for volume plugins.
//! A pod serves a plugin when it runs in the watched namespace and carries the
//! label `mount.<plugin name>=true`.

use super::VolumePluginRegistry;
use crate::error::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label prefix marking a pod as the mount helper of a plugin
pub const MOUNT_POD_LABEL_PREFIX: &str = "mount.";

const POD_RUNNING: &str = "Running";

/// Plugin name -> pod UID -> pod
type PodIndex = HashMap<String, HashMap<String, Arc<Pod>>>;

/// Cache of mount pods in one namespace
pub struct MountPodManager {
    namespace: String,
    plugin_names: Vec<String>,
    pods: Mutex<PodIndex>,
}

impl MountPodManager {
    pub fn new(namespace: impl Into<String>, plugin_names: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            plugin_names,
            pods: Mutex::new(HashMap::new()),
        }
    }

    /// Manager for every plugin in `registry`
    pub fn for_registry(namespace: impl Into<String>, registry: &VolumePluginRegistry) -> Self {
        Self::new(namespace, registry.plugin_names())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Add or refresh `pod`
    ///
    /// The previous membership of the pod is dropped first, so a pod that
    /// stopped running or lost a label disappears from the affected plugins.
    pub fn add_pod(&self, pod: &Pod) {
        if pod.metadata.namespace.as_deref() != Some(self.namespace.as_str()) {
            return;
        }
        let Some(uid) = pod.metadata.uid.clone() else {
            return;
        };
        let name = pod.metadata.name.clone().unwrap_or_default();
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        // Computed before taking the lock
        let handled: Vec<&String> = if phase == POD_RUNNING {
            let labels = pod.metadata.labels.as_ref();
            self.plugin_names
                .iter()
                .filter(|plugin| {
                    labels
                        .and_then(|l| l.get(&format!("{}{}", MOUNT_POD_LABEL_PREFIX, plugin)))
                        .map(|v| v == "true")
                        .unwrap_or(false)
                })
                .collect()
        } else {
            Vec::new()
        };
        let shared = Arc::new(pod.clone());

        let mut pods = self.pods.lock();
        remove_uid(&mut pods, &uid);
        for plugin in &handled {
            pods.entry((*plugin).clone())
                .or_default()
                .insert(uid.clone(), shared.clone());
        }
        drop(pods);

        if phase != POD_RUNNING {
            debug!("Skipping mount pod {}/{}: it is {:?}", self.namespace, name, phase);
        } else {
            for plugin in handled {
                debug!("Added mount pod {}/{} for plugin {}", self.namespace, name, plugin);
            }
        }
    }

    /// Forget `pod`
    pub fn delete_pod(&self, pod: &Pod) {
        if pod.metadata.namespace.as_deref() != Some(self.namespace.as_str()) {
            return;
        }
        let Some(uid) = pod.metadata.uid.as_deref() else {
            return;
        };
        remove_uid(&mut self.pods.lock(), uid);
        debug!(
            "Deleted mount pod {}/{}",
            self.namespace,
            pod.metadata.name.as_deref().unwrap_or_default()
        );
    }

    /// Any running mount pod for `plugin`
    pub fn get_pod(&self, plugin: &str) -> Option<Arc<Pod>> {
        let pods = self.pods.lock();
        pods.get(plugin).and_then(|by_uid| by_uid.values().next().cloned())
    }

    /// Replace the whole cache with `pods`
    pub fn reset(&self, pods: &[Pod]) {
        self.pods.lock().clear();
        for pod in pods {
            self.add_pod(pod);
        }
    }

    /// Apply one watch event
    pub fn apply(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Applied(pod) => self.add_pod(&pod),
            watcher::Event::Deleted(pod) => self.delete_pod(&pod),
            watcher::Event::Restarted(pods) => self.reset(&pods),
        }
    }

    /// Keep the cache in sync with the pods of the watched namespace
    pub async fn run(self: Arc<Self>, client: Client, shutdown: CancellationToken) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        info!("Watching mount pods in namespace {}", self.namespace);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Mount pod watcher stopping");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!("Mount pod watch error: {}", e),
                    None => return Ok(()),
                }
            }
        }
    }
}

fn remove_uid(pods: &mut PodIndex, uid: &str) {
    for by_uid in pods.values_mut() {
        by_uid.remove(uid);
    }
}
