//! Kubespout watch sources – discovery and watcher wiring.
//!
//! One [`WatchSource`] subscription per descriptor turns the apiserver's
//! list+watch stream into [`LifecycleNotification`]s on a bounded channel.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubespout_core::{LifecycleKind, LifecycleNotification, ResourceDescriptor};

/// Consecutive watcher stream errors tolerated before a subscription gives up.
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// A long-lived subscription feeding lifecycle notifications for one
/// descriptor. The kube-backed implementation lives in [`KubeWatchSource`];
/// tests script their own.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    /// Resolve every descriptor to a watchable resource type. Any failure is
    /// fatal to startup; nothing is watched in a degraded partial state.
    async fn resolve(&self, descriptors: &[Arc<ResourceDescriptor>]) -> Result<()>;

    /// Run the subscription loop for one descriptor. Blocks until the
    /// consumer goes away (clean end) or retries are exhausted (permanent
    /// failure for this descriptor).
    async fn subscribe(
        &self,
        descriptor: Arc<ResourceDescriptor>,
        namespace: Option<String>,
        tx: mpsc::Sender<LifecycleNotification>,
    ) -> Result<()>;
}

/// Classifies raw apply events into Added/Updated by tracking which object
/// identities have been seen; a watch restart resets the set so every listed
/// object is re-announced as a synthetic Added.
#[derive(Default)]
pub struct SeenTracker {
    seen: FxHashSet<String>,
}

impl SeenTracker {
    pub fn classify(&mut self, key: &str) -> LifecycleKind {
        if self.seen.insert(key.to_string()) {
            LifecycleKind::Added
        } else {
            LifecycleKind::Updated
        }
    }

    pub fn forget(&mut self, key: &str) {
        self.seen.remove(key);
    }

    /// Replace the tracked set after a full re-list.
    pub fn restart<'a>(&mut self, keys: impl Iterator<Item = &'a str>) {
        self.seen = keys.map(|k| k.to_string()).collect();
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Stable identity for the seen-set: uid when present, ns/name otherwise.
fn object_key(obj: &DynamicObject) -> String {
    match obj.metadata.uid.as_deref() {
        Some(uid) => uid.to_string(),
        None => format!(
            "{}/{}",
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            obj.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

/// Shape a raw object into a notification. Serialization problems do not
/// abort the stream; the translator marks the event instead.
pub fn notification_from(
    descriptor: &Arc<ResourceDescriptor>,
    kind: LifecycleKind,
    obj: &DynamicObject,
) -> LifecycleNotification {
    let resource = match serde_json::to_value(obj) {
        Ok(mut raw) => {
            strip_managed_fields(&mut raw);
            raw
        }
        Err(e) => {
            debug!(error = %e, gvk = %descriptor.gvk_key(), "object not serializable; shipping empty payload");
            serde_json::Value::Null
        }
    };
    LifecycleNotification {
        kind,
        resource,
        descriptor: Arc::clone(descriptor),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
        timestamp: Utc::now(),
    }
}

/// Kube-backed watch source factory. Descriptor resolution runs once via
/// Discovery and fills a registry keyed by gvk; subscriptions read from it.
pub struct KubeWatchSource {
    client: Client,
    registry: RwLock<FxHashMap<String, (ApiResource, bool)>>,
    max_consecutive_errors: u32,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: RwLock::new(FxHashMap::default()),
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max.max(1);
        self
    }

    fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<(ApiResource, bool)> {
        self.registry
            .read()
            .expect("watch registry poisoned")
            .get(&descriptor.gvk_key())
            .cloned()
            .ok_or_else(|| anyhow!("descriptor not resolved: {}", descriptor.gvk_key()))
    }

    fn api_for(&self, descriptor: &ResourceDescriptor, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.lookup(descriptor)?;
        let api = if namespaced {
            match namespace {
                Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
                _ => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeWatchSource {
    async fn resolve(&self, descriptors: &[Arc<ResourceDescriptor>]) -> Result<()> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context("running apiserver discovery")?;
        let mut registry = FxHashMap::default();
        for d in descriptors {
            let mut found = None;
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    if ar.group == d.group && ar.version == d.version && ar.kind == d.kind {
                        found = Some((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                    }
                }
            }
            let entry = found.ok_or_else(|| anyhow!("GVK not found: {}", d.gvk_key()))?;
            debug!(gvk = %d.gvk_key(), namespaced = entry.1, "descriptor resolved");
            registry.insert(d.gvk_key(), entry);
        }
        info!(count = registry.len(), "all descriptors resolved");
        *self.registry.write().expect("watch registry poisoned") = registry;
        Ok(())
    }

    async fn subscribe(
        &self,
        descriptor: Arc<ResourceDescriptor>,
        namespace: Option<String>,
        tx: mpsc::Sender<LifecycleNotification>,
    ) -> Result<()> {
        let api = self.api_for(&descriptor, namespace.as_deref())?;
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %descriptor.gvk_key(), ns = ?namespace, "watch subscription started");

        let mut tracker = SeenTracker::default();
        let mut consecutive_errors = 0u32;
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(Event::Applied(obj)) => {
                    consecutive_errors = 0;
                    let kind = tracker.classify(&object_key(&obj));
                    let n = notification_from(&descriptor, kind, &obj);
                    if tx.send(n).await.is_err() {
                        debug!(gvk = %descriptor.gvk_key(), "consumer gone; ending subscription");
                        return Ok(());
                    }
                }
                Ok(Event::Deleted(obj)) => {
                    consecutive_errors = 0;
                    tracker.forget(&object_key(&obj));
                    let n = notification_from(&descriptor, LifecycleKind::Deleted, &obj);
                    if tx.send(n).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(Event::Restarted(list)) => {
                    consecutive_errors = 0;
                    debug!(gvk = %descriptor.gvk_key(), count = list.len(), "watch restarted; re-announcing listed objects");
                    let keys: Vec<String> = list.iter().map(object_key).collect();
                    tracker.restart(keys.iter().map(String::as_str));
                    for obj in &list {
                        let n = notification_from(&descriptor, LifecycleKind::Added, obj);
                        if tx.send(n).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        gvk = %descriptor.gvk_key(),
                        error = %e,
                        consecutive = consecutive_errors,
                        "watch stream error"
                    );
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(anyhow!(e).context(format!(
                            "watch for {} failed permanently after {} consecutive errors",
                            descriptor.gvk_key(),
                            consecutive_errors
                        )));
                    }
                }
            }
        }
        warn!(gvk = %descriptor.gvk_key(), "watch stream ended");
        Ok(())
    }
}
