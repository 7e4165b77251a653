use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, error, info, instrument, warn};

use super::queue::WorkQueue;
use super::registry::{DeletedImportCache, WatcherRegistry};
use super::snapshot::ServiceImportSnapshot;
use crate::cluster::ClusterApi;
use crate::crd::service_import::ServiceImport;
use crate::endpoints::{EndpointWatcherFactory, WatchTarget};
use crate::selector::LabelSelector;
use crate::source::ImportSource;

/// Everything a worker needs to reconcile one key. Shared by all workers.
pub struct Reconciler {
    pub(super) queue: WorkQueue,
    pub(super) source: Arc<dyn ImportSource>,
    pub(super) cluster: Arc<dyn ClusterApi>,
    pub(super) watchers: Arc<dyn EndpointWatcherFactory>,
    pub(super) registry: WatcherRegistry,
    pub(super) deleted: DeletedImportCache,
    pub(super) cluster_id: String,
}

/// Pod selector of `svc`, `None` when it has none or it is empty.
pub fn pod_selector(svc: &Service) -> Option<LabelSelector> {
    svc.spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .filter(|m: &BTreeMap<String, String>| !m.is_empty())
        .map(LabelSelector::from)
}

impl Reconciler {
    /// Drains the queue until it is shut down.
    pub async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next().await {}
        info!(worker = id, "worker stopped");
    }

    /// Processes one key. Returns `false` once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(item) = self.queue.next().await else {
            return false;
        };
        self.process(item.key()).await;
        true
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn process(&self, key: &str) {
        let obj = match self.source.lookup(key) {
            Ok(obj) => obj,
            Err(e) => {
                error!(error = %e, "error retrieving ServiceImport");
                self.queue.add_rate_limited(key);
                return;
            }
        };
        self.queue.forget(key);
        match obj {
            Some(obj) => self.created_or_updated(&obj, key).await,
            None => self.deleted(key).await,
        }
    }

    async fn created_or_updated(&self, obj: &ServiceImport, key: &str) {
        if self.registry.contains(key) {
            debug!("endpoint watcher already running");
            return;
        }
        let snapshot = match ServiceImportSnapshot::try_from(obj) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "malformed ServiceImport");
                return;
            }
        };
        if !snapshot.is_headless() {
            return;
        }
        if snapshot.origin_namespace.is_empty() || snapshot.origin_name.is_empty() {
            error!("ServiceImport has no origin service annotations");
            return;
        }

        let (ns, name) = (&snapshot.origin_namespace, &snapshot.origin_name);
        let svc = match self.cluster.get_service(ns, name).await {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => {
                debug!(%ns, %name, "origin service not found");
                return;
            }
            Err(e) => {
                error!(%ns, %name, error = %e, "error retrieving origin service");
                self.queue.add_rate_limited(key);
                return;
            }
        };
        let Some(selector) = pod_selector(&svc) else {
            error!(%ns, %name, "origin service has no pod selector");
            return;
        };

        let target = WatchTarget {
            import_uid: snapshot.uid.clone(),
            import_name: snapshot.import_ref.name.clone(),
            import_namespace: snapshot.import_ref.namespace.clone(),
            origin_namespace: snapshot.origin_namespace.clone(),
            cluster_id: self.cluster_id.clone(),
        };
        let mut watcher = match self.watchers.create(&target) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "error creating endpoint watcher");
                return;
            }
        };
        if let Err(e) = watcher.start(&selector).await {
            error!(%selector, error = %e, "error starting endpoint watcher");
            return;
        }
        if let Err(rejected) = self.registry.insert(key, watcher) {
            rejected.stop();
            debug!("endpoint watcher registered concurrently, stopped extra one");
            return;
        }
        info!(%selector, "endpoint watcher started");
    }

    async fn deleted(&self, key: &str) {
        let Some(snapshot) = self.deleted.take(key) else {
            warn!("no deleted ServiceImport snapshot found");
            return;
        };
        if let Some(watcher) = self.registry.remove(key) {
            watcher.stop();
            info!("endpoint watcher stopped");
        }

        let ns = snapshot.import_ref.namespace.clone();
        let selector = LabelSelector::single("app", snapshot.app_label());
        match self.cluster.delete_endpoint_slices(&ns, &selector).await {
            Ok(()) => info!(%ns, %selector, "endpoint slices removed"),
            Err(e) if e.is_not_found() => {
                debug!(%ns, %selector, "endpoint slices already gone")
            }
            Err(e) => {
                error!(%ns, %selector, error = %e, "error deleting endpoint slices");
                self.deleted.store(key, snapshot);
                self.queue.add_rate_limited(key);
            }
        }
    }
}
