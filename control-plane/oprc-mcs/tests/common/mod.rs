#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;

use oprc_mcs::cluster::{ApiError, ClusterApi};
use oprc_mcs::config::RetryConfig;
use oprc_mcs::controller::queue::WorkQueue;
use oprc_mcs::controller::snapshot::{RefParseError, ServiceImportRef};
use oprc_mcs::controller::{ControllerContext, ServiceImportController};
use oprc_mcs::crd::service_import::{
    ORIGIN_NAME_ANNOTATION, ORIGIN_NAMESPACE_ANNOTATION, ServiceImport,
    ServiceImportSpec, ServiceImportType,
};
use oprc_mcs::endpoints::{
    EndpointWatcher, EndpointWatcherFactory, WatchTarget, WatcherError,
};
use oprc_mcs::selector::LabelSelector;
use oprc_mcs::source::{
    DeletedImport, ImportEventHandler, ImportSource, SourceError,
};

pub const IMPORT_NS: &str = "submariner-operator";
pub const ORIGIN_NS: &str = "apps";

pub fn service_import(name: &str, ty: ServiceImportType) -> ServiceImport {
    let mut si = ServiceImport::new(
        name,
        ServiceImportSpec {
            ports: vec![],
            ips: vec![],
            type_: ty,
            session_affinity: None,
        },
    );
    si.metadata.namespace = Some(IMPORT_NS.into());
    si.metadata.uid = Some(format!("uid-{name}"));
    si.metadata.labels = Some(BTreeMap::from([("app".into(), name.into())]));
    si.metadata.annotations = Some(BTreeMap::from([
        (ORIGIN_NAMESPACE_ANNOTATION.into(), ORIGIN_NS.into()),
        (ORIGIN_NAME_ANNOTATION.into(), name.into()),
    ]));
    si
}

pub fn headless(name: &str) -> ServiceImport {
    service_import(name, ServiceImportType::Headless)
}

pub fn key(name: &str) -> String {
    format!("{IMPORT_NS}/{name}")
}

pub fn origin_service(name: &str, selector: Option<&str>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ORIGIN_NS.into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: selector
                .map(|app| BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// In-memory notification source. Mutations update the cache first, then
/// notify the subscribed handler, like an informer does.
#[derive(Default)]
pub struct FakeSource {
    objects: Mutex<HashMap<String, ServiceImport>>,
    handler: Mutex<Option<Arc<dyn ImportEventHandler>>>,
    failing_lookups: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl FakeSource {
    fn handler(&self) -> Arc<dyn ImportEventHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("handler subscribed")
    }

    fn key_of(obj: &ServiceImport) -> String {
        ServiceImportRef::from_object(obj).unwrap().key()
    }

    pub fn apply(&self, obj: ServiceImport) {
        let old = self
            .objects
            .lock()
            .unwrap()
            .insert(Self::key_of(&obj), obj.clone());
        match old {
            Some(old) => self.handler().on_update(&old, &obj),
            None => self.handler().on_add(&obj),
        }
    }

    pub fn delete(&self, obj: ServiceImport) {
        self.objects.lock().unwrap().remove(&Self::key_of(&obj));
        self.handler().on_delete(DeletedImport::Object(obj));
    }

    /// Removes the object and reports it through a tombstone only.
    pub fn delete_unseen(&self, key: &str) {
        let last_known = self.objects.lock().unwrap().remove(key);
        self.handler().on_delete(DeletedImport::LastKnown {
            key: key.to_string(),
            last_known,
        });
    }

    pub fn fail_next_lookups(&self, n: usize) {
        self.failing_lookups.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImportSource for FakeSource {
    fn subscribe(
        &self,
        handler: Arc<dyn ImportEventHandler>,
    ) -> Result<(), SourceError> {
        let mut slot = self.handler.lock().unwrap();
        if slot.is_some() {
            return Err(SourceError::AlreadySubscribed);
        }
        *slot = Some(handler);
        Ok(())
    }

    async fn run(&self, token: CancellationToken) {
        token.cancelled().await;
    }

    fn lookup(&self, key: &str) -> Result<Option<Arc<ServiceImport>>, SourceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_lookups.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_lookups.store(failing - 1, Ordering::SeqCst);
            return Err(SourceError::InvalidKey(RefParseError::Malformed(
                key.to_string(),
            )));
        }
        Ok(self.objects.lock().unwrap().get(key).cloned().map(Arc::new))
    }
}

/// Handler that drops every event; used to occupy a source's subscription.
pub struct IgnoreEvents;

impl ImportEventHandler for IgnoreEvents {
    fn on_add(&self, _obj: &ServiceImport) {}
    fn on_update(&self, _old: &ServiceImport, _new: &ServiceImport) {}
    fn on_delete(&self, _deleted: DeletedImport) {}
}

/// In-memory cluster API with call accounting. `get_service` also records
/// whether two calls for the same service ever overlapped.
#[derive(Default)]
pub struct FakeClusterApi {
    services: Mutex<HashMap<String, Service>>,
    in_flight: Mutex<HashSet<String>>,
    get_delay: Mutex<Duration>,
    failing_gets: AtomicUsize,
    failing_deletes: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub deletes: Mutex<Vec<(String, String)>>,
}

impl FakeClusterApi {
    pub fn put_service(&self, svc: Service) {
        let key = format!(
            "{}/{}",
            svc.metadata.namespace.clone().unwrap_or_default(),
            svc.metadata.name.clone().unwrap_or_default()
        );
        self.services.lock().unwrap().insert(key, svc);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> Vec<(String, String)> {
        self.deletes.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Service, ApiError> {
        let key = format!("{namespace}/{name}");
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.get_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.lock().unwrap().remove(&key);
        if Self::take_failure(&self.failing_gets) {
            return Err(ApiError::Other("injected get failure".into()));
        }
        self.services
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn delete_endpoint_slices(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), ApiError> {
        self.deletes
            .lock()
            .unwrap()
            .push((namespace.to_string(), selector.to_string()));
        if Self::take_failure(&self.failing_deletes) {
            return Err(ApiError::Other("injected delete failure".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct WatcherCounters {
    pub created: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
    pub targets: Mutex<Vec<WatchTarget>>,
    pub selectors: Mutex<Vec<String>>,
}

#[derive(Default)]
pub struct FakeWatcherFactory {
    pub counters: Arc<WatcherCounters>,
}

impl FakeWatcherFactory {
    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }
}

impl EndpointWatcherFactory for FakeWatcherFactory {
    fn create(
        &self,
        target: &WatchTarget,
    ) -> Result<Box<dyn EndpointWatcher>, WatcherError> {
        target.validate()?;
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.counters.targets.lock().unwrap().push(target.clone());
        Ok(Box::new(FakeWatcher {
            counters: self.counters.clone(),
        }))
    }
}

struct FakeWatcher {
    counters: Arc<WatcherCounters>,
}

#[async_trait]
impl EndpointWatcher for FakeWatcher {
    async fn start(&mut self, selector: &LabelSelector) -> Result<(), WatcherError> {
        if self.counters.fail_start.load(Ordering::SeqCst) {
            return Err(WatcherError::Invalid("injected start failure".into()));
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.counters
            .selectors
            .lock()
            .unwrap()
            .push(selector.to_string());
        Ok(())
    }

    fn stop(&self) {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fast retries so tests observe requeues within milliseconds.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 1,
        max_delay_secs: 1,
        qps: 1000.0,
        burst: 1000,
    }
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub cluster: Arc<FakeClusterApi>,
    pub watchers: Arc<FakeWatcherFactory>,
    pub controller: ServiceImportController,
    pub token: CancellationToken,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        let source = Arc::new(FakeSource::default());
        let cluster = Arc::new(FakeClusterApi::default());
        let watchers = Arc::new(FakeWatcherFactory::default());
        let ctx = ControllerContext {
            source: source.clone(),
            cluster: cluster.clone(),
            watchers: watchers.clone(),
            cluster_id: "east".into(),
        };
        let queue = WorkQueue::new(fast_retry().limiter());
        Self {
            source,
            cluster,
            watchers,
            controller: ServiceImportController::new(ctx, queue, workers),
            token: CancellationToken::new(),
        }
    }

    pub fn started(workers: usize) -> Self {
        let h = Self::new(workers);
        h.controller.start(h.token.clone()).expect("controller start");
        h
    }

    pub async fn shutdown(&self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.controller.join())
            .await
            .expect("controller drained");
    }
}

/// Polls `cond` every 10ms for up to 5s.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time: {what}");
}

/// Lets queued work and short retries run out.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
