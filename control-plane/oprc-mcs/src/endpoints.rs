//! Per-import endpoint watchers.
//!
//! The controller only drives their lifecycle through
//! [`EndpointWatcherFactory`] and [`EndpointWatcher`]. [`PodEndpointWatcher`]
//! is the in-cluster implementation: it follows the pods selected by the
//! origin service and republishes their addresses as a single EndpointSlice
//! tagged with this cluster's identity.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::selector::LabelSelector;

pub const SOURCE_CLUSTER_LABEL: &str = "lighthouse.submariner.io/sourceCluster";
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";
const FIELD_MANAGER: &str = "oprc-mcs";

#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    #[error("invalid endpoint watcher target: {0}")]
    Invalid(String),
    #[error("endpoint watcher already started")]
    AlreadyStarted,
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
}

/// Identity the watcher publishes under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchTarget {
    pub import_uid: String,
    pub import_name: String,
    pub import_namespace: String,
    pub origin_namespace: String,
    pub cluster_id: String,
}

impl WatchTarget {
    pub fn validate(&self) -> Result<(), WatcherError> {
        if self.import_name.is_empty() {
            return Err(WatcherError::Invalid("empty import name".into()));
        }
        if self.cluster_id.is_empty() {
            return Err(WatcherError::Invalid("empty cluster id".into()));
        }
        Ok(())
    }

    pub fn slice_name(&self) -> String {
        format!("{}-{}", self.import_name, self.cluster_id)
    }
}

pub trait EndpointWatcherFactory: Send + Sync {
    fn create(
        &self,
        target: &WatchTarget,
    ) -> Result<Box<dyn EndpointWatcher>, WatcherError>;
}

#[async_trait]
pub trait EndpointWatcher: Send + Sync {
    async fn start(&mut self, selector: &LabelSelector) -> Result<(), WatcherError>;
    /// Best effort and idempotent.
    fn stop(&self);
}

pub struct PodEndpointWatcherFactory {
    client: Client,
}

impl PodEndpointWatcherFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EndpointWatcherFactory for PodEndpointWatcherFactory {
    fn create(
        &self,
        target: &WatchTarget,
    ) -> Result<Box<dyn EndpointWatcher>, WatcherError> {
        target.validate()?;
        Ok(Box::new(PodEndpointWatcher {
            client: self.client.clone(),
            target: target.clone(),
            token: CancellationToken::new(),
            task: None,
        }))
    }
}

pub struct PodEndpointWatcher {
    client: Client,
    target: WatchTarget,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl EndpointWatcher for PodEndpointWatcher {
    async fn start(&mut self, selector: &LabelSelector) -> Result<(), WatcherError> {
        if self.task.is_some() {
            return Err(WatcherError::AlreadyStarted);
        }
        let pods: Api<Pod> =
            Api::namespaced(self.client.clone(), &self.target.origin_namespace);
        let slices: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), &self.target.import_namespace);
        let selector = selector.to_string();
        // Surface RBAC or connectivity problems to the caller.
        pods.list(&ListParams::default().labels(&selector).limit(1))
            .await?;

        let cfg = watcher::Config::default().labels(&selector);
        let target = self.target.clone();
        let token = self.token.clone();
        self.task = Some(tokio::spawn(async move {
            publish_loop(pods, slices, cfg, target, token).await;
        }));
        info!(import = %self.target.import_name, %selector, "endpoint watcher started");
        Ok(())
    }

    fn stop(&self) {
        if !self.token.is_cancelled() {
            info!(import = %self.target.import_name, "endpoint watcher stopping");
        }
        self.token.cancel();
        // An apply still in flight must not land after the slices are deleted.
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn publish_loop(
    pods: Api<Pod>,
    slices: Api<EndpointSlice>,
    cfg: watcher::Config,
    target: WatchTarget,
    token: CancellationToken,
) {
    let mut stream = watcher(pods, cfg).default_backoff().boxed();
    let mut current: BTreeMap<String, PodAddress> = BTreeMap::new();
    let mut relist: Option<BTreeMap<String, PodAddress>> = None;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            ev = stream.next() => ev,
        };
        let changed = match event {
            Some(Ok(watcher::Event::Init)) => {
                relist = Some(BTreeMap::new());
                false
            }
            Some(Ok(watcher::Event::InitApply(pod))) => {
                if let (Some(pending), Some(addr)) =
                    (relist.as_mut(), PodAddress::from_pod(&pod))
                {
                    pending.insert(pod.name_any(), addr);
                }
                false
            }
            Some(Ok(watcher::Event::InitDone)) => {
                current = relist.take().unwrap_or_default();
                true
            }
            Some(Ok(watcher::Event::Apply(pod))) => match PodAddress::from_pod(&pod) {
                Some(addr) => current.insert(pod.name_any(), addr.clone()) != Some(addr),
                None => current.remove(&pod.name_any()).is_some(),
            },
            Some(Ok(watcher::Event::Delete(pod))) => {
                current.remove(&pod.name_any()).is_some()
            }
            Some(Err(e)) => {
                warn!(import = %target.import_name, error = %e, "pod watch error");
                false
            }
            None => break,
        };
        if changed {
            publish(&slices, &target, &current).await;
        }
    }
    debug!(import = %target.import_name, "endpoint watcher stopped");
}

async fn publish(
    slices: &Api<EndpointSlice>,
    target: &WatchTarget,
    endpoints: &BTreeMap<String, PodAddress>,
) {
    let slice = build_endpoint_slice(target, endpoints);
    let name = target.slice_name();
    let body = match serde_json::to_value(&slice) {
        Ok(v) => v,
        Err(e) => {
            warn!(%name, error = %e, "endpoint slice serialization failed");
            return;
        }
    };
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    match slices.patch(&name, &pp, &Patch::Apply(&body)).await {
        Ok(_) => debug!(%name, count = endpoints.len(), "endpoint slice applied"),
        Err(e) => warn!(%name, error = %e, "endpoint slice apply failed"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodAddress {
    pub ip: String,
    pub ready: bool,
}

impl PodAddress {
    /// `None` until the pod has been assigned an IP.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let status = pod.status.as_ref()?;
        let ip = status.pod_ip.clone().filter(|ip| !ip.is_empty())?;
        let ready = status
            .conditions
            .as_ref()
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
        Some(Self { ip, ready })
    }
}

pub fn build_endpoint_slice(
    target: &WatchTarget,
    endpoints: &BTreeMap<String, PodAddress>,
) -> EndpointSlice {
    let labels = BTreeMap::from([
        ("app".to_string(), target.import_name.clone()),
        (SOURCE_CLUSTER_LABEL.to_string(), target.cluster_id.clone()),
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
    ]);
    let owner = (!target.import_uid.is_empty()).then(|| {
        vec![OwnerReference {
            api_version: "lighthouse.submariner.io/v2alpha1".into(),
            kind: "ServiceImport".into(),
            name: target.import_name.clone(),
            uid: target.import_uid.clone(),
            ..Default::default()
        }]
    });
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(target.slice_name()),
            namespace: Some(target.import_namespace.clone()),
            labels: Some(labels),
            owner_references: owner,
            ..Default::default()
        },
        address_type: "IPv4".into(),
        endpoints: endpoints
            .iter()
            .map(|(pod, addr)| Endpoint {
                addresses: vec![addr.ip.clone()],
                hostname: Some(pod.clone()),
                conditions: Some(EndpointConditions {
                    ready: Some(addr.ready),
                    ..Default::default()
                }),
                target_ref: Some(ObjectReference {
                    kind: Some("Pod".into()),
                    name: Some(pod.clone()),
                    namespace: Some(target.origin_namespace.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: None,
    }
}
