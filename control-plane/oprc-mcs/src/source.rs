//! Notification source for `ServiceImport` objects.
//!
//! The controller sees the source through [`ImportSource`]: it subscribes one
//! [`ImportEventHandler`], runs the source until cancelled and reads back
//! last-observed objects by `namespace/name` key. [`KubeImportSource`] backs
//! this with a kube-rs watcher feeding a reflector store through
//! [`ImportReflector`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use kube::Client;
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::snapshot::{RefParseError, ServiceImportRef};
use crate::crd::service_import::ServiceImport;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SourceError {
    #[error("invalid cache key: {0}")]
    InvalidKey(#[from] RefParseError),
    #[error("an event handler is already subscribed")]
    AlreadySubscribed,
}

/// Payload of a delete notification.
#[derive(Clone, Debug)]
pub enum DeletedImport {
    /// The object as it was when the watch reported its deletion.
    Object(ServiceImport),
    /// The deletion was inferred (for example after a relist) and only the
    /// cached value, if any, is known.
    LastKnown {
        key: String,
        last_known: Option<ServiceImport>,
    },
}

pub trait ImportEventHandler: Send + Sync {
    fn on_add(&self, obj: &ServiceImport);
    fn on_update(&self, old: &ServiceImport, new: &ServiceImport);
    fn on_delete(&self, deleted: DeletedImport);
}

#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Registers the single handler events are delivered to.
    fn subscribe(
        &self,
        handler: Arc<dyn ImportEventHandler>,
    ) -> Result<(), SourceError>;

    /// Delivers events until `token` is cancelled.
    async fn run(&self, token: CancellationToken);

    /// Last observed object for `key`, `Ok(None)` when it is not cached.
    fn lookup(&self, key: &str) -> Result<Option<Arc<ServiceImport>>, SourceError>;
}

fn import_ref(obj: &ServiceImport) -> Option<ServiceImportRef> {
    match ServiceImportRef::from_object(obj) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(error = %e, "source: ignoring service import");
            None
        }
    }
}

fn object_ref(r: &ServiceImportRef) -> ObjectRef<ServiceImport> {
    ObjectRef::new(&r.name).within(&r.namespace)
}

#[derive(Default)]
struct Relist {
    before: BTreeMap<String, Arc<ServiceImport>>,
    seen: Vec<(String, ServiceImport)>,
}

/// Feeds watcher events into a kube reflector store and turns them into
/// handler notifications.
///
/// A relist is only reported once it completes: the store swaps to the new
/// list on `InitDone`, then every listed object is delivered as an add or an
/// update and every object missing from it as a
/// [`DeletedImport::LastKnown`] tombstone.
pub struct ImportReflector {
    writer: Writer<ServiceImport>,
    store: Store<ServiceImport>,
    relist: Option<Relist>,
    synced: bool,
}

impl Default for ImportReflector {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportReflector {
    pub fn new() -> Self {
        let (store, writer) = reflector::store();
        Self {
            writer,
            store,
            relist: None,
            synced: false,
        }
    }

    pub fn reader(&self) -> Store<ServiceImport> {
        self.store.clone()
    }

    fn state_by_key(&self) -> BTreeMap<String, Arc<ServiceImport>> {
        self.store
            .state()
            .into_iter()
            .filter_map(|obj| {
                ServiceImportRef::from_object(&obj)
                    .ok()
                    .map(|r| (r.key(), obj))
            })
            .collect()
    }

    pub fn dispatch(
        &mut self,
        event: watcher::Event<ServiceImport>,
        handler: &dyn ImportEventHandler,
    ) {
        match &event {
            watcher::Event::Init => {
                self.writer.apply_watcher_event(&event);
                self.relist = Some(Relist {
                    before: self.state_by_key(),
                    seen: Vec::new(),
                });
            }
            watcher::Event::InitApply(obj) => {
                let Some(r) = import_ref(obj) else { return };
                if self.relist.is_none() {
                    self.relist = Some(Relist {
                        before: self.state_by_key(),
                        seen: Vec::new(),
                    });
                }
                self.writer.apply_watcher_event(&event);
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.push((r.key(), obj.clone()));
                }
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                let Relist { mut before, seen } = self.relist.take().unwrap_or_default();
                for (key, obj) in &seen {
                    match before.remove(key) {
                        Some(old) => handler.on_update(&old, obj),
                        None => handler.on_add(obj),
                    }
                }
                for (key, old) in before {
                    debug!(%key, "source: object vanished during relist");
                    handler.on_delete(DeletedImport::LastKnown {
                        key,
                        last_known: Some((*old).clone()),
                    });
                }
                if !self.synced {
                    self.synced = true;
                    info!(objects = seen.len(), "source: initial list synced");
                }
            }
            watcher::Event::Apply(obj) => {
                let Some(r) = import_ref(obj) else { return };
                let old = self.store.get(&object_ref(&r));
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => handler.on_update(&old, obj),
                    None => handler.on_add(obj),
                }
            }
            watcher::Event::Delete(obj) => {
                if import_ref(obj).is_none() {
                    return;
                }
                self.writer.apply_watcher_event(&event);
                handler.on_delete(DeletedImport::Object(obj.clone()));
            }
        }
    }
}

fn lookup_in(
    store: &Store<ServiceImport>,
    key: &str,
) -> Result<Option<Arc<ServiceImport>>, SourceError> {
    let r = ServiceImportRef::parse(key)?;
    Ok(store.get(&object_ref(&r)))
}

fn store_ready(store: &Store<ServiceImport>) -> bool {
    store
        .wait_until_ready()
        .now_or_never()
        .is_some_and(|ready| ready.is_ok())
}

pub struct KubeImportSource {
    api: Api<ServiceImport>,
    namespace: String,
    store: Store<ServiceImport>,
    reflector: Mutex<Option<ImportReflector>>,
    handler: OnceLock<Arc<dyn ImportEventHandler>>,
}

impl KubeImportSource {
    pub fn new(client: Client, namespace: &str) -> Self {
        let reflector = ImportReflector::new();
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            store: reflector.reader(),
            reflector: Mutex::new(Some(reflector)),
            handler: OnceLock::new(),
        }
    }

    /// Whether the first full list has been stored.
    pub fn has_synced(&self) -> bool {
        store_ready(&self.store)
    }

    pub fn store(&self) -> Store<ServiceImport> {
        self.store.clone()
    }
}

#[async_trait]
impl ImportSource for KubeImportSource {
    fn subscribe(
        &self,
        handler: Arc<dyn ImportEventHandler>,
    ) -> Result<(), SourceError> {
        self.handler
            .set(handler)
            .map_err(|_| SourceError::AlreadySubscribed)
    }

    async fn run(&self, token: CancellationToken) {
        let Some(handler) = self.handler.get().cloned() else {
            warn!(ns = %self.namespace, "source: run without a subscribed handler");
            return;
        };
        let taken = {
            let mut slot = self.reflector.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        let Some(mut reflector) = taken else {
            warn!(ns = %self.namespace, "source: already running");
            return;
        };
        info!(ns = %self.namespace, "source: watching service imports");
        let mut stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                ev = stream.next() => ev,
            };
            match event {
                Some(Ok(ev)) => reflector.dispatch(ev, handler.as_ref()),
                Some(Err(e)) => warn!(ns = %self.namespace, error = %e, "source: watch error"),
                None => break,
            }
        }
        *self.reflector.lock().unwrap_or_else(PoisonError::into_inner) = Some(reflector);
        info!(ns = %self.namespace, "source: stopped");
    }

    fn lookup(&self, key: &str) -> Result<Option<Arc<ServiceImport>>, SourceError> {
        lookup_in(&self.store, key)
    }
}
