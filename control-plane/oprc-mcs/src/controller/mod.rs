pub mod handler;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::endpoints::EndpointWatcherFactory;
use crate::source::{ImportSource, SourceError};
use handler::QueueingHandler;
use queue::WorkQueue;
use reconcile::Reconciler;
use registry::{DeletedImportCache, WatcherRegistry};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("controller already started")]
    AlreadyStarted,
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("source wiring failed: {0}")]
    Source(#[from] SourceError),
}

/// External collaborators of the controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub source: Arc<dyn ImportSource>,
    pub cluster: Arc<dyn ClusterApi>,
    pub watchers: Arc<dyn EndpointWatcherFactory>,
    pub cluster_id: String,
}

/// Reconciles Headless `ServiceImport`s into running endpoint watchers.
pub struct ServiceImportController {
    reconciler: Arc<Reconciler>,
    workers: usize,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceImportController {
    pub fn new(ctx: ControllerContext, queue: WorkQueue, workers: usize) -> Self {
        Self {
            reconciler: Arc::new(Reconciler {
                queue,
                source: ctx.source,
                cluster: ctx.cluster,
                watchers: ctx.watchers,
                registry: WatcherRegistry::new(),
                deleted: DeletedImportCache::new(),
                cluster_id: ctx.cluster_id,
            }),
            workers,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wires the source to the queue and spawns the source, the workers and
    /// a task that shuts the queue down once `token` is cancelled. Returns
    /// without waiting for any of them.
    pub fn start(&self, token: CancellationToken) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::NoWorkers);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ControllerError::AlreadyStarted);
        }
        let r = &self.reconciler;
        let handler = QueueingHandler::new(r.queue.clone(), r.deleted.clone());
        if let Err(e) = r.source.subscribe(Arc::new(handler)) {
            self.started.store(false, Ordering::Release);
            return Err(e.into());
        }
        info!(workers = self.workers, cluster = %r.cluster_id, "starting ServiceImport controller");

        let mut tasks = Vec::with_capacity(self.workers + 2);
        let source = r.source.clone();
        let source_token = token.clone();
        tasks.push(tokio::spawn(async move { source.run(source_token).await }));
        for id in 0..self.workers {
            tasks.push(tokio::spawn(r.clone().run_worker(id)));
        }
        let queue = r.queue.clone();
        tasks.push(tokio::spawn(async move {
            token.cancelled().await;
            queue.shut_down();
            info!("ServiceImport controller stopped");
        }));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    /// Waits for every spawned task. Only returns after the start token has
    /// been cancelled and the queue has drained.
    pub async fn join(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "controller task failed");
            }
        }
    }

    /// Stops every registered endpoint watcher.
    pub fn stop_all_watchers(&self) {
        self.reconciler.registry.stop_all();
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.reconciler.registry
    }

    pub fn deleted_imports(&self) -> &DeletedImportCache {
        &self.reconciler.deleted
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.reconciler.queue
    }
}
