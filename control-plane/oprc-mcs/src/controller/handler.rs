use tracing::{debug, error, info};

use super::queue::WorkQueue;
use super::registry::DeletedImportCache;
use super::snapshot::{ServiceImportRef, ServiceImportSnapshot, SnapshotError};
use crate::crd::service_import::ServiceImport;
use crate::source::{DeletedImport, ImportEventHandler};

/// Turns source notifications into queue keys. Deletions of Headless imports
/// are snapshotted before their key is queued.
#[derive(Clone)]
pub struct QueueingHandler {
    queue: WorkQueue,
    deleted: DeletedImportCache,
}

impl QueueingHandler {
    pub fn new(queue: WorkQueue, deleted: DeletedImportCache) -> Self {
        Self { queue, deleted }
    }

    fn key_of(obj: &ServiceImport) -> Option<String> {
        match ServiceImportRef::from_object(obj) {
            Ok(r) => Some(r.key()),
            Err(e) => {
                error!(error = %e, "handler: cannot key service import");
                None
            }
        }
    }
}

/// Unwraps a delete payload into the snapshot the cleanup path works from.
pub fn resolve_deleted(
    deleted: &DeletedImport,
) -> Result<ServiceImportSnapshot, SnapshotError> {
    match deleted {
        DeletedImport::Object(obj) => ServiceImportSnapshot::try_from(obj),
        DeletedImport::LastKnown {
            last_known: Some(obj),
            ..
        } => ServiceImportSnapshot::try_from(obj),
        DeletedImport::LastKnown {
            key,
            last_known: None,
        } => Err(SnapshotError::EmptyTombstone(key.clone())),
    }
}

impl ImportEventHandler for QueueingHandler {
    fn on_add(&self, obj: &ServiceImport) {
        let Some(key) = Self::key_of(obj) else { return };
        debug!(%key, "ServiceImport added");
        self.queue.add(&key);
    }

    fn on_update(&self, _old: &ServiceImport, new: &ServiceImport) {
        let Some(key) = Self::key_of(new) else { return };
        info!(%key, "ServiceImport updated");
        self.queue.add(&key);
    }

    fn on_delete(&self, deleted: DeletedImport) {
        let snapshot = match resolve_deleted(&deleted) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "handler: dropping unresolvable delete");
                return;
            }
        };
        let key = snapshot.key();
        info!(%key, "ServiceImport deleted");
        if !snapshot.is_headless() {
            return;
        }
        self.deleted.store(&key, snapshot);
        self.queue.add_rate_limited(&key);
    }
}
