//! Fans datastore updates out to the handlers registered for each kind of object.

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use policy_graph_core::{Delta, DeltaKind, SyncStatus, Update};
use std::{fmt, sync::Arc};

/// Processes datastore updates.
pub trait UpdateHandler {
    fn on_update(&mut self, update: &Update);

    fn on_status(&mut self, _status: SyncStatus) {}
}

pub type SharedHandler = Arc<RwLock<dyn UpdateHandler + Send + Sync>>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<DeltaKind, Vec<SharedHandler>>,
    status: Vec<SharedHandler>,
}

/// Forwards only updates for endpoints on the local host. Updates for other kinds of objects
/// pass through unfiltered.
#[derive(Debug)]
pub struct LocalEndpoints<H> {
    hostname: String,
    inner: H,
}

// === impl Dispatcher ===

impl Dispatcher {
    /// Registers a handler for a kind of update. Handlers are invoked in registration order.
    pub fn register(&mut self, kind: DeltaKind, handler: SharedHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Registers a handler for sync status changes.
    pub fn register_status(&mut self, handler: SharedHandler) {
        self.status.push(handler);
    }

    pub fn deliver(&self, update: &Update) {
        let kind = update.kind();
        let handlers = self.handlers.get(&kind).map(Vec::as_slice).unwrap_or_default();
        if handlers.is_empty() {
            tracing::trace!(?kind, "No handlers registered");
        }
        for handler in handlers {
            handler.write().on_update(update);
        }
    }

    pub fn on_status(&self, status: SyncStatus) {
        tracing::debug!(?status, "Sync status changed");
        for handler in &self.status {
            handler.write().on_status(status);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds = self
            .handlers
            .iter()
            .map(|(k, hs)| (*k, hs.len()))
            .collect::<Vec<_>>();
        kinds.sort_by_key(|(k, _)| format!("{k:?}"));
        f.debug_struct("Dispatcher")
            .field("handlers", &kinds)
            .field("status", &self.status.len())
            .finish()
    }
}

// === impl LocalEndpoints ===

impl<H> LocalEndpoints<H> {
    pub fn new(hostname: impl ToString, inner: H) -> Self {
        Self {
            hostname: hostname.to_string(),
            inner,
        }
    }
}

impl<H: UpdateHandler> UpdateHandler for LocalEndpoints<H> {
    fn on_update(&mut self, update: &Update) {
        if let Delta::Endpoint { key, .. } = &update.delta {
            if key.hostname() != self.hostname {
                tracing::trace!(%key, "Skipping remote endpoint");
                return;
            }
        }
        self.inner.on_update(update);
    }

    fn on_status(&mut self, status: SyncStatus) {
        self.inner.on_status(status);
    }
}

impl<H: UpdateHandler + ?Sized> UpdateHandler for Arc<RwLock<H>> {
    fn on_update(&mut self, update: &Update) {
        self.write().on_update(update);
    }

    fn on_status(&mut self, status: SyncStatus) {
        self.write().on_status(status);
    }
}
