//! Application state shared across request handlers.

use std::sync::Arc;

use crate::allocation::ServerAllocator;
use crate::db::WorldStore;
use crate::publisher::EventPublisher;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn WorldStore>,
    allocator: Arc<ServerAllocator>,
    publisher: Arc<dyn EventPublisher>,
    instance_name: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn WorldStore>,
        allocator: Arc<ServerAllocator>,
        publisher: Arc<dyn EventPublisher>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                allocator,
                publisher,
                instance_name: instance_name.into(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorldStore> {
        &self.inner.store
    }

    pub fn allocator(&self) -> &ServerAllocator {
        &self.inner.allocator
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.inner.publisher
    }

    /// Source name stamped on published envelopes.
    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }
}
