//! API server builder and router

use std::sync::Arc;

use axum::Router;
use storage::{MemoryStorage, Storage};
use tower_http::trace::TraceLayer;

use crate::metadata::{MemoryMetadataStore, MetadataStore};
use crate::registry::Registry;
use crate::upload::DEFAULT_CHUNK_SIZE;

/// Registry builder for configuring and creating the image registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    metadata: Option<Arc<dyn MetadataStore>>,
    delayed_delete: bool,
    chunk_size: usize,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            metadata: None,
            delayed_delete: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the storage backend. Defaults to an empty in-memory backend.
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the metadata store. Defaults to an empty in-memory store.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Defer backend cleanup of deleted active images to [`Registry::scrub`]
    pub fn delayed_delete(mut self, delayed_delete: bool) -> Self {
        self.delayed_delete = delayed_delete;
        self
    }

    /// Bound the size of each chunk written to the backend
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Build the registry facade without the HTTP layer
    pub fn registry(self) -> Registry {
        let storage = self
            .storage
            .unwrap_or_else(|| MemoryStorage::new().into());
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadataStore::new()));

        Registry::new(metadata, storage)
            .with_chunk_size(self.chunk_size)
            .with_delayed_delete(self.delayed_delete)
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        router(self.registry())
    }
}

/// Serve a registry over HTTP
pub fn router(registry: Registry) -> Router {
    Router::new()
        .merge(crate::images::router())
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = MemoryStorage::with_capacity(1024);
        let _registry = RegistryBuilder::new()
            .storage(storage.into())
            .delayed_delete(true)
            .chunk_size(512)
            .build();
    }

    #[tokio::test]
    async fn builder_defaults_to_memory() {
        let registry = RegistryBuilder::default().registry();
        assert_eq!(registry.storage().scheme(), "memory");
        assert!(
            registry
                .list_details(&Default::default())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
