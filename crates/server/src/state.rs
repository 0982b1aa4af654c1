//! Application state shared across handlers.

use crate::dedup::DedupCoordinator;
use hoard_core::config::AppConfig;
use hoard_metadata::MetadataStore;
use hoard_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Blob store backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Coordinator built over the two stores above.
    pub coordinator: Arc<DedupCoordinator>,
}

impl AppState {
    /// Create the application state. Store handles are injected; nothing
    /// here reaches for process-wide clients.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let coordinator = Arc::new(DedupCoordinator::new(metadata.clone(), storage.clone()));
        Self {
            config: Arc::new(config),
            storage,
            metadata,
            coordinator,
        }
    }

    /// Largest part buffered in memory before spooling to a staging object.
    pub fn max_memory_buffer(&self) -> usize {
        usize::try_from(self.config.server.max_memory_buffer).unwrap_or(usize::MAX)
    }

    /// Request body ceiling.
    pub fn max_upload_size(&self) -> usize {
        usize::try_from(self.config.server.max_upload_size).unwrap_or(usize::MAX)
    }
}
