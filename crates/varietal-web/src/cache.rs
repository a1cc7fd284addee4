use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use varietal_core::SnapshotDocument;
use varietal_storage::{SnapshotError, SnapshotStore};

/// The query layer's view of the snapshot file.
///
/// Loaded lazily on first read. A new document only becomes visible through
/// [`SnapshotCache::reload`], which parses the file outside the lock and then
/// swaps the shared pointer, so a reader holds either the old document or the
/// new one in full.
#[derive(Debug)]
pub struct SnapshotCache {
    store: SnapshotStore,
    current: RwLock<Option<Arc<SnapshotDocument>>>,
}

impl SnapshotCache {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn get(&self) -> Result<Arc<SnapshotDocument>, SnapshotError> {
        if let Some(document) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(document));
        }
        self.reload().await
    }

    /// Re-read the file. On failure the previously cached document stays.
    pub async fn reload(&self) -> Result<Arc<SnapshotDocument>, SnapshotError> {
        let document = Arc::new(self.store.load().await?);
        *self.current.write().await = Some(Arc::clone(&document));
        info!(
            varieties = document.total_count,
            scraped_at = %document.scraped_at,
            "snapshot loaded"
        );
        Ok(document)
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }
}
