use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use draftq_storage::{
    DurableStore, DurableStoreChange, DurableStoreEntries, DurableStoreOperation, StorageError,
};

/// Delays every read and write of the wrapped store, widening race windows in tests.
pub struct LatencyStore {
    inner: Arc<dyn DurableStore>,
    delay: Duration,
}

impl LatencyStore {
    pub fn new(inner: Arc<dyn DurableStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DurableStore for LatencyStore {
    async fn get_entries(
        &self,
        ids: &[String],
        segment: &str,
    ) -> Result<DurableStoreEntries, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_entries(ids, segment).await
    }

    async fn get_all_entries(&self, segment: &str) -> Result<DurableStoreEntries, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_all_entries(segment).await
    }

    async fn batch_operations(
        &self,
        operations: Vec<DurableStoreOperation>,
    ) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.batch_operations(operations).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DurableStoreChange>> {
        self.inner.subscribe()
    }
}
