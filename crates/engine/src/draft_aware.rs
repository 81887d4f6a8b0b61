use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error};

use draftq_core::{DraftAction, METADATA_API_NAME};
use draftq_storage::{
    DEFAULT_SEGMENT, DRAFT_ID_MAPPINGS_SEGMENT, DRAFT_SEGMENT, DurableStore, DurableStoreChange,
    DurableStoreEntries, DurableStoreOperation, StorageError,
};

use crate::denormalize::normalize_record;
use crate::metadata::{ObjectInfoSource, object_info_or_empty};
use crate::overlay::{SYNTHETIC_WEAK_ETAG, build_synthetic_record};

/// Rebuilds stored overlays from the persisted draft list. The stored record
/// must be read in the same serialized turn as the write, or a concurrent
/// server write can be rolled back.
#[async_trait]
pub trait OverlayRefresh: Send + Sync {
    async fn refresh_overlays(&self, keys: &[String]) -> Result<(), StorageError>;
}

/// Keeps stored records in sync with the draft queue: every write to the DRAFT
/// segment refreshes the overlays of the records it touches.
pub struct DraftAwareDurableStore {
    inner: Arc<dyn DurableStore>,
    overlays: Arc<dyn OverlayRefresh>,
    object_infos: Arc<dyn ObjectInfoSource>,
    user_id: String,
}

impl DraftAwareDurableStore {
    pub fn new(
        inner: Arc<dyn DurableStore>,
        overlays: Arc<dyn OverlayRefresh>,
        object_infos: Arc<dyn ObjectInfoSource>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            overlays,
            object_infos,
            user_id: user_id.into(),
        }
    }

    fn api_name_of(action: &DraftAction) -> Option<String> {
        action
            .resource()
            .and_then(|r| r.body.as_ref())
            .and_then(|b| b.api_name.clone())
            .or_else(|| action.metadata.get(METADATA_API_NAME).cloned())
    }

    /// Write the synthetic record of each written create draft, and drop the
    /// synthetic record of a create draft that went away without a server id.
    async fn sync_synthetic_records(
        &self,
        written: &[DraftAction],
        evicted: &[DraftAction],
    ) -> Result<(), StorageError> {
        let creates: Vec<&DraftAction> = written.iter().filter(|a| a.is_create()).collect();
        if !creates.is_empty() {
            let tags: Vec<String> = creates.iter().map(|a| a.tag.clone()).collect();
            let existing = self.inner.get_entries(&tags, DEFAULT_SEGMENT).await?;
            let mut entries = DurableStoreEntries::new();
            // A rewritten create (e.g. a swapped reference) rebuilds its synthetic record;
            // a record the server already returned is left alone.
            let needs_synthetic = |tag: &str| {
                existing
                    .get(tag)
                    .and_then(|e| e.as_record())
                    .is_none_or(|r| r.weak_etag == SYNTHETIC_WEAK_ETAG)
            };
            for create in creates.into_iter().filter(|a| needs_synthetic(&a.tag)) {
                let api_name = Self::api_name_of(create).unwrap_or_default();
                let info = object_info_or_empty(self.object_infos.as_ref(), &api_name).await;
                match build_synthetic_record(create, &info, &self.user_id) {
                    Ok(record) => entries.extend(normalize_record(&record)),
                    Err(e) => error!(id = %create.id, error = %e, "cannot synthesize record for create draft"),
                }
            }
            if !entries.is_empty() {
                self.inner.set_entries(entries, DEFAULT_SEGMENT).await?;
            }
        }

        let written_tags: BTreeSet<&str> = written.iter().map(|a| a.tag.as_str()).collect();
        let gone: Vec<String> = evicted
            .iter()
            .filter(|a| a.is_create() && !written_tags.contains(a.tag.as_str()))
            .map(|a| a.tag.clone())
            .collect();
        if !gone.is_empty() {
            let mapped = self
                .inner
                .get_entries(&gone, DRAFT_ID_MAPPINGS_SEGMENT)
                .await?;
            let unmapped: Vec<String> = gone
                .into_iter()
                .filter(|tag| !mapped.contains_key(tag))
                .collect();
            if !unmapped.is_empty() {
                debug!(count = unmapped.len(), "evicting synthetic records of removed creates");
                self.inner.evict_entries(&unmapped, DEFAULT_SEGMENT).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for DraftAwareDurableStore {
    async fn get_entries(
        &self,
        ids: &[String],
        segment: &str,
    ) -> Result<DurableStoreEntries, StorageError> {
        self.inner.get_entries(ids, segment).await
    }

    async fn get_all_entries(&self, segment: &str) -> Result<DurableStoreEntries, StorageError> {
        self.inner.get_all_entries(segment).await
    }

    async fn batch_operations(
        &self,
        operations: Vec<DurableStoreOperation>,
    ) -> Result<(), StorageError> {
        let draft_ids: Vec<String> = operations
            .iter()
            .filter(|op| op.segment() == DRAFT_SEGMENT)
            .flat_map(|op| op.keys())
            .collect();
        if draft_ids.is_empty() {
            return self.inner.batch_operations(operations).await;
        }

        let previous = self.inner.get_entries(&draft_ids, DRAFT_SEGMENT).await?;
        let mut written = Vec::new();
        let mut evicted = Vec::new();
        for op in &operations {
            match op {
                DurableStoreOperation::SetEntries { segment, entries } if segment == DRAFT_SEGMENT => {
                    written.extend(entries.values().filter_map(|e| e.as_draft_action().cloned()));
                }
                DurableStoreOperation::EvictEntries { segment, ids } if segment == DRAFT_SEGMENT => {
                    evicted.extend(
                        ids.iter()
                            .filter_map(|id| previous.get(id))
                            .filter_map(|e| e.as_draft_action().cloned()),
                    );
                }
                _ => {}
            }
        }

        self.inner.batch_operations(operations).await?;

        let mut affected: BTreeSet<String> = BTreeSet::new();
        affected.extend(written.iter().map(|a| a.tag.clone()));
        affected.extend(evicted.iter().map(|a| a.tag.clone()));
        affected.extend(
            previous
                .values()
                .filter_map(|e| e.as_draft_action())
                .map(|a| a.tag.clone()),
        );

        self.sync_synthetic_records(&written, &evicted).await?;
        let affected: Vec<String> = affected.into_iter().collect();
        self.overlays.refresh_overlays(&affected).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DurableStoreChange>> {
        self.inner.subscribe()
    }
}
