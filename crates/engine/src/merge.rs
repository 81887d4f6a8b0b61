//! Read-merge-write for record entries.
//!
//! Independent writers (network fills, draft recomputes, completions) may each
//! hold a partial view of a record. Writes touching record keys take a turn in
//! one fair queue, read what is stored and merge before persisting, so no
//! writer drops fields another one just wrote. Overlay refreshes run in the
//! same queue and read the stored record inside their turn.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, trace};

use draftq_core::{DraftAction, ObjectInfo, RecordRepresentation, StoreLink, field_key, is_record_key};
use draftq_storage::{
    DEFAULT_SEGMENT, DurableStore, DurableStoreChange, DurableStoreEntries, DurableStoreEntry,
    DurableStoreOperation, EntryData, StorageError,
};

use crate::draft_aware::OverlayRefresh;
use crate::error::EngineError;
use crate::metadata::{ObjectInfoSource, object_info_or_empty};
use crate::overlay::{build_overlay, remove_drafts, replay_drafts};
use crate::queue::DraftActionSource;

pub fn should_merge(keys: &[String]) -> bool {
    keys.iter().any(|k| is_record_key(k))
}

fn is_older(incoming: &RecordRepresentation, existing: &RecordRepresentation) -> bool {
    incoming.weak_etag < existing.weak_etag
}

/// Union of both canonical field sets. Incoming wins on conflicts and supplies
/// the header unless it carries an older version than the stored record, in
/// which case it only fills in fields the stored record lacks.
pub fn merge_records(
    existing: &RecordRepresentation,
    incoming: &RecordRepresentation,
) -> RecordRepresentation {
    let existing = remove_drafts(existing);
    let incoming = remove_drafts(incoming);
    let (mut merged, base) = if is_older(&incoming, &existing) {
        (existing, incoming)
    } else {
        (incoming, existing)
    };
    for (name, field) in base.fields {
        if let Some(link) = base.links.get(&name) {
            merged.links.entry(name.clone()).or_insert_with(|| link.clone());
        }
        merged.fields.entry(name).or_insert(field);
    }
    merged
}

/// Every inline field keeps a pointer to its cache key, drafted ones included.
fn link_inline_fields(record: &mut RecordRepresentation) {
    let key = record.key();
    for name in record.fields.keys() {
        record
            .links
            .entry(name.clone())
            .or_insert_with(|| StoreLink::new(field_key(&key, name)));
    }
}

/// Merge `incoming` over `existing` and re-derive the overlay from `drafts`.
/// Entries that are not records replace whatever was stored.
pub fn merge_durable_entries(
    existing: Option<&DurableStoreEntry>,
    incoming: DurableStoreEntry,
    drafts: &[DraftAction],
    object_info: &ObjectInfo,
    user_id: &str,
) -> Result<DurableStoreEntry, EngineError> {
    let EntryData::Record(incoming_record) = &incoming.data else {
        return Ok(incoming);
    };
    let (merged, expiration) = match existing.map(|e| (e, e.as_record())) {
        Some((entry, Some(existing_record))) if is_older(incoming_record, existing_record) => {
            (merge_records(existing_record, incoming_record), entry.expiration)
        }
        Some((_, Some(existing_record))) => {
            (merge_records(existing_record, incoming_record), incoming.expiration)
        }
        _ => (remove_drafts(incoming_record), incoming.expiration),
    };
    let mut record = replay_drafts(&merged, drafts, object_info, user_id)?;
    link_inline_fields(&mut record);
    Ok(DurableStoreEntry {
        data: EntryData::Record(record),
        expiration,
    })
}

pub struct MergingDurableStore {
    inner: Arc<dyn DurableStore>,
    object_infos: Arc<dyn ObjectInfoSource>,
    user_id: String,
    merge_queue: Mutex<()>,
}

impl MergingDurableStore {
    pub fn new(
        inner: Arc<dyn DurableStore>,
        object_infos: Arc<dyn ObjectInfoSource>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            object_infos,
            user_id: user_id.into(),
            merge_queue: Mutex::new(()),
        }
    }

    async fn merge_set(
        &self,
        segment: &str,
        entries: DurableStoreEntries,
        drafts: &[DraftAction],
    ) -> Result<DurableStoreEntries, StorageError> {
        let keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| is_record_key(k) && matches!(e.data, EntryData::Record(_)))
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return Ok(entries);
        }
        let existing = self.inner.get_entries(&keys, segment).await?;

        let mut merged = DurableStoreEntries::new();
        for (key, entry) in entries {
            let Some(record) = entry.as_record() else {
                merged.insert(key, entry);
                continue;
            };
            if !is_record_key(&key) {
                merged.insert(key, entry);
                continue;
            }
            let info = object_info_or_empty(self.object_infos.as_ref(), &record.api_name).await;
            let for_key: Vec<DraftAction> =
                drafts.iter().filter(|a| a.tag == key).cloned().collect();
            let fallback = entry.clone();
            let out = match merge_durable_entries(
                existing.get(&key),
                entry,
                &for_key,
                &info,
                &self.user_id,
            ) {
                Ok(out) => out,
                Err(e) => {
                    error!(key = %key, error = %e, "merge replay failed; storing incoming entry");
                    fallback
                }
            };
            merged.insert(key, out);
        }
        Ok(merged)
    }
}

#[async_trait]
impl OverlayRefresh for MergingDurableStore {
    async fn refresh_overlays(&self, keys: &[String]) -> Result<(), StorageError> {
        let keys: Vec<String> = keys.iter().filter(|k| is_record_key(k)).cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }

        let _turn = self.merge_queue.lock().await;
        trace!(keys = keys.len(), "overlay refresh turn acquired");
        let drafts = self.inner.all_draft_actions().await?;
        let stored = self.inner.get_entries(&keys, DEFAULT_SEGMENT).await?;

        let mut out = DurableStoreEntries::new();
        let mut stubs = Vec::new();
        for key in &keys {
            let Some(entry) = stored.get(key) else {
                continue;
            };
            let Some(record) = entry.as_record() else {
                continue;
            };
            let for_key: Vec<DraftAction> =
                drafts.iter().filter(|a| &a.tag == key).cloned().collect();
            let info = object_info_or_empty(self.object_infos.as_ref(), &record.api_name).await;
            match build_overlay(record, &for_key, &info, &self.user_id) {
                Ok(mut overlay) => {
                    link_inline_fields(&mut overlay.record);
                    stubs.append(&mut overlay.linked_records);
                    out.insert(
                        key.clone(),
                        DurableStoreEntry {
                            data: EntryData::Record(overlay.record),
                            expiration: entry.expiration,
                        },
                    );
                }
                Err(e) => error!(key = %key, error = %e, "draft replay failed; overlay left as is"),
            }
        }

        // Stubs never overwrite a stored record.
        if !stubs.is_empty() {
            let stub_keys: Vec<String> = stubs.iter().map(|r| r.key()).collect();
            let present = self.inner.get_entries(&stub_keys, DEFAULT_SEGMENT).await?;
            for mut stub in stubs {
                let key = stub.key();
                if present.contains_key(&key) || out.contains_key(&key) {
                    continue;
                }
                link_inline_fields(&mut stub);
                out.insert(key, DurableStoreEntry::record(stub));
            }
        }
        if out.is_empty() {
            return Ok(());
        }
        self.inner.set_entries(out, DEFAULT_SEGMENT).await
    }
}

#[async_trait]
impl DurableStore for MergingDurableStore {
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
        let needs_merge = operations.iter().any(|op| {
            matches!(op, DurableStoreOperation::SetEntries { .. }) && should_merge(&op.keys())
        });
        if !needs_merge {
            return self.inner.batch_operations(operations).await;
        }

        // Released on every exit path, including errors, so the next merge proceeds.
        let _turn = self.merge_queue.lock().await;
        trace!(operations = operations.len(), "merge turn acquired");
        let drafts = self.inner.all_draft_actions().await?;
        let mut rewritten = Vec::with_capacity(operations.len());
        for op in operations {
            match op {
                DurableStoreOperation::SetEntries { segment, entries } => {
                    let entries = self.merge_set(&segment, entries, &drafts).await?;
                    rewritten.push(DurableStoreOperation::SetEntries { segment, entries });
                }
                other => rewritten.push(other),
            }
        }
        self.inner.batch_operations(rewritten).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DurableStoreChange>> {
        self.inner.subscribe()
    }
}
