use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use draftq_core::{
    FieldValueRepresentation, NormalizedRecord, RecordRepresentation, StoreLink, field_key,
    is_field_key, split_field_key,
};
use draftq_storage::{
    DEFAULT_SEGMENT, DurableStore, DurableStoreChange, DurableStoreEntries, DurableStoreEntry,
    DurableStoreOperation, EntryData, StorageError,
};

use crate::cache::RecordCache;
use crate::error::EngineError;

/// Normalized cache entries (record plus one entry per field) for an inline record.
pub fn normalize_record(record: &RecordRepresentation) -> DurableStoreEntries {
    let (normalized, fields) = NormalizedRecord::from_record(record);
    let mut entries = DurableStoreEntries::new();
    for (key, field) in fields {
        entries.insert(key, DurableStoreEntry::new(EntryData::Field(field)));
    }
    entries.insert(
        normalized.key(),
        DurableStoreEntry::new(EntryData::NormalizedRecord(normalized)),
    );
    entries
}

/// Stores records with their fields inline while callers keep speaking the
/// normalized cache layout.
pub struct RecordDenormalizingDurableStore {
    inner: Arc<dyn DurableStore>,
    cache: Arc<dyn RecordCache>,
}

impl RecordDenormalizingDurableStore {
    pub fn new(inner: Arc<dyn DurableStore>, cache: Arc<dyn RecordCache>) -> Self {
        Self { inner, cache }
    }

    fn resolve_field(
        &self,
        key: &str,
        batch: &DurableStoreEntries,
    ) -> Option<FieldValueRepresentation> {
        if let Some(EntryData::Field(field)) = batch.get(key).map(|e| &e.data) {
            return Some(field.clone());
        }
        match self.cache.get(key) {
            Some(EntryData::Field(field)) => Some(field),
            _ => None,
        }
    }

    fn inline_record(
        &self,
        normalized: &NormalizedRecord,
        batch: &DurableStoreEntries,
    ) -> Result<(RecordRepresentation, Vec<String>), EngineError> {
        let mut record = RecordRepresentation::new(normalized.api_name.clone(), normalized.id.clone())
            .with_weak_etag(normalized.weak_etag);
        record.record_type_id = normalized.record_type_id.clone();
        record.drafts = normalized.drafts.clone();
        let mut consumed = Vec::new();
        for (name, link) in &normalized.fields {
            let field = self.resolve_field(&link.key, batch).ok_or_else(|| {
                EngineError::DanglingReference {
                    record: normalized.key(),
                    missing: link.key.clone(),
                }
            })?;
            record.fields.insert(name.clone(), field);
            record.links.insert(name.clone(), link.clone());
            consumed.push(link.key.clone());
        }
        Ok((record, consumed))
    }

    /// Rewrite one DEFAULT-segment write into inline records.
    async fn denormalize_entries(
        &self,
        entries: DurableStoreEntries,
    ) -> Result<DurableStoreEntries, StorageError> {
        let mut out = DurableStoreEntries::new();
        let mut consumed = BTreeSet::new();
        let mut skipped = BTreeSet::new();

        for (key, entry) in &entries {
            match &entry.data {
                EntryData::NormalizedRecord(normalized) => {
                    match self.inline_record(normalized, &entries) {
                        Ok((record, fields)) => {
                            consumed.extend(fields);
                            out.insert(
                                key.clone(),
                                DurableStoreEntry {
                                    data: EntryData::Record(record),
                                    expiration: entry.expiration,
                                },
                            );
                        }
                        Err(e) => {
                            error!(key = %key, error = %e, "skipping record with dangling field reference");
                            skipped.insert(key.clone());
                        }
                    }
                }
                EntryData::Field(_) => {}
                _ => {
                    out.insert(key.clone(), entry.clone());
                }
            }
        }

        // Field entries whose parent was not part of this batch travel as a partial
        // record holding just those fields. The merging store below folds them into
        // the stored canonical record and replays its drafts, so a drafted field
        // updates its server value rather than the overlay.
        let mut orphans: BTreeMap<String, Vec<(String, FieldValueRepresentation)>> = BTreeMap::new();
        for (key, entry) in &entries {
            let EntryData::Field(field) = &entry.data else {
                continue;
            };
            if consumed.contains(key) {
                continue;
            }
            match split_field_key(key) {
                Some((parent, _)) if skipped.contains(parent) || out.contains_key(parent) => {}
                Some((parent, name)) => orphans
                    .entry(parent.to_string())
                    .or_default()
                    .push((name.to_string(), field.clone())),
                None => warn!(key = %key, "dropping field entry with malformed key"),
            }
        }
        if !orphans.is_empty() {
            let parents: Vec<String> = orphans.keys().cloned().collect();
            let stored = self.inner.get_entries(&parents, DEFAULT_SEGMENT).await?;
            for (parent, fields) in orphans {
                let Some(mut entry) = stored.get(&parent).cloned() else {
                    warn!(key = %parent, "dropping field entries for unknown record");
                    continue;
                };
                if let EntryData::Record(stored_record) = &entry.data {
                    let mut partial = RecordRepresentation::new(
                        stored_record.api_name.clone(),
                        stored_record.id.clone(),
                    )
                    .with_weak_etag(stored_record.weak_etag);
                    partial.record_type_id = stored_record.record_type_id.clone();
                    for (name, field) in fields {
                        partial
                            .links
                            .insert(name.clone(), StoreLink::new(field_key(&parent, &name)));
                        partial.fields.insert(name, field);
                    }
                    entry.data = EntryData::Record(partial);
                    out.insert(parent, entry);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DurableStore for RecordDenormalizingDurableStore {
    async fn get_entries(
        &self,
        ids: &[String],
        segment: &str,
    ) -> Result<DurableStoreEntries, StorageError> {
        if segment != DEFAULT_SEGMENT || !ids.iter().any(|id| is_field_key(id)) {
            return self.inner.get_entries(ids, segment).await;
        }
        let mut lookup: BTreeSet<String> = BTreeSet::new();
        for id in ids {
            match split_field_key(id) {
                Some((parent, _)) => lookup.insert(parent.to_string()),
                None => lookup.insert(id.clone()),
            };
        }
        let lookup: Vec<String> = lookup.into_iter().collect();
        let stored = self.inner.get_entries(&lookup, segment).await?;

        let mut out = DurableStoreEntries::new();
        for id in ids {
            match split_field_key(id) {
                Some((parent, name)) => {
                    let Some(entry) = stored.get(parent) else {
                        continue;
                    };
                    if let Some(field) = entry.as_record().and_then(|r| r.fields.get(name)) {
                        out.insert(
                            id.clone(),
                            DurableStoreEntry {
                                data: EntryData::Field(field.clone()),
                                expiration: entry.expiration,
                            },
                        );
                    }
                }
                None => {
                    if let Some(entry) = stored.get(id) {
                        out.insert(id.clone(), entry.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_all_entries(&self, segment: &str) -> Result<DurableStoreEntries, StorageError> {
        self.inner.get_all_entries(segment).await
    }

    async fn batch_operations(
        &self,
        operations: Vec<DurableStoreOperation>,
    ) -> Result<(), StorageError> {
        let mut rewritten = Vec::with_capacity(operations.len());
        for op in operations {
            match op {
                DurableStoreOperation::SetEntries { segment, entries }
                    if segment == DEFAULT_SEGMENT =>
                {
                    let entries = self.denormalize_entries(entries).await?;
                    if !entries.is_empty() {
                        rewritten.push(DurableStoreOperation::SetEntries { segment, entries });
                    }
                }
                DurableStoreOperation::EvictEntries { segment, ids }
                    if segment == DEFAULT_SEGMENT =>
                {
                    let (fields, ids): (Vec<String>, Vec<String>) =
                        ids.into_iter().partition(|id| is_field_key(id));
                    if !fields.is_empty() {
                        debug!(count = fields.len(), "ignoring eviction of inline field keys");
                    }
                    if !ids.is_empty() {
                        rewritten.push(DurableStoreOperation::EvictEntries { segment, ids });
                    }
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
