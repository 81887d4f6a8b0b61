use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use draftq_core::{
    DraftAction, DraftIdMapping, ErrorMarker, FieldValueRepresentation, NormalizedRecord,
    RecordRepresentation,
};

use crate::error::StorageError;

pub const DEFAULT_SEGMENT: &str = "DEFAULT";
pub const DRAFT_SEGMENT: &str = "DRAFT";
pub const DRAFT_ID_MAPPINGS_SEGMENT: &str = "DRAFT_ID_MAPPINGS";

/// Millisecond timestamps after which an entry is stale, then evictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryExpiration {
    pub fresh: i64,
    pub stale: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryData {
    Record(RecordRepresentation),
    NormalizedRecord(NormalizedRecord),
    Field(FieldValueRepresentation),
    DraftAction(DraftAction),
    IdMapping(DraftIdMapping),
    Error(ErrorMarker),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableStoreEntry {
    pub data: EntryData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<EntryExpiration>,
}

impl DurableStoreEntry {
    pub fn new(data: EntryData) -> Self {
        Self {
            data,
            expiration: None,
        }
    }

    pub fn record(record: RecordRepresentation) -> Self {
        Self::new(EntryData::Record(record))
    }

    pub fn draft_action(action: DraftAction) -> Self {
        Self::new(EntryData::DraftAction(action))
    }

    pub fn with_expiration(mut self, expiration: EntryExpiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn as_record(&self) -> Option<&RecordRepresentation> {
        match &self.data {
            EntryData::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<RecordRepresentation> {
        match self.data {
            EntryData::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_draft_action(&self) -> Option<&DraftAction> {
        match &self.data {
            EntryData::DraftAction(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_id_mapping(&self) -> Option<&DraftIdMapping> {
        match &self.data {
            EntryData::IdMapping(mapping) => Some(mapping),
            _ => None,
        }
    }
}

pub type DurableStoreEntries = BTreeMap<String, DurableStoreEntry>;

#[derive(Debug, Clone, PartialEq)]
pub enum DurableStoreOperation {
    SetEntries {
        segment: String,
        entries: DurableStoreEntries,
    },
    EvictEntries {
        segment: String,
        ids: Vec<String>,
    },
}

impl DurableStoreOperation {
    pub fn segment(&self) -> &str {
        match self {
            Self::SetEntries { segment, .. } | Self::EvictEntries { segment, .. } => segment,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::SetEntries { entries, .. } => entries.keys().cloned().collect(),
            Self::EvictEntries { ids, .. } => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Evict,
}

/// Notification broadcast after a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableStoreChange {
    pub segment: String,
    pub ids: Vec<String>,
    pub kind: ChangeKind,
}

impl DurableStoreChange {
    pub fn from_operation(op: &DurableStoreOperation) -> Self {
        let kind = match op {
            DurableStoreOperation::SetEntries { .. } => ChangeKind::Set,
            DurableStoreOperation::EvictEntries { .. } => ChangeKind::Evict,
        };
        Self {
            segment: op.segment().to_string(),
            ids: op.keys(),
            kind,
        }
    }
}

/// Persistent key/value store partitioned into named segments.
///
/// Decorators only need to override `batch_operations`; the single-operation
/// writes route through it.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_entries(
        &self,
        ids: &[String],
        segment: &str,
    ) -> Result<DurableStoreEntries, StorageError>;

    async fn get_all_entries(&self, segment: &str) -> Result<DurableStoreEntries, StorageError>;

    async fn set_entries(
        &self,
        entries: DurableStoreEntries,
        segment: &str,
    ) -> Result<(), StorageError> {
        self.batch_operations(vec![DurableStoreOperation::SetEntries {
            segment: segment.to_string(),
            entries,
        }])
        .await
    }

    async fn evict_entries(&self, ids: &[String], segment: &str) -> Result<(), StorageError> {
        self.batch_operations(vec![DurableStoreOperation::EvictEntries {
            segment: segment.to_string(),
            ids: ids.to_vec(),
        }])
        .await
    }

    /// Apply every operation atomically, in order.
    async fn batch_operations(
        &self,
        operations: Vec<DurableStoreOperation>,
    ) -> Result<(), StorageError>;

    fn subscribe(&self) -> broadcast::Receiver<Vec<DurableStoreChange>>;
}
