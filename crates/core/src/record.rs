use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::field_value::{FieldValue, StoreLink};
use crate::ids::{DraftActionId, field_key, record_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValueRepresentation {
    pub value: FieldValue,
    #[serde(default)]
    pub display_value: Option<String>,
}

impl FieldValueRepresentation {
    pub fn new(value: FieldValue, display_value: Option<String>) -> Self {
        Self {
            value,
            display_value,
        }
    }

    pub fn plain(value: impl Into<FieldValue>) -> Self {
        Self {
            value: value.into(),
            display_value: None,
        }
    }
}

/// Overlay metadata attached to a record copy that has pending drafts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRepresentation {
    pub created: bool,
    pub edited: bool,
    pub deleted: bool,
    /// Canonical value of every field a draft overrode, captured on first override.
    pub server_values: BTreeMap<String, FieldValueRepresentation>,
    /// Fields a draft introduced that the canonical record did not carry.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub added_fields: BTreeSet<String>,
    pub draft_action_ids: Vec<DraftActionId>,
    #[serde(default)]
    pub latest_draft_action_id: Option<DraftActionId>,
}

/// A record with its fields inline. This is both the canonical server shape and
/// the durable layout; `links` is only populated by the denormalizing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRepresentation {
    pub api_name: String,
    pub id: String,
    #[serde(default)]
    pub weak_etag: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type_id: Option<String>,
    pub fields: BTreeMap<String, FieldValueRepresentation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drafts: Option<DraftRepresentation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, StoreLink>,
}

impl RecordRepresentation {
    pub fn new(api_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            id: id.into(),
            weak_etag: 0,
            record_type_id: None,
            fields: BTreeMap::new(),
            drafts: None,
            links: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields
            .insert(name.to_string(), FieldValueRepresentation::plain(value));
        self
    }

    pub fn with_weak_etag(mut self, weak_etag: i64) -> Self {
        self.weak_etag = weak_etag;
        self
    }

    pub fn key(&self) -> String {
        record_key(&self.id)
    }

    pub fn field_value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|f| &f.value)
    }
}

/// Cache layout of a record: every field is a pointer to its own field entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub api_name: String,
    pub id: String,
    #[serde(default)]
    pub weak_etag: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type_id: Option<String>,
    pub fields: BTreeMap<String, StoreLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drafts: Option<DraftRepresentation>,
}

impl NormalizedRecord {
    pub fn key(&self) -> String {
        record_key(&self.id)
    }

    /// Split an inline record into its normalized form plus one entry per field.
    pub fn from_record(
        record: &RecordRepresentation,
    ) -> (Self, BTreeMap<String, FieldValueRepresentation>) {
        let key = record.key();
        let mut links = BTreeMap::new();
        let mut field_entries = BTreeMap::new();
        for (name, field) in &record.fields {
            let fkey = field_key(&key, name);
            links.insert(name.clone(), StoreLink::new(fkey.clone()));
            field_entries.insert(fkey, field.clone());
        }
        let normalized = Self {
            api_name: record.api_name.clone(),
            id: record.id.clone(),
            weak_etag: record.weak_etag,
            record_type_id: record.record_type_id.clone(),
            fields: links,
            drafts: record.drafts.clone(),
        };
        (normalized, field_entries)
    }
}

/// Maps a client-generated record key to the key the server assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftIdMapping {
    pub draft_key: String,
    pub canonical_key: String,
}

/// Cached failure for a key, e.g. a 404 on a record fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub status: u16,
    pub message: String,
}
