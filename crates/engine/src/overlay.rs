//! Optimistic draft overlays on top of canonical records.
//!
//! Every function here is pure: the same record, drafts and metadata always
//! produce the same output, and replaying onto an overlay first restores the
//! canonical record so recomputation never stacks edits twice.

use draftq_core::{
    DraftAction, DraftRepresentation, FieldValue, FieldValueRepresentation, ObjectInfo,
    RecordMutation, RecordRepresentation, StoreLink, record_key,
};

use crate::error::EngineError;

pub const FIELD_ID: &str = "Id";
pub const FIELD_CREATED_BY_ID: &str = "CreatedById";
pub const FIELD_CREATED_DATE: &str = "CreatedDate";
pub const FIELD_LAST_MODIFIED_BY_ID: &str = "LastModifiedById";
pub const FIELD_LAST_MODIFIED_DATE: &str = "LastModifiedDate";

/// Weak etag of a record that exists only as a draft.
pub const SYNTHETIC_WEAK_ETAG: i64 = -1;

/// An overlaid record plus stubs for records its draft references point at.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftOverlay {
    pub record: RecordRepresentation,
    pub linked_records: Vec<RecordRepresentation>,
}

/// Canonical record with every draft change undone.
pub fn remove_drafts(record: &RecordRepresentation) -> RecordRepresentation {
    let mut restored = record.clone();
    if let Some(drafts) = restored.drafts.take() {
        for field in &drafts.added_fields {
            restored.fields.remove(field);
            restored.links.remove(field);
        }
        for (field, value) in drafts.server_values {
            restored.fields.insert(field, value);
        }
    }
    restored
}

/// Restore `record`, then apply `drafts` in order.
pub fn replay_drafts(
    record: &RecordRepresentation,
    drafts: &[DraftAction],
    object_info: &ObjectInfo,
    user_id: &str,
) -> Result<RecordRepresentation, EngineError> {
    Ok(build_overlay(record, drafts, object_info, user_id)?.record)
}

pub fn build_overlay(
    record: &RecordRepresentation,
    drafts: &[DraftAction],
    object_info: &ObjectInfo,
    user_id: &str,
) -> Result<DraftOverlay, EngineError> {
    let mut target = remove_drafts(record);
    let mut meta = DraftRepresentation::default();
    let mut linked_records = Vec::new();

    for draft in drafts {
        let Some(request) = draft.resource() else {
            continue;
        };
        if meta.deleted {
            return Err(EngineError::DraftAfterDelete {
                tag: draft.tag.clone(),
                action: draft.id,
            });
        }
        match request.method.mutation() {
            RecordMutation::Create => meta.created = true,
            RecordMutation::Delete => meta.deleted = true,
            RecordMutation::Update => {
                meta.edited = true;
                if let Some(body) = &request.body {
                    for (name, value) in &body.fields {
                        let display = object_info
                            .field(name)
                            .and_then(|f| f.display_value(value));
                        set_field(
                            &mut target,
                            &mut meta,
                            name,
                            FieldValueRepresentation::new(value.clone(), display),
                        );
                        if let Some(reference) = object_info.reference_info(name) {
                            let link = match (value, reference.reference_to.first()) {
                                (FieldValue::Text(id), Some(api_name)) => {
                                    let mut stub = RecordRepresentation::new(api_name, id);
                                    stub.fields.insert(
                                        FIELD_ID.to_string(),
                                        FieldValueRepresentation::plain(id.as_str()),
                                    );
                                    linked_records.push(stub);
                                    FieldValue::Link(StoreLink::new(record_key(id)))
                                }
                                _ => FieldValue::Null,
                            };
                            set_field(
                                &mut target,
                                &mut meta,
                                &reference.relationship_name,
                                FieldValueRepresentation::new(link, None),
                            );
                        }
                    }
                }
                set_field(
                    &mut target,
                    &mut meta,
                    FIELD_LAST_MODIFIED_BY_ID,
                    FieldValueRepresentation::plain(user_id),
                );
                set_field(
                    &mut target,
                    &mut meta,
                    FIELD_LAST_MODIFIED_DATE,
                    FieldValueRepresentation::new(
                        FieldValue::text(draft.timestamp.to_rfc3339()),
                        None,
                    ),
                );
            }
        }
        meta.draft_action_ids.push(draft.id);
        meta.latest_draft_action_id = Some(draft.id);
    }

    if !meta.draft_action_ids.is_empty() {
        target.drafts = Some(meta);
    }
    Ok(DraftOverlay {
        record: target,
        linked_records,
    })
}

/// Overwrite a field, snapshotting its canonical value the first time a draft touches it.
fn set_field(
    record: &mut RecordRepresentation,
    meta: &mut DraftRepresentation,
    name: &str,
    value: FieldValueRepresentation,
) {
    if !meta.server_values.contains_key(name) && !meta.added_fields.contains(name) {
        match record.fields.get(name) {
            Some(existing) => {
                meta.server_values.insert(name.to_string(), existing.clone());
            }
            None => {
                meta.added_fields.insert(name.to_string());
            }
        }
    }
    record.fields.insert(name.to_string(), value);
}

/// Canonical-looking record for a create draft that has not reached the server.
pub fn build_synthetic_record(
    action: &DraftAction,
    object_info: &ObjectInfo,
    user_id: &str,
) -> Result<RecordRepresentation, EngineError> {
    let request = action
        .resource()
        .filter(|r| r.method.mutation() == RecordMutation::Create)
        .ok_or_else(|| EngineError::InvalidInput(format!("{} is not a create", action.id)))?;
    let body = request
        .body
        .as_ref()
        .ok_or_else(|| EngineError::InvalidInput(format!("create {} has no body", action.id)))?;
    let api_name = body
        .api_name
        .clone()
        .unwrap_or_else(|| object_info.api_name.clone());

    let mut record = RecordRepresentation::new(api_name, action.target_id.clone())
        .with_weak_etag(SYNTHETIC_WEAK_ETAG);
    for (name, value) in &body.fields {
        let display = object_info.field(name).and_then(|f| f.display_value(value));
        record.fields.insert(
            name.clone(),
            FieldValueRepresentation::new(value.clone(), display),
        );
    }
    let timestamp = action.timestamp.to_rfc3339();
    for (name, value) in [
        (FIELD_ID, action.target_id.as_str()),
        (FIELD_CREATED_BY_ID, user_id),
        (FIELD_CREATED_DATE, timestamp.as_str()),
        (FIELD_LAST_MODIFIED_BY_ID, user_id),
        (FIELD_LAST_MODIFIED_DATE, timestamp.as_str()),
    ] {
        record
            .fields
            .insert(name.to_string(), FieldValueRepresentation::plain(value));
    }
    Ok(record)
}
