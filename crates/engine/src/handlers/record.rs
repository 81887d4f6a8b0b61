use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use draftq_core::{
    ActionData, CompletedDraftAction, DraftAction, DraftActionError, DraftActionId,
    DraftActionStatus, DraftErrorKind, DraftIdMapping, FieldValue, HandlerId, Hlc,
    METADATA_API_NAME, PendingDraftAction, QueueOperation, RecordMutation, RecordRepresentation,
    generate_draft_record_id, record_key,
};
use draftq_storage::{
    DEFAULT_SEGMENT, DRAFT_ID_MAPPINGS_SEGMENT, DurableStore, DurableStoreEntries,
    DurableStoreEntry, DurableStoreOperation, EntryData,
};

use crate::cache::RecordCache;
use crate::denormalize::normalize_record;
use crate::error::EngineError;
use crate::handler::{
    ActionCompletion, ActionHandler, ActionInput, ProcessActionResult, check_admission,
};
use crate::metadata::ObjectInfoSource;
use crate::network::NetworkAdapter;

/// Handles ordinary record create/update/delete calls.
pub struct UiApiRecordHandler {
    network: Arc<dyn NetworkAdapter>,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn RecordCache>,
    object_infos: Arc<dyn ObjectInfoSource>,
}

impl UiApiRecordHandler {
    pub fn new(
        network: Arc<dyn NetworkAdapter>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn RecordCache>,
        object_infos: Arc<dyn ObjectInfoSource>,
    ) -> Self {
        Self {
            network,
            store,
            cache,
            object_infos,
        }
    }

    async fn stored_api_name(&self, record_id: &str) -> Result<Option<String>, EngineError> {
        let key = record_key(record_id);
        let entries = self
            .store
            .get_entries(std::slice::from_ref(&key), DEFAULT_SEGMENT)
            .await?;
        Ok(entries
            .get(&key)
            .and_then(|e| e.as_record())
            .map(|r| r.api_name.clone()))
    }

    /// Write the server's copy of the record, and for a create, the mapping
    /// from the draft id plus eviction of the synthetic record.
    async fn ingest(
        &self,
        action: &DraftAction,
        record: RecordRepresentation,
    ) -> Result<(), EngineError> {
        let canonical_key = record.key();
        let entries = normalize_record(&record);
        for (key, entry) in &entries {
            self.cache.put(key, entry.data.clone());
        }
        let mut operations = vec![DurableStoreOperation::SetEntries {
            segment: DEFAULT_SEGMENT.to_string(),
            entries,
        }];
        if action.is_create() && canonical_key != action.tag {
            let mapping = DraftIdMapping {
                draft_key: action.tag.clone(),
                canonical_key: canonical_key.clone(),
            };
            operations.push(DurableStoreOperation::SetEntries {
                segment: DRAFT_ID_MAPPINGS_SEGMENT.to_string(),
                entries: DurableStoreEntries::from([(
                    action.tag.clone(),
                    DurableStoreEntry::new(EntryData::IdMapping(mapping)),
                )]),
            });
            operations.push(DurableStoreOperation::EvictEntries {
                segment: DEFAULT_SEGMENT.to_string(),
                ids: vec![action.tag.clone()],
            });
            self.cache.evict(&action.tag);
            debug!(draft = %action.tag, canonical = %canonical_key, "mapped draft record to server id");
        }
        self.store.batch_operations(operations).await?;
        Ok(())
    }
}

/// Copy of `action` with every reference to `draft_id` pointing at `server_id`,
/// or `None` when the action never mentions the draft id.
pub fn swap_draft_id(action: &DraftAction, draft_id: &str, server_id: &str) -> Option<DraftAction> {
    let mut out = action.clone();
    let mut changed = false;
    if out.tag == record_key(draft_id) {
        out.tag = record_key(server_id);
        changed = true;
    }
    if out.target_id == draft_id {
        out.target_id = server_id.to_string();
        changed = true;
    }
    if let ActionData::Resource(request) = &mut out.data {
        if request.path.contains(draft_id) {
            request.path = request.path.replace(draft_id, server_id);
            changed = true;
        }
        if let Some(body) = &mut request.body {
            for value in body.fields.values_mut() {
                if value.as_text() == Some(draft_id) {
                    *value = FieldValue::text(server_id);
                    changed = true;
                }
            }
        }
    }
    changed.then_some(out)
}

#[async_trait]
impl ActionHandler for UiApiRecordHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::UiApiRecord
    }

    async fn build_pending_action(
        &self,
        input: ActionInput,
        timestamp: Hlc,
        queue: &[DraftAction],
    ) -> Result<PendingDraftAction, EngineError> {
        let ActionInput::Resource(request) = input else {
            return Err(EngineError::InvalidInput(
                "record handler only accepts resource requests".into(),
            ));
        };
        let body_api_name = request.body.as_ref().and_then(|b| b.api_name.clone());
        let mutation = request.method.mutation();
        let (target_id, api_name) = match mutation {
            RecordMutation::Create => {
                let api_name = body_api_name.ok_or_else(|| {
                    EngineError::InvalidInput("create requires a body with an apiName".into())
                })?;
                let info = self.object_infos.object_info(&api_name).await.ok_or_else(|| {
                    EngineError::InvalidInput(format!("no object info for {api_name}"))
                })?;
                (generate_draft_record_id(&info.key_prefix), Some(api_name))
            }
            RecordMutation::Update | RecordMutation::Delete => {
                let id = request
                    .path_record_id()
                    .ok_or_else(|| {
                        EngineError::InvalidInput(format!("no record id in path {}", request.path))
                    })?
                    .to_string();
                let api_name = match body_api_name {
                    Some(name) => Some(name),
                    None => self.stored_api_name(&id).await?,
                };
                (id, api_name)
            }
        };
        if mutation == RecordMutation::Update && request.body.is_none() {
            return Err(EngineError::InvalidInput("update requires a body".into()));
        }

        let tag = record_key(&target_id);
        check_admission(&tag, mutation == RecordMutation::Create, queue)?;

        let mut metadata = BTreeMap::new();
        if let Some(api_name) = api_name {
            metadata.insert(METADATA_API_NAME.to_string(), api_name);
        }
        Ok(DraftAction {
            id: DraftActionId::new(),
            tag,
            target_id,
            handler: HandlerId::UiApiRecord,
            data: ActionData::Resource(request),
            status: DraftActionStatus::Pending,
            metadata,
            timestamp,
            error: None,
        })
    }

    async fn handle(
        &self,
        action: DraftAction,
        completion: ActionCompletion,
    ) -> Result<ProcessActionResult, EngineError> {
        let request = action.resource().cloned().ok_or_else(|| {
            EngineError::InvalidInput(format!("{} carries no resource request", action.id))
        })?;
        match self.network.dispatch(&request).await {
            Ok(response) if response.is_success() => {
                completion.completed(response.body).await?;
                Ok(ProcessActionResult::ActionSucceeded)
            }
            Ok(response) => {
                let error = DraftActionError {
                    kind: DraftErrorKind::Client,
                    message: format!("server responded {}", response.status),
                    status: Some(response.status),
                    body: response.body,
                };
                completion.failed(error, false).await?;
                Ok(ProcessActionResult::ActionErrored)
            }
            Err(e) => {
                let error = DraftActionError {
                    kind: DraftErrorKind::Network,
                    message: e.to_string(),
                    status: None,
                    body: None,
                };
                completion.failed(error, true).await?;
                Ok(ProcessActionResult::NetworkError)
            }
        }
    }

    async fn on_completed(&self, completed: &CompletedDraftAction) -> Result<(), EngineError> {
        let action = &completed.action;
        match action.mutation() {
            None => return Ok(()),
            Some(RecordMutation::Delete) => {
                self.cache.evict(&action.tag);
                self.store
                    .evict_entries(std::slice::from_ref(&action.tag), DEFAULT_SEGMENT)
                    .await?;
                return Ok(());
            }
            Some(_) => {}
        }
        let Some(body) = &completed.response else {
            debug!(id = %action.id, "completed without a response body");
            return Ok(());
        };
        match serde_json::from_value::<RecordRepresentation>(body.clone()) {
            Ok(record) => self.ingest(action, record).await,
            Err(e) => {
                warn!(id = %action.id, error = %e, "response is not a record; nothing ingested");
                Ok(())
            }
        }
    }

    fn queue_operations_for_completed_draft(
        &self,
        queue: &[DraftAction],
        completed: &CompletedDraftAction,
    ) -> Vec<QueueOperation> {
        let mut operations = vec![QueueOperation::Delete(completed.action.id)];
        if !completed.action.is_create() {
            return operations;
        }
        let server_id = completed
            .response
            .as_ref()
            .and_then(|body| body.get("id"))
            .and_then(|id| id.as_str());
        let Some(server_id) = server_id else {
            return operations;
        };
        let draft_id = completed.action.target_id.as_str();
        if server_id == draft_id {
            return operations;
        }
        for action in queue.iter().filter(|a| a.id != completed.action.id) {
            if let Some(swapped) = swap_draft_id(action, draft_id, server_id) {
                operations.push(QueueOperation::Update {
                    action: swapped,
                    id: action.id,
                });
            }
        }
        operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftq_core::{HttpMethod, RecordInput, ResourceRequest};

    fn edit(target: &str, fields: RecordInput) -> DraftAction {
        DraftAction {
            id: DraftActionId::new(),
            tag: record_key(target),
            target_id: target.to_string(),
            handler: HandlerId::UiApiRecord,
            data: ActionData::Resource(
                ResourceRequest::new(HttpMethod::Patch, "/ui-api", format!("/records/{target}"))
                    .with_body(fields),
            ),
            status: DraftActionStatus::Pending,
            metadata: BTreeMap::new(),
            timestamp: Hlc::new(1, 0),
            error: None,
        }
    }

    #[test]
    fn swap_rewrites_every_reference() {
        let action = edit("DRAFT-001-x", RecordInput::new(None).with_field("Name", "Acme"));
        let swapped = swap_draft_id(&action, "DRAFT-001-x", "001xyz").unwrap();
        assert_eq!(swapped.tag, record_key("001xyz"));
        assert_eq!(swapped.target_id, "001xyz");
        assert_eq!(swapped.resource().unwrap().path, "/records/001xyz");
        assert_eq!(swapped.id, action.id);
    }

    #[test]
    fn swap_rewrites_body_references_only() {
        let action = edit(
            "003B",
            RecordInput::new(None).with_field("AccountId", "DRAFT-001-x"),
        );
        let swapped = swap_draft_id(&action, "DRAFT-001-x", "001xyz").unwrap();
        assert_eq!(swapped.tag, record_key("003B"));
        let body = swapped.resource().unwrap().body.as_ref().unwrap();
        assert_eq!(body.fields["AccountId"], FieldValue::text("001xyz"));
    }

    #[test]
    fn unrelated_action_is_untouched() {
        let action = edit("003B", RecordInput::new(None).with_field("Name", "x"));
        assert!(swap_draft_id(&action, "DRAFT-001-x", "001xyz").is_none());
    }
}
