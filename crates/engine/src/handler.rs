//! The protocol every draft-action handler implements.

use std::sync::Arc;

use async_trait::async_trait;

use draftq_core::{
    CompletedDraftAction, DraftAction, DraftActionError, DraftActionId, DraftActionStatus,
    HandlerId, Hlc, PendingDraftAction, QueueOperation, ResourceRequest,
};

use crate::error::EngineError;

/// What a caller asks the queue to record.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionInput {
    Resource(ResourceRequest),
    Custom {
        tag: String,
        target_id: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessActionResult {
    ActionSucceeded,
    /// Terminal failure; the action stays in the queue in `Error` until retried or removed.
    ActionErrored,
    /// Retryable failure; the action went back to `Pending`.
    NetworkError,
    /// Handed to an external executor that will report back later.
    CustomActionWaiting,
    NoActionToProcess,
    BlockedOnError,
}

/// Receives the outcome of a dispatched action. The queue implements this.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn action_completed(&self, completed: CompletedDraftAction) -> Result<(), EngineError>;

    async fn action_failed(
        &self,
        action: DraftAction,
        error: DraftActionError,
        retryable: bool,
    ) -> Result<(), EngineError>;
}

/// Continuation handed to `ActionHandler::handle`. Consumed by whichever outcome is reported.
pub struct ActionCompletion {
    action: DraftAction,
    listener: Arc<dyn CompletionListener>,
}

impl ActionCompletion {
    pub fn new(action: DraftAction, listener: Arc<dyn CompletionListener>) -> Self {
        Self { action, listener }
    }

    pub fn action(&self) -> &DraftAction {
        &self.action
    }

    pub async fn completed(self, response: Option<serde_json::Value>) -> Result<(), EngineError> {
        self.listener
            .action_completed(CompletedDraftAction {
                action: self.action,
                response,
            })
            .await
    }

    pub async fn failed(self, error: DraftActionError, retryable: bool) -> Result<(), EngineError> {
        self.listener
            .action_failed(self.action, error, retryable)
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplacedAction {
    pub original: DraftAction,
    /// `original` carrying the replacement's payload, persisted in its queue slot.
    pub action_to_replace: DraftAction,
    pub replacing_action: DraftAction,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn handler_id(&self) -> HandlerId;

    async fn build_pending_action(
        &self,
        input: ActionInput,
        timestamp: Hlc,
        queue: &[DraftAction],
    ) -> Result<PendingDraftAction, EngineError>;

    async fn handle(
        &self,
        action: DraftAction,
        completion: ActionCompletion,
    ) -> Result<ProcessActionResult, EngineError>;

    async fn on_completed(&self, _completed: &CompletedDraftAction) -> Result<(), EngineError> {
        Ok(())
    }

    fn queue_operations_for_completed_draft(
        &self,
        _queue: &[DraftAction],
        completed: &CompletedDraftAction,
    ) -> Vec<QueueOperation> {
        vec![QueueOperation::Delete(completed.action.id)]
    }

    fn replace_action(
        &self,
        id_to_replace: DraftActionId,
        id_of_replacement: DraftActionId,
        new_id: Option<DraftActionId>,
        actions: &[DraftAction],
    ) -> Result<ReplacedAction, EngineError> {
        replace_action(id_to_replace, id_of_replacement, new_id, actions)
    }
}

/// Reject inputs that would violate the per-tag lifecycle.
pub fn check_admission(tag: &str, is_create: bool, queue: &[DraftAction]) -> Result<(), EngineError> {
    let mut for_tag = queue.iter().filter(|a| a.tag == tag);
    if is_create {
        if for_tag.next().is_some() {
            return Err(EngineError::DuplicateCreate {
                tag: tag.to_string(),
            });
        }
        return Ok(());
    }
    if for_tag.max_by_key(|a| a.queue_order()).is_some_and(|a| a.is_delete()) {
        return Err(EngineError::TargetAlreadyDeleted {
            tag: tag.to_string(),
        });
    }
    Ok(())
}

pub fn replace_action(
    id_to_replace: DraftActionId,
    id_of_replacement: DraftActionId,
    new_id: Option<DraftActionId>,
    actions: &[DraftAction],
) -> Result<ReplacedAction, EngineError> {
    let find = |id: DraftActionId| {
        actions
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(EngineError::ReplaceMissingAction(id))
    };
    let original = find(id_to_replace)?;
    let replacing_action = find(id_of_replacement)?;

    if let Some(busy) = [&original, &replacing_action].into_iter().find(|a| a.is_uploading()) {
        return Err(EngineError::ReplaceUploading(busy.id));
    }
    if original.tag != replacing_action.tag {
        return Err(EngineError::ReplaceTargetMismatch {
            original_tag: original.tag,
            replacement_tag: replacing_action.tag,
        });
    }
    if !replacing_action.is_pending() {
        return Err(EngineError::ReplaceNotPending(replacing_action.id));
    }
    if original.handler != replacing_action.handler {
        return Err(EngineError::ReplaceHandlerMismatch {
            original: original.handler,
            replacement: replacing_action.handler,
        });
    }

    let mut action_to_replace = original.clone();
    action_to_replace.id = new_id.unwrap_or(original.id);
    action_to_replace.data = replacing_action.data.clone();
    action_to_replace.metadata = replacing_action.metadata.clone();
    action_to_replace.status = DraftActionStatus::Pending;
    action_to_replace.error = None;

    Ok(ReplacedAction {
        original,
        action_to_replace,
        replacing_action,
    })
}
