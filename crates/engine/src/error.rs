use draftq_core::{CoreError, DraftActionId, HandlerId};
use draftq_storage::StorageError;
use thiserror::Error;

use crate::network::NetworkError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("cannot create {tag}: it already has queued actions")]
    DuplicateCreate { tag: String },

    #[error("cannot enqueue against {tag}: it has a pending delete")]
    TargetAlreadyDeleted { tag: String },

    #[error("action to replace not found: {0}")]
    ReplaceMissingAction(DraftActionId),

    #[error("cannot replace an uploading action: {0}")]
    ReplaceUploading(DraftActionId),

    #[error("replacement targets {replacement_tag}, original targets {original_tag}")]
    ReplaceTargetMismatch {
        original_tag: String,
        replacement_tag: String,
    },

    #[error("replacement action is not pending: {0}")]
    ReplaceNotPending(DraftActionId),

    #[error("replacement handler {replacement} does not match {original}")]
    ReplaceHandlerMismatch {
        original: HandlerId,
        replacement: HandlerId,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no handler registered for {0}")]
    UnknownHandler(HandlerId),

    #[error("draft {action} follows a delete of {tag}")]
    DraftAfterDelete { tag: String, action: DraftActionId },

    #[error("{record} references missing entry {missing}")]
    DanglingReference { record: String, missing: String },

    #[error("draft action not found: {0}")]
    ActionNotFound(DraftActionId),

    #[error("draft action is uploading: {0}")]
    ActionUploading(DraftActionId),
}

impl From<EngineError> for StorageError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Storage(inner) => inner,
            other => StorageError::adapter(other),
        }
    }
}
