use thiserror::Error;

use crate::action::DraftActionStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DraftActionStatus,
        to: DraftActionStatus,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
