use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{error, warn};

use draftq_core::{
    ActionData, DraftAction, DraftActionError, DraftActionId, DraftActionStatus, DraftErrorKind,
    HandlerId, Hlc, PendingDraftAction,
};

use crate::error::EngineError;
use crate::handler::{
    ActionCompletion, ActionHandler, ActionInput, ProcessActionResult, check_admission,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomActionErrorType {
    ClientError,
    NetworkError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomActionResult {
    Success {
        id: DraftActionId,
    },
    Failure {
        error_type: CustomActionErrorType,
        message: String,
    },
}

/// One-shot callback an executor uses to report the outcome. Dropping it
/// without reporting counts as a retryable failure.
pub struct CustomActionCompleter {
    tx: oneshot::Sender<CustomActionResult>,
}

impl CustomActionCompleter {
    pub fn complete(self, result: CustomActionResult) {
        let _ = self.tx.send(result);
    }

    pub fn succeed(self, id: DraftActionId) {
        self.complete(CustomActionResult::Success { id });
    }

    pub fn fail(self, error_type: CustomActionErrorType, message: impl Into<String>) {
        self.complete(CustomActionResult::Failure {
            error_type,
            message: message.into(),
        });
    }
}

pub type CustomActionExecutor = Arc<dyn Fn(DraftAction, CustomActionCompleter) + Send + Sync>;

/// Hands opaque actions to application code registered under `name`.
pub struct CustomActionHandler {
    name: String,
    executor: CustomActionExecutor,
}

impl CustomActionHandler {
    pub fn new(name: impl Into<String>, executor: CustomActionExecutor) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }
}

async fn report(id: DraftActionId, outcome: Option<CustomActionResult>, completion: ActionCompletion) {
    let result = match outcome {
        Some(CustomActionResult::Success { id: reported }) => {
            if reported != id {
                warn!(%id, %reported, "custom executor reported success for a different id");
            }
            completion.completed(None).await
        }
        Some(CustomActionResult::Failure {
            error_type,
            message,
        }) => {
            let (kind, retryable) = match error_type {
                CustomActionErrorType::ClientError => (DraftErrorKind::Client, false),
                CustomActionErrorType::NetworkError => (DraftErrorKind::Network, true),
            };
            let error = DraftActionError {
                kind,
                message,
                status: None,
                body: None,
            };
            completion.failed(error, retryable).await
        }
        None => {
            let error = DraftActionError {
                kind: DraftErrorKind::Network,
                message: "executor dropped the completer without reporting".into(),
                status: None,
                body: None,
            };
            completion.failed(error, true).await
        }
    };
    if let Err(e) = result {
        error!(%id, error = %e, "failed to record custom action outcome");
    }
}

#[async_trait]
impl ActionHandler for CustomActionHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Custom(self.name.clone())
    }

    async fn build_pending_action(
        &self,
        input: ActionInput,
        timestamp: Hlc,
        queue: &[DraftAction],
    ) -> Result<PendingDraftAction, EngineError> {
        let ActionInput::Custom {
            tag,
            target_id,
            data,
        } = input
        else {
            return Err(EngineError::InvalidInput(format!(
                "custom handler {} only accepts custom payloads",
                self.name
            )));
        };
        check_admission(&tag, false, queue)?;
        Ok(DraftAction {
            id: DraftActionId::new(),
            tag,
            target_id,
            handler: self.handler_id(),
            data: ActionData::Custom(data),
            status: DraftActionStatus::Pending,
            metadata: BTreeMap::new(),
            timestamp,
            error: None,
        })
    }

    async fn handle(
        &self,
        action: DraftAction,
        completion: ActionCompletion,
    ) -> Result<ProcessActionResult, EngineError> {
        let (tx, rx) = oneshot::channel();
        let id = action.id;
        (self.executor)(action, CustomActionCompleter { tx });
        tokio::spawn(async move {
            report(id, rx.await.ok(), completion).await;
        });
        Ok(ProcessActionResult::CustomActionWaiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completer_delivers_once() {
        let (tx, mut rx) = oneshot::channel();
        let completer = CustomActionCompleter { tx };
        let id = DraftActionId::new();
        completer.succeed(id);
        assert_eq!(rx.try_recv().unwrap(), CustomActionResult::Success { id });
    }

    #[test]
    fn dropped_completer_closes_channel() {
        let (tx, mut rx) = oneshot::channel::<CustomActionResult>();
        drop(CustomActionCompleter { tx });
        assert!(rx.try_recv().is_err());
    }
}
