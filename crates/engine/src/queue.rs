//! Durable, per-tag FIFO queue of draft actions.
//!
//! Every action is one entry in the DRAFT segment keyed by its id. Mutations are
//! serialized through `write_lock`; dispatch happens outside of it so a slow
//! upload never blocks enqueueing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use draftq_core::{
    CompletedDraftAction, DraftAction, DraftActionError, DraftActionId, DraftActionStatus,
    DraftClock, DraftErrorKind, HandlerId, QueueOperation, sort_actions,
};
use draftq_storage::{
    DRAFT_SEGMENT, DurableStore, DurableStoreEntries, DurableStoreEntry, DurableStoreOperation,
    StorageError,
};

use crate::error::EngineError;
use crate::handler::{
    ActionCompletion, ActionHandler, ActionInput, CompletionListener, ProcessActionResult,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Started,
    /// A retryable failure happened; the caller decides when to try again.
    Waiting,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    ActionAdded(DraftAction),
    ActionUploading(DraftAction),
    ActionCompleted(DraftAction),
    ActionFailed { action: DraftAction, retryable: bool },
    ActionUpdated(DraftAction),
    ActionRemoved(DraftAction),
    StateChanged(QueueState),
}

/// Read access to the persisted draft list.
#[async_trait]
pub trait DraftActionSource: Send + Sync {
    async fn all_draft_actions(&self) -> Result<Vec<DraftAction>, StorageError>;

    async fn draft_actions_for(&self, tag: &str) -> Result<Vec<DraftAction>, StorageError> {
        let mut actions = self.all_draft_actions().await?;
        actions.retain(|a| a.tag == tag);
        Ok(actions)
    }
}

#[async_trait]
impl<S: DurableStore + ?Sized> DraftActionSource for S {
    async fn all_draft_actions(&self) -> Result<Vec<DraftAction>, StorageError> {
        let entries = self.get_all_entries(DRAFT_SEGMENT).await?;
        let mut actions: Vec<DraftAction> = entries
            .into_values()
            .filter_map(|e| e.as_draft_action().cloned())
            .collect();
        sort_actions(&mut actions);
        Ok(actions)
    }
}

/// First dispatchable action of every tag, in queue order. A tag whose head is
/// uploading or errored contributes nothing.
pub fn eligible_actions(actions: &[DraftAction]) -> Vec<DraftAction> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for action in actions {
        if action.status == DraftActionStatus::Completed || !seen.insert(action.tag.as_str()) {
            continue;
        }
        if action.is_pending() {
            out.push(action.clone());
        }
    }
    out
}

fn action_entry(action: &DraftAction) -> (String, DurableStoreEntry) {
    (action.id.to_string(), DurableStoreEntry::draft_action(action.clone()))
}

struct QueueInner {
    store: Arc<dyn DurableStore>,
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn ActionHandler>>>,
    clock: Mutex<DraftClock>,
    state: Mutex<QueueState>,
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
    max_concurrent: usize,
}

impl QueueInner {
    fn handler(&self, id: &HandlerId) -> Result<Arc<dyn ActionHandler>, EngineError> {
        self.handlers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(id.clone()))
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: QueueState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(?state, "queue state changed");
            self.emit(QueueEvent::StateChanged(state));
        }
    }

    async fn load(&self) -> Result<Vec<DraftAction>, EngineError> {
        Ok(self.store.all_draft_actions().await?)
    }

    async fn find(&self, id: DraftActionId) -> Result<DraftAction, EngineError> {
        let entries = self.store.get_entries(&[id.to_string()], DRAFT_SEGMENT).await?;
        entries
            .values()
            .find_map(|e| e.as_draft_action().cloned())
            .ok_or(EngineError::ActionNotFound(id))
    }

    async fn persist(&self, actions: &[DraftAction]) -> Result<(), EngineError> {
        let entries: DurableStoreEntries = actions.iter().map(action_entry).collect();
        self.store.set_entries(entries, DRAFT_SEGMENT).await?;
        Ok(())
    }

    /// Mark up to `limit` eligible actions uploading and persist that.
    async fn claim(&self, limit: usize) -> Result<Vec<DraftAction>, EngineError> {
        let _guard = self.write_lock.lock().await;
        let actions = self.load().await?;
        let mut claimed = eligible_actions(&actions);
        claimed.truncate(limit);
        for action in &mut claimed {
            action.transition(DraftActionStatus::Uploading)?;
        }
        if !claimed.is_empty() {
            self.persist(&claimed).await?;
        }
        Ok(claimed)
    }

    async fn dispatch(
        self: Arc<Self>,
        action: DraftAction,
    ) -> Result<ProcessActionResult, EngineError> {
        debug!(id = %action.id, tag = %action.tag, "dispatching draft action");
        self.emit(QueueEvent::ActionUploading(action.clone()));
        let handler = self.handler(&action.handler)?;
        let completion = ActionCompletion::new(action.clone(), self.clone());
        match handler.handle(action.clone(), completion).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(id = %action.id, error = %e, "handler failed; returning action to pending");
                let error = DraftActionError {
                    kind: DraftErrorKind::Network,
                    message: e.to_string(),
                    status: None,
                    body: None,
                };
                self.action_failed(action, error, true).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CompletionListener for QueueInner {
    async fn action_completed(&self, completed: CompletedDraftAction) -> Result<(), EngineError> {
        let handler = self.handler(&completed.action.handler)?;
        handler.on_completed(&completed).await?;

        let _guard = self.write_lock.lock().await;
        let actions = self.load().await?;
        let operations = handler.queue_operations_for_completed_draft(&actions, &completed);

        let mut sets = DurableStoreEntries::new();
        let mut evicts = Vec::new();
        for op in operations {
            match op {
                QueueOperation::Add(action) => {
                    let (key, entry) = action_entry(&action);
                    sets.insert(key, entry);
                }
                QueueOperation::Update { action, id } => {
                    if action.id != id {
                        evicts.push(id.to_string());
                    }
                    let (key, entry) = action_entry(&action);
                    sets.insert(key, entry);
                }
                QueueOperation::Delete(id) => evicts.push(id.to_string()),
            }
        }
        let mut batch = Vec::new();
        if !evicts.is_empty() {
            batch.push(DurableStoreOperation::EvictEntries {
                segment: DRAFT_SEGMENT.to_string(),
                ids: evicts,
            });
        }
        if !sets.is_empty() {
            batch.push(DurableStoreOperation::SetEntries {
                segment: DRAFT_SEGMENT.to_string(),
                entries: sets,
            });
        }
        self.store.batch_operations(batch).await?;

        let mut action = completed.action;
        action.status = DraftActionStatus::Completed;
        info!(id = %action.id, tag = %action.tag, "draft action completed");
        self.emit(QueueEvent::ActionCompleted(action));
        Ok(())
    }

    async fn action_failed(
        &self,
        action: DraftAction,
        error: DraftActionError,
        retryable: bool,
    ) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut current = match self.find(action.id).await {
            Ok(current) => current,
            Err(EngineError::ActionNotFound(id)) => {
                warn!(%id, "failure reported for an action no longer queued");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if retryable {
            current.transition(DraftActionStatus::Pending)?;
            warn!(id = %current.id, message = %error.message, "retryable failure; action back to pending");
        } else {
            current.transition(DraftActionStatus::Error)?;
            current.error = Some(error);
            warn!(id = %current.id, tag = %current.tag, "terminal failure; tag blocked until retried or removed");
        }
        self.persist(std::slice::from_ref(&current)).await?;
        if retryable {
            self.set_state(QueueState::Waiting);
        }
        self.emit(QueueEvent::ActionFailed {
            action: current,
            retryable,
        });
        Ok(())
    }
}

/// Persistent queue of draft actions, drained per tag in FIFO order.
#[derive(Clone)]
pub struct DurableDraftQueue {
    inner: Arc<QueueInner>,
}

impl DurableDraftQueue {
    pub fn new(store: Arc<dyn DurableStore>, max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                store,
                handlers: RwLock::new(BTreeMap::new()),
                clock: Mutex::new(DraftClock::new()),
                state: Mutex::new(QueueState::Stopped),
                write_lock: tokio::sync::Mutex::new(()),
                events,
                max_concurrent: max_concurrent.max(1),
            }),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn ActionHandler>) {
        let id = handler.handler_id();
        if self.inner.handlers.write().insert(id.clone(), handler).is_some() {
            warn!(handler = %id, "replaced an existing handler");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.lock()
    }

    fn is_running(&self) -> bool {
        !matches!(self.state(), QueueState::Stopped | QueueState::Error)
    }

    /// Recover from a previous session: uploads that never reported back go
    /// back to pending, and the clock moves past every persisted timestamp.
    pub async fn start(&self) -> Result<(), EngineError> {
        let _guard = self.inner.write_lock.lock().await;
        let actions = self.inner.load().await?;
        let mut reset = Vec::new();
        {
            let mut clock = self.inner.clock.lock();
            for action in &actions {
                clock.observe(&action.timestamp);
            }
        }
        for action in actions.into_iter().filter(|a| a.is_uploading()) {
            let mut action = action;
            action.transition(DraftActionStatus::Pending)?;
            reset.push(action);
        }
        if !reset.is_empty() {
            info!(count = reset.len(), "reset interrupted uploads to pending");
            self.inner.persist(&reset).await?;
        }
        self.inner.set_state(QueueState::Started);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.set_state(QueueState::Stopped);
    }

    pub async fn enqueue(
        &self,
        handler_id: &HandlerId,
        input: ActionInput,
    ) -> Result<DraftAction, EngineError> {
        let handler = self.inner.handler(handler_id)?;
        let _guard = self.inner.write_lock.lock().await;
        let actions = self.inner.load().await?;
        let timestamp = self.inner.clock.lock().tick()?;
        let action = handler
            .build_pending_action(input, timestamp, &actions)
            .await?;
        self.inner.persist(std::slice::from_ref(&action)).await?;
        debug!(id = %action.id, tag = %action.tag, "enqueued draft action");
        self.inner.emit(QueueEvent::ActionAdded(action.clone()));
        Ok(action)
    }

    pub async fn get_queue_actions(&self) -> Result<Vec<DraftAction>, EngineError> {
        self.inner.load().await
    }

    pub async fn actions_for_tag(&self, tag: &str) -> Result<Vec<DraftAction>, EngineError> {
        Ok(self.inner.store.draft_actions_for(tag).await?)
    }

    pub async fn process_next_action(&self) -> Result<ProcessActionResult, EngineError> {
        if !self.is_running() {
            return Ok(ProcessActionResult::NoActionToProcess);
        }
        let claimed = self.inner.claim(1).await?;
        let Some(action) = claimed.into_iter().next() else {
            let actions = self.inner.load().await?;
            if actions.iter().any(|a| a.is_error()) && !actions.iter().any(|a| a.is_uploading()) {
                return Ok(ProcessActionResult::BlockedOnError);
            }
            return Ok(ProcessActionResult::NoActionToProcess);
        };
        self.inner.set_state(QueueState::Started);
        self.inner.clone().dispatch(action).await
    }

    /// Dispatch one action per tag concurrently, round after round, until no
    /// tag has anything eligible or a retryable failure puts the queue in `Waiting`.
    pub async fn drain(&self) -> Result<Vec<ProcessActionResult>, EngineError> {
        let mut results = Vec::new();
        if !self.is_running() {
            return Ok(results);
        }
        self.inner.set_state(QueueState::Started);
        loop {
            let claimed = self.inner.claim(self.inner.max_concurrent).await?;
            if claimed.is_empty() {
                break;
            }
            let round = join_all(
                claimed
                    .into_iter()
                    .map(|action| self.inner.clone().dispatch(action)),
            )
            .await;
            let mut waiting = false;
            for result in round {
                let result = result?;
                waiting |= result == ProcessActionResult::NetworkError;
                results.push(result);
            }
            if waiting {
                break;
            }
        }
        Ok(results)
    }

    pub async fn remove_draft_action(&self, id: DraftActionId) -> Result<DraftAction, EngineError> {
        let _guard = self.inner.write_lock.lock().await;
        let action = self.inner.find(id).await?;
        if action.is_uploading() {
            return Err(EngineError::ActionUploading(id));
        }
        self.inner
            .store
            .evict_entries(&[id.to_string()], DRAFT_SEGMENT)
            .await?;
        self.inner.emit(QueueEvent::ActionRemoved(action.clone()));
        Ok(action)
    }

    /// Put an errored action back in line.
    pub async fn retry_action(&self, id: DraftActionId) -> Result<DraftAction, EngineError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut action = self.inner.find(id).await?;
        action.transition(DraftActionStatus::Pending)?;
        self.inner.persist(std::slice::from_ref(&action)).await?;
        self.inner.emit(QueueEvent::ActionUpdated(action.clone()));
        Ok(action)
    }

    /// Move the payload of `id_of_replacement` into the queue slot of
    /// `id_to_replace`, removing the replacement.
    pub async fn replace_action(
        &self,
        id_to_replace: DraftActionId,
        id_of_replacement: DraftActionId,
        new_id: Option<DraftActionId>,
    ) -> Result<DraftAction, EngineError> {
        let _guard = self.inner.write_lock.lock().await;
        let actions = self.inner.load().await?;
        let original = actions
            .iter()
            .find(|a| a.id == id_to_replace)
            .ok_or(EngineError::ReplaceMissingAction(id_to_replace))?;
        let handler = self.inner.handler(&original.handler)?;
        let replaced =
            handler.replace_action(id_to_replace, id_of_replacement, new_id, &actions)?;

        let mut evicts = vec![replaced.replacing_action.id.to_string()];
        if replaced.action_to_replace.id != replaced.original.id {
            evicts.push(replaced.original.id.to_string());
        }
        let (key, entry) = action_entry(&replaced.action_to_replace);
        self.inner
            .store
            .batch_operations(vec![
                DurableStoreOperation::EvictEntries {
                    segment: DRAFT_SEGMENT.to_string(),
                    ids: evicts,
                },
                DurableStoreOperation::SetEntries {
                    segment: DRAFT_SEGMENT.to_string(),
                    entries: DurableStoreEntries::from([(key, entry)]),
                },
            ])
            .await?;
        self.inner
            .emit(QueueEvent::ActionRemoved(replaced.replacing_action.clone()));
        self.inner
            .emit(QueueEvent::ActionUpdated(replaced.action_to_replace.clone()));
        Ok(replaced.action_to_replace)
    }

    pub async fn update_draft_action_metadata(
        &self,
        id: DraftActionId,
        metadata: BTreeMap<String, String>,
    ) -> Result<DraftAction, EngineError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut action = self.inner.find(id).await?;
        action.metadata = metadata;
        self.inner.persist(std::slice::from_ref(&action)).await?;
        self.inner.emit(QueueEvent::ActionUpdated(action.clone()));
        Ok(action)
    }

    /// Record an unrecoverable internal failure; processing stops until `start`.
    pub fn fail(&self, reason: &EngineError) {
        error!(error = %reason, "draft queue entered error state");
        self.inner.set_state(QueueState::Error);
    }
}
