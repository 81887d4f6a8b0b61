pub mod cache;
pub mod config;
pub mod denormalize;
pub mod draft_aware;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod merge;
pub mod metadata;
pub mod network;
pub mod overlay;
pub mod queue;

pub use cache::{InMemoryCache, RecordCache};
pub use config::EngineConfig;
pub use denormalize::{RecordDenormalizingDurableStore, normalize_record};
pub use draft_aware::{DraftAwareDurableStore, OverlayRefresh};
pub use error::EngineError;
pub use handler::{
    ActionCompletion, ActionHandler, ActionInput, CompletionListener, ProcessActionResult,
    ReplacedAction,
};
pub use handlers::{
    CustomActionCompleter, CustomActionErrorType, CustomActionExecutor, CustomActionHandler,
    CustomActionResult, UiApiRecordHandler,
};
pub use merge::MergingDurableStore;
pub use metadata::{ObjectInfoSource, StaticObjectInfoSource};
pub use network::{NetworkAdapter, NetworkError, NetworkResponse};
pub use overlay::DraftOverlay;
pub use queue::{DraftActionSource, DurableDraftQueue, QueueEvent, QueueState};

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use draftq_core::{
    DraftAction, FieldValue, HandlerId, HttpMethod, RecordInput, RecordRepresentation,
    ResourceRequest, record_key,
};
use draftq_storage::{
    ChangeKind, DEFAULT_SEGMENT, DRAFT_ID_MAPPINGS_SEGMENT, DurableStore, DurableStoreChange,
};

const RECORDS_PATH: &str = "/records";

/// Offline-first record access: writes become queued draft actions that are
/// overlaid on stored records until the server acknowledges them.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    cache: Arc<InMemoryCache>,
    queue: DurableDraftQueue,
    network: Arc<dyn NetworkAdapter>,
    changes: Mutex<broadcast::Receiver<Vec<DurableStoreChange>>>,
}

impl Engine {
    /// Stack the store adapters over `physical`, register the record handler
    /// and recover the queue left by a previous session.
    pub async fn open(
        config: EngineConfig,
        physical: Arc<dyn DurableStore>,
        network: Arc<dyn NetworkAdapter>,
        object_infos: Arc<dyn ObjectInfoSource>,
    ) -> Result<Self, EngineError> {
        let cache = Arc::new(InMemoryCache::new());
        let merging = Arc::new(MergingDurableStore::new(
            physical,
            object_infos.clone(),
            config.user_id.clone(),
        ));
        let denormalizing = Arc::new(RecordDenormalizingDurableStore::new(
            merging.clone(),
            cache.clone(),
        ));
        let store: Arc<dyn DurableStore> = Arc::new(DraftAwareDurableStore::new(
            denormalizing,
            merging,
            object_infos.clone(),
            config.user_id.clone(),
        ));
        let changes = Mutex::new(store.subscribe());

        let queue = DurableDraftQueue::new(store.clone(), config.max_concurrent_uploads);
        queue.add_handler(Arc::new(UiApiRecordHandler::new(
            network.clone(),
            store.clone(),
            cache.clone(),
            object_infos,
        )));
        queue.start().await?;
        info!(user = %config.user_id, "draft engine opened");

        Ok(Self {
            config,
            store,
            cache,
            queue,
            network,
            changes,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &DurableDraftQueue {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<InMemoryCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<dyn NetworkAdapter> {
        &self.network
    }

    /// Storage failures leave the queue in an unknown state; stop processing until restarted.
    fn observe<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e @ EngineError::Storage(_)) = &result {
            self.queue.fail(e);
        }
        result
    }

    fn record_input<'a>(
        api_name: Option<&str>,
        fields: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> RecordInput {
        fields
            .into_iter()
            .fold(RecordInput::new(api_name), |input, (name, value)| {
                input.with_field(name, value)
            })
    }

    async fn enqueue_record_request(
        &self,
        request: ResourceRequest,
    ) -> Result<DraftAction, EngineError> {
        let result = self
            .queue
            .enqueue(&HandlerId::UiApiRecord, ActionInput::Resource(request))
            .await;
        self.observe(result)
    }

    pub async fn create_record<'a>(
        &self,
        api_name: &str,
        fields: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<DraftAction, EngineError> {
        let request = ResourceRequest::new(HttpMethod::Post, &self.config.base_path, RECORDS_PATH)
            .with_body(Self::record_input(Some(api_name), fields));
        self.enqueue_record_request(request).await
    }

    pub async fn update_record<'a>(
        &self,
        record_id: &str,
        fields: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<DraftAction, EngineError> {
        let request = ResourceRequest::new(
            HttpMethod::Patch,
            &self.config.base_path,
            format!("{RECORDS_PATH}/{record_id}"),
        )
        .with_body(Self::record_input(None, fields));
        self.enqueue_record_request(request).await
    }

    pub async fn delete_record(&self, record_id: &str) -> Result<DraftAction, EngineError> {
        let request = ResourceRequest::new(
            HttpMethod::Delete,
            &self.config.base_path,
            format!("{RECORDS_PATH}/{record_id}"),
        );
        self.enqueue_record_request(request).await
    }

    pub fn register_custom_handler(&self, name: &str, executor: CustomActionExecutor) {
        self.queue
            .add_handler(Arc::new(CustomActionHandler::new(name, executor)));
    }

    pub async fn enqueue_custom(
        &self,
        handler: &str,
        tag: &str,
        target_id: &str,
        data: serde_json::Value,
    ) -> Result<DraftAction, EngineError> {
        let input = ActionInput::Custom {
            tag: tag.to_string(),
            target_id: target_id.to_string(),
            data,
        };
        let result = self
            .queue
            .enqueue(&HandlerId::Custom(handler.to_string()), input)
            .await;
        self.observe(result)
    }

    pub async fn process_next(&self) -> Result<ProcessActionResult, EngineError> {
        let result = self.queue.process_next_action().await;
        self.observe(result)
    }

    pub async fn drain(&self) -> Result<Vec<ProcessActionResult>, EngineError> {
        let result = self.queue.drain().await;
        self.observe(result)
    }

    /// Write a record fetched from the server. Queued drafts for it are replayed on top.
    pub async fn ingest_record(&self, record: &RecordRepresentation) -> Result<(), EngineError> {
        let result = self
            .store
            .set_entries(normalize_record(record), DEFAULT_SEGMENT)
            .await
            .map_err(EngineError::from);
        self.observe(result)
    }

    /// The stored record for `record_id`, following a draft id to its server id
    /// once the create has been acknowledged.
    pub async fn get_record(
        &self,
        record_id: &str,
    ) -> Result<Option<RecordRepresentation>, EngineError> {
        let mut key = record_key(record_id);
        let mappings = self
            .store
            .get_entries(std::slice::from_ref(&key), DRAFT_ID_MAPPINGS_SEGMENT)
            .await?;
        if let Some(mapping) = mappings.get(&key).and_then(|e| e.as_id_mapping()) {
            debug!(draft = %key, canonical = %mapping.canonical_key, "following draft id mapping");
            key = mapping.canonical_key.clone();
        }
        let mut entries = self
            .store
            .get_entries(std::slice::from_ref(&key), DEFAULT_SEGMENT)
            .await?;
        Ok(entries.remove(&key).and_then(|e| e.into_record()))
    }

    /// Apply pending store change notifications to the cache and publish the
    /// touched keys. Returns how many keys were broadcast.
    pub async fn pump_changes(&self) -> Result<usize, EngineError> {
        let mut set = BTreeSet::new();
        let mut evicted = BTreeSet::new();
        {
            let mut rx = self.changes.lock();
            loop {
                match rx.try_recv() {
                    Ok(changes) => {
                        for change in changes.into_iter().filter(|c| c.segment == DEFAULT_SEGMENT) {
                            for id in change.ids {
                                match change.kind {
                                    ChangeKind::Set => {
                                        evicted.remove(&id);
                                        set.insert(id);
                                    }
                                    ChangeKind::Evict => {
                                        set.remove(&id);
                                        evicted.insert(id);
                                    }
                                }
                            }
                        }
                    }
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        warn!(skipped, "store change notifications lagged");
                    }
                    Err(_) => break,
                }
            }
        }

        for key in &evicted {
            self.cache.evict(key);
        }
        if !set.is_empty() {
            let keys: Vec<String> = set.into_iter().collect();
            let entries = self.store.get_entries(&keys, DEFAULT_SEGMENT).await?;
            for record in entries.into_values().filter_map(|e| e.into_record()) {
                for (key, normalized) in normalize_record(&record) {
                    self.cache.put(&key, normalized.data);
                }
            }
        }
        Ok(self.cache.broadcast())
    }
}
