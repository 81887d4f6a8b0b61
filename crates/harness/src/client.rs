use std::sync::Arc;

use draftq_core::{FieldDataType, FieldInfo, ObjectInfo};
use draftq_engine::{Engine, EngineConfig, EngineError, StaticObjectInfoSource};
use draftq_storage::{DurableStore, SqliteDurableStore};

use crate::network::MockNetwork;

pub const TEST_USER_ID: &str = "005000000000001AAA";

/// Account, Contact and User metadata used across the scenario tests.
pub fn test_object_infos() -> StaticObjectInfoSource {
    StaticObjectInfoSource::new([
        ObjectInfo::new("Account", "001")
            .with_field(FieldInfo::new("Name", FieldDataType::String))
            .with_field(FieldInfo::new("Rating", FieldDataType::Picklist))
            .with_field(FieldInfo::new("AnnualRevenue", FieldDataType::Currency)),
        ObjectInfo::new("Contact", "003")
            .with_field(FieldInfo::new("FirstName", FieldDataType::String))
            .with_field(FieldInfo::new("LastName", FieldDataType::String))
            .with_field(FieldInfo::new("Birthdate", FieldDataType::Date))
            .with_field(FieldInfo::reference("AccountId", "Account", &["Account"])),
        ObjectInfo::new("User", "005").with_field(FieldInfo::new("Name", FieldDataType::String)),
    ])
}

/// One device: an engine over its own durable store and a scripted network.
pub struct TestClient {
    pub engine: Engine,
    pub network: Arc<MockNetwork>,
    pub physical: Arc<dyn DurableStore>,
}

impl TestClient {
    pub async fn new() -> Result<Self, EngineError> {
        let physical = Arc::new(SqliteDurableStore::open_in_memory()?);
        Self::with_store(physical).await
    }

    /// Client persisting to a database file; reopening the same path resumes the queue.
    pub async fn open(path: &str) -> Result<Self, EngineError> {
        let physical = Arc::new(SqliteDurableStore::open(path)?);
        Self::with_store(physical).await
    }

    pub async fn with_store(physical: Arc<dyn DurableStore>) -> Result<Self, EngineError> {
        crate::init_tracing();
        let network = Arc::new(MockNetwork::new());
        let config = EngineConfig::default().with_user_id(TEST_USER_ID);
        let engine = Engine::open(
            config,
            physical.clone(),
            network.clone(),
            Arc::new(test_object_infos()),
        )
        .await?;
        Ok(Self {
            engine,
            network,
            physical,
        })
    }
}
