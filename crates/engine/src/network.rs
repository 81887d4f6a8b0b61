use async_trait::async_trait;
use thiserror::Error;

use draftq_core::ResourceRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

impl NetworkResponse {
    pub fn new(status: u16, body: Option<serde_json::Value>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to get any response at all. Retrying later may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("offline")]
    Offline,

    #[error("transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn dispatch(&self, request: &ResourceRequest) -> Result<NetworkResponse, NetworkError>;
}
