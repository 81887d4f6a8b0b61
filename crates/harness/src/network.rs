use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use draftq_core::{RecordRepresentation, ResourceRequest};
use draftq_engine::{NetworkAdapter, NetworkError, NetworkResponse};

/// Network that answers from a script and remembers every request it saw.
#[derive(Default)]
pub struct MockNetwork {
    responses: Mutex<VecDeque<Result<NetworkResponse, NetworkError>>>,
    requests: Mutex<Vec<ResourceRequest>>,
    offline: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: NetworkResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn push_status(&self, status: u16) {
        self.push_response(NetworkResponse::new(status, None));
    }

    pub fn push_error(&self, error: NetworkError) {
        self.responses.lock().push_back(Err(error));
    }

    /// While offline every dispatch fails without consuming the script.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl NetworkAdapter for MockNetwork {
    async fn dispatch(&self, request: &ResourceRequest) -> Result<NetworkResponse, NetworkError> {
        self.requests.lock().push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::Offline);
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(NetworkError::Transport("no scripted response".into())))
    }
}

/// 200 response carrying `record` as the body.
pub fn record_response(record: &RecordRepresentation) -> NetworkResponse {
    NetworkResponse::new(200, serde_json::to_value(record).ok())
}
