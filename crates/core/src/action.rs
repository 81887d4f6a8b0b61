use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::hlc::Hlc;
use crate::ids::DraftActionId;

/// Metadata key under which the record handler stores the target's object type.
pub const METADATA_API_NAME: &str = "LDS_ACTION_METADATA_API_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DraftActionStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl DraftActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Forward-only, except a failed upload may go back to pending.
    pub fn can_transition_to(&self, to: DraftActionStatus) -> bool {
        use DraftActionStatus::*;
        matches!(
            (self, to),
            (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Error)
                | (Uploading, Pending)
                | (Error, Pending)
        )
    }
}

/// Discriminant that selects the handler responsible for an action.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HandlerId {
    UiApiRecord,
    Custom(String),
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UiApiRecord => write!(f, "UIAPI_RECORD"),
            Self::Custom(name) => write!(f, "CUSTOM:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Post,
    Patch,
    Delete,
}

/// What a resource request does to its target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMutation {
    Create,
    Update,
    Delete,
}

impl HttpMethod {
    pub fn mutation(&self) -> RecordMutation {
        match self {
            Self::Post => RecordMutation::Create,
            Self::Patch => RecordMutation::Update,
            Self::Delete => RecordMutation::Delete,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_name: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RecordInput {
    pub fn new(api_name: Option<&str>) -> Self {
        Self {
            api_name: api_name.map(str::to_string),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// An ordinary resource call, opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub method: HttpMethod,
    pub base_path: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RecordInput>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

impl ResourceRequest {
    pub fn new(method: HttpMethod, base_path: &str, path: impl Into<String>) -> Self {
        Self {
            method,
            base_path: base_path.to_string(),
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: RecordInput) -> Self {
        self.body = Some(body);
        self
    }

    /// Record id addressed by the path (`/records/<id>`), if any.
    pub fn path_record_id(&self) -> Option<&str> {
        self.path
            .strip_prefix("/records/")
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionData {
    Resource(ResourceRequest),
    Custom(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DraftErrorKind {
    /// Server rejected the request; retrying the same payload will not help.
    Client,
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftActionError {
    pub kind: DraftErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftAction<D = ActionData> {
    pub id: DraftActionId,
    /// Key of the logical entity the action is queued under.
    pub tag: String,
    pub target_id: String,
    pub handler: HandlerId,
    pub data: D,
    pub status: DraftActionStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: Hlc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DraftActionError>,
}

/// A freshly built action that has not been dispatched yet.
pub type PendingDraftAction<D = ActionData> = DraftAction<D>;

impl<D> DraftAction<D> {
    pub fn is_pending(&self) -> bool {
        self.status == DraftActionStatus::Pending
    }

    pub fn is_uploading(&self) -> bool {
        self.status == DraftActionStatus::Uploading
    }

    pub fn is_error(&self) -> bool {
        self.status == DraftActionStatus::Error
    }

    pub fn transition(&mut self, to: DraftActionStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to != DraftActionStatus::Error {
            self.error = None;
        }
        Ok(())
    }

    /// Queue order: enqueue timestamp, then id.
    pub fn queue_order(&self) -> (Hlc, DraftActionId) {
        (self.timestamp, self.id)
    }
}

impl DraftAction<ActionData> {
    pub fn resource(&self) -> Option<&ResourceRequest> {
        match &self.data {
            ActionData::Resource(request) => Some(request),
            ActionData::Custom(_) => None,
        }
    }

    pub fn mutation(&self) -> Option<RecordMutation> {
        self.resource().map(|r| r.method.mutation())
    }

    pub fn is_create(&self) -> bool {
        self.mutation() == Some(RecordMutation::Create)
    }

    pub fn is_delete(&self) -> bool {
        self.mutation() == Some(RecordMutation::Delete)
    }
}

/// An action whose handler reported success, with whatever the server returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedDraftAction<D = ActionData> {
    pub action: DraftAction<D>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
}

/// Minimal diff a completed action produces against the persisted queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueOperation<D = ActionData> {
    Add(DraftAction<D>),
    Update {
        action: DraftAction<D>,
        id: DraftActionId,
    },
    Delete(DraftActionId),
}

/// Sort actions into queue order in place.
pub fn sort_actions<D>(actions: &mut [DraftAction<D>]) {
    actions.sort_by_key(|a| a.queue_order());
}
