use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_PATH: &str = "/services/data/v58.0/ui-api";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Id stamped into `LastModifiedById` / `CreatedById` of drafted records.
    pub user_id: String,
    pub base_path: String,
    /// Upper bound on actions dispatched in one drain round.
    pub max_concurrent_uploads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "005000000000000AAA".to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            max_concurrent_uploads: 4,
        }
    }
}

impl EngineConfig {
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_max_concurrent_uploads(mut self, max: usize) -> Self {
        self.max_concurrent_uploads = max.max(1);
        self
    }
}
