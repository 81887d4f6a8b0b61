use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checksum mismatch for {segment}/{key}")]
    ChecksumMismatch { segment: String, key: String },

    /// Failure raised by a store decorator layered on top of the physical store.
    #[error("adapter error: {0}")]
    Adapter(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("core error: {0}")]
    Core(#[from] draftq_core::CoreError),
}

impl StorageError {
    pub fn adapter(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Adapter(Box::new(err))
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
