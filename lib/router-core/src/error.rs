use thiserror::Error;

use crate::template::TemplateErrors;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures reported by a [`ResourceStore`](crate::store::ResourceStore)
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("conflict writing {kind} {key}: resource version is stale")]
    Conflict { kind: &'static str, key: String },

    #[error("store request failed: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound { kind, key: key.into() }
    }

    pub fn conflict(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::Conflict { kind, key: key.into() }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateErrors),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}

impl CoreError {
    /// Expected absence, either reported by the store or found while matching
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_) | CoreError::Store(StoreError::NotFound { .. })
        )
    }
}
