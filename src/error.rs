//! Error taxonomy
//!
//! `EngineError` is what callers of the orchestrator see. `ExecutorError` is
//! what executors raise; the dispatcher absorbs those and never lets them
//! reach the caller.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the store, registry, dispatcher and orchestrator
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures raised by an executor invocation
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Network, rate limit or other failure likely to clear on retry
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Executor timed out after {0:?}")]
    Timeout(Duration),

    /// The executor ran but reported the action as failed
    #[error("Executor rejected action: {0}")]
    Rejected(String),

    /// Infrastructure or wiring fault behind the executor
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
