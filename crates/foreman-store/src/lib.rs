//! Durable state store for automation records and the agent session registry.

use foreman_core::IssueId;
use thiserror::Error;

mod sqlite;

pub use sqlite::{SqliteStateStore, StatusCount};

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StateStoreError>;

/// Errors returned by the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("issue {0} already has a registered agent session")]
    SessionAlreadyRegistered(IssueId),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
