use revis_model::SessionId;
use thiserror::Error;

use crate::backend::BackendError;

/// Failures surfaced by the core. Nothing here is retried internally; the
/// caller decides whether to restart a scan or delete.
#[derive(Error, Debug, Clone)]
pub enum RevisError {
    /// Dial, authentication or database selection failed.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection pool closed: {0}")]
    PoolClosed(String),

    /// Malformed scan reply or protocol failure while iterating keys.
    #[error("Key iteration failed: {0}")]
    Iteration(String),

    /// Type or value lookup for a batch of keys failed.
    #[error("Fetching key values failed: {0}")]
    Fetch(String),

    #[error("Scan session not found: {0}")]
    SessionNotFound(SessionId),

    /// The store rejected a command, e.g. a write against a read-only
    /// replica.
    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Delete batch failed: {0}")]
    DeleteBatch(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RevisError {
    pub fn connection(err: BackendError) -> Self {
        RevisError::Connection(err.to_string())
    }

    pub fn iteration(err: BackendError) -> Self {
        RevisError::Iteration(err.to_string())
    }

    pub fn fetch(err: BackendError) -> Self {
        RevisError::Fetch(err.to_string())
    }

    /// Transport failures and timeouts are connection errors; anything the
    /// store answered is a command error.
    pub fn command(err: BackendError) -> Self {
        match err {
            BackendError::Io(_) | BackendError::Timeout(_) => RevisError::connection(err),
            BackendError::Protocol(_) | BackendError::Server(_) => {
                RevisError::Command(err.to_string())
            }
        }
    }

    pub fn delete_batch(err: BackendError) -> Self {
        RevisError::DeleteBatch(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RevisError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, RevisError>;
