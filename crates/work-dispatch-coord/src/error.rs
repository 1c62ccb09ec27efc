use crate::backend::SessionId;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a coordination backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("Coordination session {0} was lost")]
    SessionLost(SessionId),

    #[error("Lock service is closed")]
    Closed,

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Invalid node path: {0}")]
    InvalidPath(String),
}

/// Errors returned to callers of the lock service
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock {name}")]
    Timeout { name: String, timeout: Duration },

    #[error("Exclusivity on lock {name} was lost while it was held")]
    ExclusivityLost { name: String },

    #[error("Invalid lock name: {0:?}")]
    InvalidName(String),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordError),
}

pub type Result<T> = std::result::Result<T, LockError>;
