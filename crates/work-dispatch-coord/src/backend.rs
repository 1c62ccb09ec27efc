//! Contract of the external coordination service.
//!
//! The lock and election recipes only need sessions that own ephemeral,
//! sequentially numbered nodes, plus a way to wait for a node to disappear.
//! That is the subset of a ZooKeeper-style store the recipes rely on.

use crate::CoordError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

pub type SessionId = u64;

/// Connectivity of one session. `Lost` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Lost,
}

/// An ephemeral node created under a parent path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceNode {
    pub path: String,
    pub sequence: u64,
    pub owner: SessionId,
}

/// Entry point to a coordination service
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Open a new session
    async fn connect(&self) -> Result<Arc<dyn Session>, CoordError>;
}

/// A client session. Every node it creates is removed when the session is
/// closed or lost.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Receiver that observes connectivity changes of this session
    fn state(&self) -> watch::Receiver<SessionState>;

    fn is_connected(&self) -> bool {
        *self.state().borrow() == SessionState::Connected
    }

    /// Create an ephemeral node under `parent` with the next sequence number
    async fn create_sequential(&self, parent: &str) -> Result<SequenceNode, CoordError>;

    /// Children of `parent`, ordered by sequence number
    async fn children(&self, parent: &str) -> Result<Vec<SequenceNode>, CoordError>;

    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Resolve once `path` no longer exists. Fails if this session is lost
    /// while waiting.
    async fn wait_deleted(&self, path: &str) -> Result<(), CoordError>;

    /// End the session, removing its ephemeral nodes
    async fn close(&self) -> Result<(), CoordError>;
}
