use crate::backend::{SequenceNode, Session, SessionState};
use crate::CoordError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Owns one ephemeral node and deletes it on every exit path.
///
/// `release` is the normal path. If the guard is dropped without it (caller
/// cancelled the future, or a panic unwound through it) the delete is handed
/// to the runtime.
pub(crate) struct NodeGuard {
    session: Arc<dyn Session>,
    path: Option<String>,
}

impl NodeGuard {
    pub(crate) fn new(session: Arc<dyn Session>, node: &SequenceNode) -> Self {
        NodeGuard {
            session,
            path: Some(node.path.clone()),
        }
    }

    pub(crate) async fn release(&mut self) {
        if let Some(path) = self.path.take() {
            delete_node(self.session.as_ref(), &path).await;
        }
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    delete_node(session.as_ref(), &path).await;
                });
            }
            Err(_) => debug!("No runtime to release node {}, left to session expiry", path),
        }
    }
}

async fn delete_node(session: &dyn Session, path: &str) {
    match session.delete(path).await {
        Ok(()) => debug!("Released node {}", path),
        // Already gone together with its session
        Err(CoordError::SessionLost(_)) | Err(CoordError::NoNode(_)) => {}
        Err(e) => debug!("Failed to release node {}: {}", path, e),
    }
}

/// Wait until `node` has the lowest sequence under `parent`.
///
/// Each waiter only watches its immediate predecessor, so a release wakes a
/// single peer.
pub(crate) async fn wait_until_first(
    session: &dyn Session,
    parent: &str,
    node: &SequenceNode,
) -> Result<(), CoordError> {
    loop {
        let children = session.children(parent).await?;
        if !children.iter().any(|c| c.sequence == node.sequence) {
            // Our node vanished, which only happens when the session dies
            return Err(CoordError::SessionLost(session.id()));
        }

        let predecessor = children
            .iter()
            .filter(|c| c.sequence < node.sequence)
            .max_by_key(|c| c.sequence);

        match predecessor {
            None => return Ok(()),
            Some(p) => {
                debug!("Node {} waiting on {}", node.path, p.path);
                session.wait_deleted(&p.path).await?;
            }
        }
    }
}

/// Handed to a critical section while its lock is held.
///
/// Exclusivity is only guaranteed while the backing session stays connected.
/// Long critical sections should check [`Exclusivity::is_lost`] between steps
/// or race their work against [`Exclusivity::lost`].
#[derive(Clone)]
pub struct Exclusivity {
    name: String,
    state: watch::Receiver<SessionState>,
}

impl Exclusivity {
    pub(crate) fn new(name: &str, state: watch::Receiver<SessionState>) -> Self {
        Exclusivity {
            name: name.to_string(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_lost(&self) -> bool {
        *self.state.borrow() != SessionState::Connected
    }

    /// Resolves once the session backing this lock is lost
    pub async fn lost(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the session is gone as well
        let _ = state.wait_for(|s| *s != SessionState::Connected).await;
    }
}
