use crate::backend::{Coordinator, SequenceNode, Session, SessionId, SessionState};
use crate::CoordError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::debug;

const NODE_PREFIX: &str = "n-";

#[derive(Default)]
struct Tree {
    /// parent path -> sequence -> owning session
    nodes: HashMap<String, BTreeMap<u64, SessionId>>,
    next_sequence: HashMap<String, u64>,
    sessions: HashMap<SessionId, watch::Sender<SessionState>>,
    next_session: SessionId,
    operations: u64,
}

impl Tree {
    fn is_live(&self, session: SessionId) -> bool {
        self.sessions
            .get(&session)
            .map(|tx| *tx.borrow() == SessionState::Connected)
            .unwrap_or(false)
    }

    /// Mark `session` lost, forget it, and remove its nodes
    fn end_session(&mut self, session: SessionId) -> usize {
        if let Some(tx) = self.sessions.remove(&session) {
            tx.send_replace(SessionState::Lost);
        }

        let mut removed = 0;
        for children in self.nodes.values_mut() {
            let before = children.len();
            children.retain(|_, owner| *owner != session);
            removed += before - children.len();
        }
        self.nodes.retain(|_, children| !children.is_empty());
        self.forget_empty_parents();
        removed
    }

    /// Sequence counters restart once a parent has no children left
    fn forget_empty_parents(&mut self) {
        let nodes = &self.nodes;
        self.next_sequence.retain(|parent, _| nodes.contains_key(parent));
    }
}

struct Shared {
    tree: Mutex<Tree>,
    changed: Notify,
}

/// Coordination service held in process memory.
///
/// Every clone shares one node tree, so separate `DistributedLockService`
/// instances built on clones behave like separate processes talking to one
/// store. Used by tests and single-host deployments.
#[derive(Clone)]
pub struct InMemoryCoordinator {
    shared: Arc<Shared>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        InMemoryCoordinator {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Simulate the service expiring a session, e.g. after a network
    /// partition. The session is marked lost and its nodes disappear.
    pub fn expire(&self, session: SessionId) {
        let removed = self.shared.tree.lock().end_session(session);
        debug!("Expired session {} ({} nodes removed)", session, removed);
        self.shared.changed.notify_waiters();
    }

    /// Number of requests served so far, connects included
    pub fn operation_count(&self) -> u64 {
        self.shared.tree.lock().operations
    }

    /// Number of sessions ever opened
    pub fn session_count(&self) -> u64 {
        self.shared.tree.lock().next_session
    }

    /// Number of live nodes under `parent`
    pub fn node_count(&self, parent: &str) -> usize {
        self.shared
            .tree
            .lock()
            .nodes
            .get(parent)
            .map(|children| children.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn connect(&self) -> Result<Arc<dyn Session>, CoordError> {
        let mut tree = self.shared.tree.lock();
        tree.operations += 1;
        tree.next_session += 1;
        let id = tree.next_session;
        let (tx, rx) = watch::channel(SessionState::Connected);
        tree.sessions.insert(id, tx);
        debug!("Opened session {}", id);

        Ok(Arc::new(MemorySession {
            id,
            shared: self.shared.clone(),
            state: rx,
        }))
    }
}

struct MemorySession {
    id: SessionId,
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
}

fn node_path(parent: &str, sequence: u64) -> String {
    format!("{}/{}{:010}", parent, NODE_PREFIX, sequence)
}

fn split_node_path(path: &str) -> Result<(&str, u64), CoordError> {
    let (parent, leaf) = path
        .rsplit_once('/')
        .ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
    let sequence = leaf
        .strip_prefix(NODE_PREFIX)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
    Ok((parent, sequence))
}

impl MemorySession {
    fn live_tree(&self) -> Result<parking_lot::MutexGuard<'_, Tree>, CoordError> {
        let mut tree = self.shared.tree.lock();
        tree.operations += 1;
        if !tree.is_live(self.id) {
            return Err(CoordError::SessionLost(self.id));
        }
        Ok(tree)
    }

    fn exists(&self, parent: &str, sequence: u64) -> Result<bool, CoordError> {
        let tree = self.shared.tree.lock();
        if !tree.is_live(self.id) {
            return Err(CoordError::SessionLost(self.id));
        }
        Ok(tree
            .nodes
            .get(parent)
            .map(|children| children.contains_key(&sequence))
            .unwrap_or(false))
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn create_sequential(&self, parent: &str) -> Result<SequenceNode, CoordError> {
        if parent.is_empty() || parent.ends_with('/') {
            return Err(CoordError::InvalidPath(parent.to_string()));
        }

        let mut tree = self.live_tree()?;
        let counter = tree.next_sequence.entry(parent.to_string()).or_insert(0);
        *counter += 1;
        let sequence = *counter;
        tree.nodes
            .entry(parent.to_string())
            .or_default()
            .insert(sequence, self.id);

        Ok(SequenceNode {
            path: node_path(parent, sequence),
            sequence,
            owner: self.id,
        })
    }

    async fn children(&self, parent: &str) -> Result<Vec<SequenceNode>, CoordError> {
        let tree = self.live_tree()?;
        Ok(tree
            .nodes
            .get(parent)
            .map(|children| {
                children
                    .iter()
                    .map(|(sequence, owner)| SequenceNode {
                        path: node_path(parent, *sequence),
                        sequence: *sequence,
                        owner: *owner,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        let (parent, sequence) = split_node_path(path)?;
        {
            let mut tree = self.live_tree()?;
            let children = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            children
                .remove(&sequence)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if children.is_empty() {
                tree.nodes.remove(parent);
                tree.forget_empty_parents();
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn wait_deleted(&self, path: &str) -> Result<(), CoordError> {
        let (parent, sequence) = split_node_path(path)?;
        self.shared.tree.lock().operations += 1;

        loop {
            // Register before checking so a deletion between the check and
            // the await still wakes us.
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.exists(parent, sequence)? {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn close(&self) -> Result<(), CoordError> {
        let removed = {
            let mut tree = self.shared.tree.lock();
            tree.operations += 1;
            tree.end_session(self.id)
        };
        debug!("Closed session {} ({} nodes removed)", self.id, removed);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequence_numbers_are_ordered() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        let b = coordinator.connect().await.unwrap();

        let first = a.create_sequential("/locks/x").await.unwrap();
        let second = b.create_sequential("/locks/x").await.unwrap();
        assert!(first.sequence < second.sequence);
        assert_eq!(first.path, "/locks/x/n-0000000001");

        let children = a.children("/locks/x").await.unwrap();
        assert_eq!(children, vec![first, second]);
    }

    #[tokio::test]
    async fn test_wait_deleted_wakes_on_delete() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        let b = coordinator.connect().await.unwrap();

        let node = a.create_sequential("/locks/y").await.unwrap();
        let path = node.path.clone();
        let waiter = tokio::spawn(async move { b.wait_deleted(&path).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        a.delete(&node.path).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_expire_removes_ephemeral_nodes() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        a.create_sequential("/locks/z").await.unwrap();
        a.create_sequential("/leaders/z").await.unwrap();

        coordinator.expire(a.id());

        assert_eq!(coordinator.node_count("/locks/z"), 0);
        assert_eq!(coordinator.node_count("/leaders/z"), 0);
        assert!(!a.is_connected());
        assert_eq!(
            a.create_sequential("/locks/z").await,
            Err(CoordError::SessionLost(a.id()))
        );
    }

    #[tokio::test]
    async fn test_close_releases_nodes() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        a.create_sequential("/locks/w").await.unwrap();

        a.close().await.unwrap();
        assert_eq!(coordinator.node_count("/locks/w"), 0);
        assert_eq!(coordinator.session_count(), 1);
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_ended_sessions_are_forgotten() {
        let coordinator = InMemoryCoordinator::new();
        for round in 0..3 {
            let closed = coordinator.connect().await.unwrap();
            closed.create_sequential("/locks/churn").await.unwrap();
            closed.close().await.unwrap();

            let expired = coordinator.connect().await.unwrap();
            expired.create_sequential("/leaders/churn").await.unwrap();
            coordinator.expire(expired.id());
            assert!(!expired.is_connected(), "round {}", round);
        }

        let tree = coordinator.shared.tree.lock();
        assert!(tree.sessions.is_empty());
        assert!(tree.nodes.is_empty());
        assert!(tree.next_sequence.is_empty());
        assert_eq!(tree.next_session, 6);
    }

    #[tokio::test]
    async fn test_sequence_kept_while_parent_has_children() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        let first = a.create_sequential("/locks/v").await.unwrap();
        let second = a.create_sequential("/locks/v").await.unwrap();

        a.delete(&first.path).await.unwrap();
        let third = a.create_sequential("/locks/v").await.unwrap();
        assert!(third.sequence > second.sequence);
    }

    #[tokio::test]
    async fn test_delete_unknown_node() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.connect().await.unwrap();
        assert!(matches!(
            a.delete("/locks/q/n-0000000007").await,
            Err(CoordError::NoNode(_))
        ));
        assert!(matches!(
            a.delete("bogus").await,
            Err(CoordError::InvalidPath(_))
        ));
    }
}
