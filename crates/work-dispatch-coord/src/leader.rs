use crate::backend::SessionState;
use crate::mutex::{wait_until_first, NodeGuard};
use crate::service::DistributedLockService;
use crate::{CoordError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Leader,
}

/// Observer of one election group.
///
/// Both callbacks run on the election task and must return promptly. A
/// leader duty that runs for a long time belongs on its own task, started in
/// `on_leader` and stopped in `on_follower`.
#[async_trait]
pub trait LeaderListener: Send + Sync {
    async fn on_leader(&self);

    async fn on_follower(&self);
}

/// Handle to a running election. Dropping it does not leave the group; call
/// [`ElectionHandle::leave`] for that.
pub struct ElectionHandle {
    name: String,
    state: watch::Receiver<LeaderState>,
    /// Count of resignation requests
    resign: watch::Sender<u64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ElectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Resolve once this instance is in `state`
    pub async fn wait_for(&self, state: LeaderState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Give up leadership and rejoin at the back of the group.
    /// Has no effect while following.
    pub fn resign(&self) {
        if self.is_leader() {
            self.resign.send_modify(|requests| *requests += 1);
        }
    }

    /// Leave the group, giving up leadership if held
    pub async fn leave(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Election task {} ended abnormally: {}", self.name, e);
        }
    }
}

enum Exit {
    Cancelled,
    Resigned,
    SessionLost,
}

impl DistributedLockService {
    /// Join the election group `name` and keep competing until the handle
    /// leaves or the service closes.
    ///
    /// Returns immediately; the listener is told about every transition.
    pub fn elect(&self, name: &str, listener: Arc<dyn LeaderListener>) -> Result<ElectionHandle> {
        let path = self.election_path(name)?;
        let (state_tx, state_rx) = watch::channel(LeaderState::Follower);
        let (resign, resign_rx) = watch::channel(0);
        let cancel = self.inner.shutdown.child_token();

        let task = self.inner.elections.spawn(run_election(
            self.clone(),
            path,
            listener,
            state_tx,
            resign_rx,
            cancel.clone(),
        ));

        Ok(ElectionHandle {
            name: name.to_string(),
            state: state_rx,
            resign,
            cancel,
            task,
        })
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn run_election(
    service: DistributedLockService,
    path: String,
    listener: Arc<dyn LeaderListener>,
    state: watch::Sender<LeaderState>,
    mut resign: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    let rejoin_delay = service.config().rejoin_delay();
    debug!("Joining election {}", path);

    while !cancel.is_cancelled() {
        let session = match service.session().await {
            Ok(session) => session,
            Err(CoordError::Closed) => break,
            Err(e) => {
                warn!("Election {} could not open a session: {}", path, e);
                pause(&cancel, rejoin_delay).await;
                continue;
            }
        };

        let node = match session.create_sequential(&path).await {
            Ok(node) => node,
            Err(e) => {
                warn!("Election {} could not join: {}", path, e);
                pause(&cancel, rejoin_delay).await;
                continue;
            }
        };
        let mut guard = NodeGuard::new(session.clone(), &node);

        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            result = wait_until_first(session.as_ref(), &path, &node) => Some(result),
        };
        match waited {
            None => {
                guard.release().await;
                break;
            }
            Some(Err(e)) => {
                warn!("Election {} lost its place: {}", path, e);
                guard.release().await;
                pause(&cancel, rejoin_delay).await;
                continue;
            }
            Some(Ok(())) => {}
        }

        info!("Became leader for {}", path);
        // Requests made during an earlier term do not end this one
        resign.borrow_and_update();
        state.send_replace(LeaderState::Leader);
        listener.on_leader().await;

        let mut session_state = session.state();
        let exit = tokio::select! {
            _ = cancel.cancelled() => Exit::Cancelled,
            Ok(()) = resign.changed() => Exit::Resigned,
            _ = session_state.wait_for(|s| *s != SessionState::Connected) => Exit::SessionLost,
        };

        // Followers are told before the node goes away, so the next leader
        // cannot be elected while this one still believes it leads.
        state.send_replace(LeaderState::Follower);
        listener.on_follower().await;
        guard.release().await;

        match exit {
            Exit::Cancelled => {
                info!("Left election {}", path);
                break;
            }
            Exit::Resigned => info!("Resigned leadership of {}", path),
            Exit::SessionLost => {
                warn!("Lost leadership of {}: coordination session lost", path);
                pause(&cancel, rejoin_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryCoordinator, LockConfig};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many listeners believe they lead at once
    #[derive(Default)]
    struct Fleet {
        current: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    struct Recorder {
        index: usize,
        fleet: Arc<Fleet>,
        events: Arc<Mutex<Vec<String>>>,
        /// Time spent winding down a term before stepping down
        follower_delay: Duration,
    }

    impl Recorder {
        fn new(index: usize, fleet: &Arc<Fleet>, events: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Self::slow(index, fleet, events, Duration::ZERO)
        }

        fn slow(
            index: usize,
            fleet: &Arc<Fleet>,
            events: &Arc<Mutex<Vec<String>>>,
            follower_delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Recorder {
                index,
                fleet: fleet.clone(),
                events: events.clone(),
                follower_delay,
            })
        }
    }

    #[async_trait]
    impl LeaderListener for Recorder {
        async fn on_leader(&self) {
            let now = self.fleet.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.fleet.max_concurrent.fetch_max(now, Ordering::SeqCst);
            self.events.lock().push(format!("{} leader", self.index));
        }

        async fn on_follower(&self) {
            if !self.follower_delay.is_zero() {
                tokio::time::sleep(self.follower_delay).await;
            }
            self.fleet.current.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().push(format!("{} follower", self.index));
        }
    }

    fn instances(
        coordinator: &InMemoryCoordinator,
        count: usize,
    ) -> (Vec<DistributedLockService>, Arc<Fleet>, Arc<Mutex<Vec<String>>>) {
        let config = LockConfig {
            rejoin_delay_ms: 10,
            ..LockConfig::default()
        };
        let services = (0..count)
            .map(|_| DistributedLockService::new(Arc::new(coordinator.clone()), config.clone()))
            .collect();
        (services, Arc::new(Fleet::default()), Arc::new(Mutex::new(Vec::new())))
    }

    async fn leader_of(handles: &[ElectionHandle]) -> usize {
        loop {
            if let Some(i) = handles.iter().position(|h| h.is_leader()) {
                return i;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_single_leader_among_competitors() {
        let coordinator = InMemoryCoordinator::new();
        let (services, fleet, events) = instances(&coordinator, 3);

        let handles: Vec<ElectionHandle> = services
            .iter()
            .enumerate()
            .map(|(index, service)| service.elect("sweeper", Recorder::new(index, &fleet, &events)).unwrap())
            .collect();

        let leader = leader_of(&handles).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handles.iter().filter(|h| h.is_leader()).count(), 1);
        assert_eq!(fleet.current.load(Ordering::SeqCst), 1);

        // Hand over twice through resignation
        for _ in 0..2 {
            let previous = leader_of(&handles).await;
            handles[previous].resign();
            handles[previous].wait_for(LeaderState::Follower).await;
            loop {
                let next = leader_of(&handles).await;
                if next != previous {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        assert_eq!(fleet.max_concurrent.load(Ordering::SeqCst), 1);
        assert!(events.lock().len() >= 5);
        assert!(events.lock()[0].starts_with(&leader.to_string()));

        for handle in handles {
            handle.leave().await;
        }
        assert_eq!(fleet.current.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.node_count("/work-dispatch/leaders/sweeper"), 0);
    }

    #[tokio::test]
    async fn test_session_loss_moves_leadership() {
        let coordinator = InMemoryCoordinator::new();
        let (services, fleet, events) = instances(&coordinator, 2);

        let handles: Vec<ElectionHandle> = services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                service
                    .elect("maintenance", Recorder::new(index, &fleet, &events))
                    .unwrap()
            })
            .collect();

        let leader = leader_of(&handles).await;
        let session = services[leader].session_id().await.unwrap();
        coordinator.expire(session);

        handles[leader].wait_for(LeaderState::Follower).await;
        let other = 1 - leader;
        handles[other].wait_for(LeaderState::Leader).await;
        assert!(events
            .lock()
            .contains(&format!("{} follower", leader)));

        // The old leader rejoins with a fresh session and can lead again once
        // it is queued behind the current leader
        while coordinator.node_count("/work-dispatch/leaders/maintenance") < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handles[other].resign();
        handles[leader].wait_for(LeaderState::Leader).await;
        assert!(coordinator.session_count() >= 3);

        for handle in handles {
            handle.leave().await;
        }
    }

    #[tokio::test]
    async fn test_close_ends_elections() {
        let coordinator = InMemoryCoordinator::new();
        let (services, fleet, events) = instances(&coordinator, 1);
        let handle = services[0]
            .elect("solo", Recorder::new(0, &fleet, &events))
            .unwrap();

        handle.wait_for(LeaderState::Leader).await;
        services[0].close().await;
        handle.wait_for(LeaderState::Follower).await;
        handle.leave().await;

        assert_eq!(fleet.current.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.node_count("/work-dispatch/leaders/solo"), 0);
    }

    #[tokio::test]
    async fn test_close_hands_over_only_after_stepping_down() {
        let coordinator = InMemoryCoordinator::new();
        let (services, fleet, events) = instances(&coordinator, 2);
        let handles: Vec<ElectionHandle> = services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                let listener = Recorder::slow(index, &fleet, &events, Duration::from_millis(30));
                service.elect("handover", listener).unwrap()
            })
            .collect();

        let leader = leader_of(&handles).await;
        let other = 1 - leader;
        while coordinator.node_count("/work-dispatch/leaders/handover") < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        services[leader].close().await;
        assert_eq!(handles[leader].state(), LeaderState::Follower);
        assert!(events.lock().contains(&format!("{} follower", leader)));

        handles[other].wait_for(LeaderState::Leader).await;
        assert_eq!(fleet.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(fleet.current.load(Ordering::SeqCst), 1);

        for handle in handles {
            handle.leave().await;
        }
        assert_eq!(fleet.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resign_does_not_carry_into_next_term() {
        let coordinator = InMemoryCoordinator::new();
        let (services, fleet, events) = instances(&coordinator, 1);
        let handle = services[0]
            .elect("stale", Recorder::new(0, &fleet, &events))
            .unwrap();
        handle.wait_for(LeaderState::Leader).await;

        // The term ends through session loss while a resignation is pending
        let session = services[0].session_id().await.unwrap();
        coordinator.expire(session);
        handle.resign();

        while events.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *events.lock(),
            vec!["0 leader".to_string(), "0 follower".to_string(), "0 leader".to_string()]
        );
        assert!(handle.is_leader());
        handle.leave().await;
    }

    #[test]
    fn test_invalid_election_name() {
        let coordinator = InMemoryCoordinator::new();
        let service = DistributedLockService::new(Arc::new(coordinator), LockConfig::default());
        struct Silent;
        #[async_trait]
        impl LeaderListener for Silent {
            async fn on_leader(&self) {}
            async fn on_follower(&self) {}
        }
        assert!(service.elect("", Arc::new(Silent)).is_err());
    }
}
