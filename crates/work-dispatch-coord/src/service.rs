use crate::backend::{Coordinator, Session, SessionId};
use crate::mutex::{wait_until_first, Exclusivity, NodeGuard};
use crate::{CoordError, LockError, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lock service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Root under which named locks live
    pub prefix: String,
    /// Root under which election groups live
    pub election_root: String,
    pub acquire_timeout_secs: u64,
    /// Pause before an election rejoins after losing its session
    pub rejoin_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            prefix: "/work-dispatch/locks".to_string(),
            election_root: "/work-dispatch/leaders".to_string(),
            acquire_timeout_secs: 30,
            rejoin_delay_ms: 1000,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }
}

pub(crate) struct Inner {
    coordinator: Arc<dyn Coordinator>,
    pub(crate) config: LockConfig,
    session: AsyncMutex<Option<Arc<dyn Session>>>,
    pub(crate) shutdown: CancellationToken,
    /// Running election tasks
    pub(crate) elections: TaskTracker,
}

/// Fleet-wide named locks and leader elections over a coordination service.
///
/// Cheap to clone; clones share one session. The session is opened lazily on
/// first use and replaced after it is lost.
#[derive(Clone)]
pub struct DistributedLockService {
    pub(crate) inner: Arc<Inner>,
}

impl DistributedLockService {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: LockConfig) -> Self {
        DistributedLockService {
            inner: Arc::new(Inner {
                coordinator,
                config,
                session: AsyncMutex::new(None),
                shutdown: CancellationToken::new(),
                elections: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    pub fn lock_path(&self, name: &str) -> Result<String> {
        join_path(&self.inner.config.prefix, name)
    }

    pub fn election_path(&self, name: &str) -> Result<String> {
        join_path(&self.inner.config.election_root, name)
    }

    /// Current session, opening a new one if there is none or the previous
    /// one was lost
    pub(crate) async fn session(&self) -> std::result::Result<Arc<dyn Session>, CoordError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoordError::Closed);
        }

        let mut current = self.inner.session.lock().await;
        if let Some(session) = current.as_ref() {
            if session.is_connected() {
                return Ok(session.clone());
            }
            warn!("Coordination session {} lost, reconnecting", session.id());
        }

        let session = self.inner.coordinator.connect().await?;
        info!("Coordination session {} established", session.id());
        *current = Some(session.clone());
        Ok(session)
    }

    /// Id of the session currently in use, if one is open
    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.session.lock().await.as_ref().map(|s| s.id())
    }

    /// Run `f` while holding the fleet-wide lock `name`.
    ///
    /// The lock is released before this returns, whether `f` completes,
    /// panics, or this future is dropped. Failing to acquire within `timeout`
    /// (the configured default when `None`) is a hard error: it usually means
    /// a stuck peer, and callers must not proceed without the lock.
    ///
    /// If the session is lost while `f` runs, `f` still completes but its
    /// result is discarded and `LockError::ExclusivityLost` is returned.
    pub async fn run_exclusively<F, Fut, T>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Exclusivity) -> Fut,
        Fut: Future<Output = T>,
    {
        let path = self.lock_path(name)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.acquire_timeout());

        let session = self.session().await?;
        let node = session.create_sequential(&path).await?;
        let mut guard = NodeGuard::new(session.clone(), &node);

        match tokio::time::timeout(timeout, wait_until_first(session.as_ref(), &path, &node)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                guard.release().await;
                return Err(e.into());
            }
            Err(_) => {
                guard.release().await;
                warn!("Timed out after {:?} waiting for lock {}", timeout, path);
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }

        debug!("Acquired lock {}", path);
        let exclusivity = Exclusivity::new(name, session.state());
        let outcome = AssertUnwindSafe(f(exclusivity.clone()))
            .catch_unwind()
            .await;
        let lost = exclusivity.is_lost();
        guard.release().await;
        debug!("Released lock {}", path);

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(_) if lost => {
                warn!("Exclusivity on lock {} was lost during the critical section", path);
                Err(LockError::ExclusivityLost {
                    name: name.to_string(),
                })
            }
            Ok(value) => Ok(value),
        }
    }

    /// Close the session, releasing every lock and leadership it holds, and
    /// stop all elections. The service refuses further use afterwards.
    ///
    /// Elections step down first: each listener's `on_follower` completes and
    /// its node is deleted before the session ends. Must not be awaited from
    /// inside a listener callback.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.elections.close();
        self.inner.elections.wait().await;

        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            match session.close().await {
                Ok(()) => info!("Closed coordination session {}", session.id()),
                Err(e) => warn!("Failed to close coordination session {}: {}", session.id(), e),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

fn join_path(root: &str, name: &str) -> Result<String> {
    let name = name.trim_matches('/');
    if name.is_empty() || name.split('/').any(|segment| segment.is_empty()) {
        return Err(LockError::InvalidName(name.to_string()));
    }
    Ok(format!("{}/{}", root.trim_end_matches('/'), name))
}
