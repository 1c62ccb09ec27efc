use crate::config::StatusConfig;
use crate::metrics::DispatchMetrics;
use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Lifecycle of a dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub requires_local_resource: bool,
    pub processed: u64,
    pub errors: u64,
    pub processing: i64,
}

/// Point-in-time view of a loop, as served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub worker_id: String,
    pub hostname: String,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub state: LoopState,
    pub items_acked: u64,
    pub items_failed: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub units: Vec<UnitStatus>,
}

/// Live status shared between a dispatch loop and its reporter
pub struct LoopStatus {
    worker_id: String,
    hostname: String,
    queue: String,
    started_at: DateTime<Utc>,
    units: Vec<(String, bool)>,
    state: RwLock<LoopState>,
    last_processed: RwLock<Option<DateTime<Utc>>>,
    metrics: Arc<DispatchMetrics>,
}

impl LoopStatus {
    pub fn new(
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        units: Vec<(String, bool)>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        LoopStatus {
            worker_id: worker_id.into(),
            hostname,
            queue: queue.into(),
            started_at: Utc::now(),
            units,
            state: RwLock::new(LoopState::Stopped),
            last_processed: RwLock::new(None),
            metrics,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: LoopState) {
        *self.state.write() = state;
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        *self.last_processed.read()
    }

    pub(crate) fn mark_processed(&self, at: DateTime<Utc>) {
        *self.last_processed.write() = Some(at);
        self.metrics.last_processed_timestamp.set(at.timestamp());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let units = self
            .units
            .iter()
            .map(|(name, requires_local_resource)| {
                let (processed, errors, processing) = self.metrics.unit_counts(name);
                UnitStatus {
                    name: name.clone(),
                    requires_local_resource: *requires_local_resource,
                    processed,
                    errors,
                    processing,
                }
            })
            .collect();

        StatusSnapshot {
            worker_id: self.worker_id.clone(),
            hostname: self.hostname.clone(),
            queue: self.queue.clone(),
            started_at: self.started_at,
            state: self.state(),
            items_acked: self.metrics.items("acked"),
            items_failed: self.metrics.items("failed"),
            last_processed_at: self.last_processed(),
            units,
        }
    }
}

/// Publishes a loop's status for operators.
///
/// A reporter that fails to start is logged and ignored; dispatch goes on.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn start(&self, status: Arc<LoopStatus>) -> anyhow::Result<()>;

    async fn shutdown(&self);
}

/// Serves `/status` and `/metrics` over HTTP on the first free port of a range
pub struct HttpStatusReporter {
    host: IpAddr,
    ports: (u16, u16),
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpStatusReporter {
    pub fn new(config: &StatusConfig) -> anyhow::Result<Self> {
        Ok(HttpStatusReporter {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: config.ports()?,
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn bind(&self) -> anyhow::Result<TcpListener> {
        let (start, end) = self.ports;
        let mut last_error = None;

        for port in start..=end {
            match TcpListener::bind((self.host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!("Status port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => anyhow!("no free status port in {}-{}: {}", start, end, e),
            None => anyhow!("no free status port in {}-{}", start, end),
        })
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn start(&self, status: Arc<LoopStatus>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        let app = create_status_api(status);
        let shutdown = self.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Status server failed: {}", e);
            }
        });
        *self.server.lock() = Some(server);

        info!("Status server listening on {}", addr);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        let server = self.server.lock().take();
        if let Some(server) = server {
            if let Err(e) = server.await {
                error!("Status server task ended abnormally: {}", e);
            }
            info!("Status server stopped");
        }
    }
}

/// Status routes
pub fn create_status_api(status: Arc<LoopStatus>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .with_state(status)
}

async fn get_status(State(status): State<Arc<LoopStatus>>) -> Json<StatusSnapshot> {
    Json(status.snapshot())
}

async fn get_metrics(State(status): State<Arc<LoopStatus>>) -> Response {
    match status.metrics().render() {
        Ok(text) => text.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
