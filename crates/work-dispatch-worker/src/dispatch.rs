use crate::backoff::FetchErrorPolicy;
use crate::config::WorkerConfig;
use crate::error::{panic_message, DispatchError, Result, SourceError, StageError, UnitFailure};
use crate::executor::UnitExecutor;
use crate::metrics::DispatchMetrics;
use crate::registry::CapabilityRegistry;
use crate::source::{Delivery, Receipt, WorkItemSource};
use crate::stager::{ResourceStager, StagedResource};
use crate::status::{LoopState, LoopStatus, StatusReporter};
use crate::store::{ElementStore, UnitFilter};
use crate::trace::{SpanTracer, Tracer};
use crate::unit::{ProcessingUnit, Target, UnitContext, UnitInput, WorkData};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use work_dispatch_coord::DistributedLockService;
use work_dispatch_core::{ElementRef, MessageId, WorkItem};

/// What happened to one item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub message_id: MessageId,
    /// Targets resolved from the item's elements
    pub targets: usize,
    /// (unit, target) pairs that ran, in order
    pub executed: Vec<(String, String)>,
    /// Elements or properties that could not be found
    pub skipped: Vec<String>,
}

/// Cloneable remote control for a running loop
#[derive(Clone)]
pub struct LoopHandle {
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
}

impl LoopHandle {
    /// Ask the loop to stop. An item already being processed finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub async fn wait_for(&self, state: LoopState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == state).await;
    }
}

/// Pulls items from a source, routes each to the units that claim it, and
/// settles it.
///
/// One item at a time; run more loops for more throughput.
pub struct DispatchLoop {
    worker_id: String,
    source: Arc<dyn WorkItemSource>,
    store: Arc<dyn ElementStore>,
    registry: CapabilityRegistry,
    stager: ResourceStager,
    executor: UnitExecutor,
    metrics: Arc<DispatchMetrics>,
    status: Arc<LoopStatus>,
    reporter: Option<Arc<dyn StatusReporter>>,
    locks: Option<DistributedLockService>,
    idle_interval: Duration,
    fetch_policy: FetchErrorPolicy,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
}

pub struct DispatchLoopBuilder {
    source: Arc<dyn WorkItemSource>,
    store: Arc<dyn ElementStore>,
    worker_id: Option<String>,
    registry: CapabilityRegistry,
    stager: ResourceStager,
    tracer: Arc<dyn Tracer>,
    reporter: Option<Arc<dyn StatusReporter>>,
    locks: Option<DistributedLockService>,
    idle_interval: Duration,
    fetch_policy: FetchErrorPolicy,
}

impl DispatchLoopBuilder {
    /// Take the idle interval, fetch policy, staging directory and worker
    /// id from `config`
    pub fn config(mut self, config: &WorkerConfig) -> Self {
        self.worker_id = Some(config.generate_worker_id());
        self.idle_interval = config.idle_interval();
        self.fetch_policy = config.fetch_error_policy.clone();
        if let Some(dir) = &config.staging_dir {
            self.stager = ResourceStager::new(dir.clone());
        }
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn stager(mut self, stager: ResourceStager) -> Self {
        self.stager = stager;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Lock service handed to units and closed when the loop exits
    pub fn lock_service(mut self, locks: DistributedLockService) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn fetch_error_policy(mut self, policy: FetchErrorPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    pub fn build(self) -> anyhow::Result<DispatchLoop> {
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| WorkerConfig::default().generate_worker_id());
        let metrics = Arc::new(DispatchMetrics::new()?);
        let units = self
            .registry
            .units()
            .map(|u| (u.name().to_string(), u.requires_local_resource()))
            .collect();
        let status = Arc::new(LoopStatus::new(
            worker_id.clone(),
            self.source.name(),
            units,
            metrics.clone(),
        ));
        let (state, _) = watch::channel(LoopState::Stopped);

        Ok(DispatchLoop {
            worker_id,
            executor: UnitExecutor::new(metrics.clone(), self.tracer),
            source: self.source,
            store: self.store,
            registry: self.registry,
            stager: self.stager,
            metrics,
            status,
            reporter: self.reporter,
            locks: self.locks,
            idle_interval: self.idle_interval,
            fetch_policy: self.fetch_policy,
            cancel: CancellationToken::new(),
            state,
        })
    }
}

impl DispatchLoop {
    pub fn builder(
        source: Arc<dyn WorkItemSource>,
        store: Arc<dyn ElementStore>,
    ) -> DispatchLoopBuilder {
        DispatchLoopBuilder {
            source,
            store,
            worker_id: None,
            registry: CapabilityRegistry::new(),
            stager: ResourceStager::temp(),
            tracer: Arc::new(SpanTracer),
            reporter: None,
            locks: None,
            idle_interval: Duration::from_millis(100),
            fetch_policy: FetchErrorPolicy::default(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn status(&self) -> Arc<LoopStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
        self.status.set_state(state);
    }

    /// Prepare every registered unit. `run` does this itself when needed.
    pub async fn prepare(&mut self) -> Result<()> {
        let mut ctx = UnitContext::new(
            self.worker_id.clone(),
            self.source.name(),
            self.stager.dir().to_path_buf(),
        );
        if let Some(locks) = &self.locks {
            ctx = ctx.with_locks(locks.clone());
        }
        self.registry.prepare_all(&ctx).await
    }

    /// Run until stopped, interrupted, or a fatal fetch error.
    ///
    /// Units are prepared first; if any fails, the loop does not start. On
    /// the way out the status reporter is shut down and the lock service's
    /// session is closed.
    pub async fn run(&mut self) -> Result<()> {
        if !self.registry.is_prepared() {
            if let Err(e) = self.prepare().await {
                error!("Refusing to start dispatch loop: {}", e);
                self.close_locks().await;
                return Err(e);
            }
        }

        info!(
            "Starting dispatch loop {} on {} with units {:?}",
            self.worker_id,
            self.source.name(),
            self.registry.names()
        );
        self.set_state(LoopState::Running);
        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.start(self.status.clone()).await {
                warn!("Status reporter failed to start: {:#}", e);
            }
        }

        let result = self.dispatch_until_stopped().await;

        self.set_state(LoopState::Stopping);
        if let Some(reporter) = &self.reporter {
            reporter.shutdown().await;
        }
        self.close_locks().await;
        self.set_state(LoopState::Stopped);

        match &result {
            Ok(()) => info!("Dispatch loop {} stopped", self.worker_id),
            Err(e) => error!("Dispatch loop {} exited: {}", self.worker_id, e),
        }
        result
    }

    async fn close_locks(&self) {
        if let Some(locks) = &self.locks {
            locks.close().await;
        }
    }

    async fn dispatch_until_stopped(&self) -> Result<()> {
        let mut fetch_failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Stop requested, leaving dispatch loop");
                return Ok(());
            }

            match self.source.next().await {
                Ok(Some(delivery)) => {
                    fetch_failures = 0;
                    self.handle_delivery(delivery).await;
                }
                Ok(None) => {
                    fetch_failures = 0;
                    if !self.pause(self.idle_interval).await {
                        return Ok(());
                    }
                }
                Err(SourceError::Interrupted) => {
                    warn!("Fetch from {} interrupted", self.source.name());
                    return Err(DispatchError::Interrupted);
                }
                Err(e) => {
                    self.metrics.fetch_errors_total.inc();
                    match &self.fetch_policy {
                        FetchErrorPolicy::FailFast => {
                            error!("Fetch from {} failed: {}", self.source.name(), e);
                            return Err(DispatchError::Fetch {
                                queue: self.source.name().to_string(),
                                error: e,
                            });
                        }
                        FetchErrorPolicy::LogAndRetry { backoff } => {
                            fetch_failures = fetch_failures.saturating_add(1);
                            let delay = backoff.delay(fetch_failures);
                            error!(
                                "Fetch from {} failed (attempt {}), retrying in {:?}: {}",
                                self.source.name(),
                                fetch_failures,
                                delay,
                                e
                            );
                            if !self.pause(delay).await {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sleep for `delay` unless a stop comes first. False when stopped.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let Delivery {
            receipt,
            message_id,
            body,
        } = delivery;
        let label = message_id.unwrap_or_else(|| "<unknown>".to_string());

        let outcome = AssertUnwindSafe(self.process(&body)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(report) => {
                debug!(
                    message_id = %report.message_id,
                    "Processed item: {} target(s), {} execution(s)",
                    report.targets,
                    report.executed.len()
                );
                self.settle(receipt, &label, true).await;
            }
            Err(e) => {
                let units: Vec<&str> = e.unit_failures().iter().map(|f| f.unit.as_str()).collect();
                error!(message_id = %label, units = ?units, "Failed to process item: {}", e);
                self.settle(receipt, &label, false).await;
            }
        }

        self.status.mark_processed(Utc::now());
    }

    async fn process(&self, body: &Bytes) -> Result<ItemReport> {
        let item = WorkItem::from_json(body)?;
        self.dispatch_one(&item).await
    }

    /// Settle a delivery. A rejection from the source is a logic error on our
    /// side or an expired delivery; it is logged and never turned into a fail.
    async fn settle(&self, receipt: Receipt, message_id: &str, ack: bool) {
        let (outcome, result) = if ack {
            ("acked", self.source.ack(receipt).await)
        } else {
            ("failed", self.source.fail(receipt).await)
        };

        match result {
            Ok(()) => self.metrics.inc_items(outcome),
            Err(e) => error!(
                message_id = %message_id,
                "Source rejected settlement as {}: {}",
                outcome,
                e
            ),
        }
    }

    /// Route one item to every claiming unit and run them.
    ///
    /// Unit failures do not stop the other units; they are collected and
    /// returned together once every target has been handled.
    pub async fn dispatch_one(&self, item: &WorkItem) -> Result<ItemReport> {
        item.validate()?;

        let mut report = ItemReport {
            message_id: item.message_id.clone(),
            ..ItemReport::default()
        };
        let mut failures = Vec::new();

        for element in item.element_refs.iter() {
            let Some(targets) = self.targets_for(&element, item, &mut report).await? else {
                continue;
            };
            report.targets += targets.len();

            let filter = self
                .store
                .unit_filter(&element)
                .await
                .map_err(|error| DispatchError::Store {
                    element: element.to_string(),
                    error,
                })?;

            for target in &targets {
                self.dispatch_target(item, target, &filter, &mut report, &mut failures)
                    .await?;
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(DispatchError::Units(failures))
        }
    }

    /// Targets for one element: the named property, or the element itself
    /// followed by each of its properties
    async fn targets_for(
        &self,
        element: &ElementRef,
        item: &WorkItem,
        report: &mut ItemReport,
    ) -> Result<Option<Vec<Target>>> {
        let properties = self
            .store
            .properties(element, item)
            .await
            .map_err(|error| DispatchError::Store {
                element: element.to_string(),
                error,
            })?;

        let Some(properties) = properties else {
            warn!(message_id = %item.message_id, "Could not find {}", element);
            report.skipped.push(element.to_string());
            return Ok(None);
        };

        let targets = match item.property_ref() {
            None => std::iter::once(Target::element(element.clone(), item.status))
                .chain(
                    properties
                        .into_iter()
                        .map(|p| Target::property(element.clone(), p, item.status)),
                )
                .collect(),
            Some(wanted) => {
                let found = properties.into_iter().find(|p| {
                    p.name == wanted.name && (wanted.key.is_none() || p.key == wanted.key)
                });
                match found {
                    Some(property) => vec![Target::property(element.clone(), property, item.status)],
                    None => {
                        error!(
                            message_id = %item.message_id,
                            "Could not find property {} on {}", wanted, element
                        );
                        report.skipped.push(format!("{} property {}", element, wanted));
                        Vec::new()
                    }
                }
            }
        };
        Ok(Some(targets))
    }

    async fn dispatch_target(
        &self,
        item: &WorkItem,
        target: &Target,
        filter: &UnitFilter,
        report: &mut ItemReport,
        failures: &mut Vec<UnitFailure>,
    ) -> Result<()> {
        let claimants = self.registry.claimants(target, filter);
        if claimants.is_empty() {
            debug!(message_id = %item.message_id, "No processing unit claims {}", target);
            return Ok(());
        }

        let (input, staged) = self.input_for(target, &claimants).await?;
        let work = WorkData { item, target };

        for unit in claimants {
            match self.executor.execute(unit, input.clone(), &work).await {
                Ok(()) => report
                    .executed
                    .push((unit.name().to_string(), target.to_string())),
                Err(failure) => failures.push(failure),
            }
        }

        if let Some(staged) = staged {
            staged.close();
        }
        Ok(())
    }

    /// Open the target's content, staging it locally if any claimant needs
    /// a file
    async fn input_for(
        &self,
        target: &Target,
        claimants: &[&dyn ProcessingUnit],
    ) -> Result<(UnitInput, Option<StagedResource>)> {
        let Some(property) = &target.property else {
            return Ok((UnitInput::Empty, None));
        };

        let content = self
            .store
            .open_content(&target.element, property)
            .await
            .map_err(|error| DispatchError::Store {
                element: target.element.to_string(),
                error,
            })?;
        let Some(mut content) = content else {
            return Ok((UnitInput::Empty, None));
        };

        let stage_error = |error: StageError| DispatchError::Stage {
            target: target.to_string(),
            error,
        };

        if claimants.iter().any(|u| u.requires_local_resource()) {
            let staged = self.stager.materialize(content).await.map_err(stage_error)?;
            let input = UnitInput::Staged(staged.path().to_path_buf());
            Ok((input, Some(staged)))
        } else {
            let mut buffer = Vec::new();
            content
                .reader
                .read_to_end(&mut buffer)
                .await
                .map_err(|e| stage_error(e.into()))?;
            Ok((UnitInput::Memory(Bytes::from(buffer)), None))
        }
    }
}
