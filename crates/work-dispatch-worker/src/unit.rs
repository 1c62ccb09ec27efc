use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use work_dispatch_coord::DistributedLockService;
use work_dispatch_core::{ElementRef, ElementStatus, PropertyRef, WorkItem};

/// What a processing unit is asked to claim: an element, or one property
/// on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub element: ElementRef,
    pub property: Option<PropertyRef>,
    pub status: ElementStatus,
}

impl Target {
    pub fn element(element: ElementRef, status: ElementStatus) -> Self {
        Target {
            element,
            property: None,
            status,
        }
    }

    pub fn property(element: ElementRef, property: PropertyRef, status: ElementStatus) -> Self {
        Target {
            element,
            property: Some(property),
            status,
        }
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.as_ref().map(|p| p.name.as_str())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{} property {}", self.element, property),
            None => write!(f, "{}", self.element),
        }
    }
}

/// Content handed to a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitInput {
    /// The target has no content
    Empty,
    /// Content read into memory
    Memory(Bytes),
    /// Content staged to a local file that lives until every claiming unit
    /// has run
    Staged(PathBuf),
}

impl UnitInput {
    pub fn path(&self) -> Option<&Path> {
        match self {
            UnitInput::Staged(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, UnitInput::Empty)
    }

    /// Whole content, whichever way it was delivered
    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        match self {
            UnitInput::Empty => Ok(Bytes::new()),
            UnitInput::Memory(bytes) => Ok(bytes.clone()),
            UnitInput::Staged(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

/// The item and target a unit is executing for
#[derive(Debug, Clone, Copy)]
pub struct WorkData<'a> {
    pub item: &'a WorkItem,
    pub target: &'a Target,
}

/// Read-only environment given to units at startup
#[derive(Clone)]
pub struct UnitContext {
    worker_id: String,
    queue: String,
    staging_dir: PathBuf,
    locks: Option<DistributedLockService>,
}

impl UnitContext {
    pub fn new(worker_id: impl Into<String>, queue: impl Into<String>, staging_dir: PathBuf) -> Self {
        UnitContext {
            worker_id: worker_id.into(),
            queue: queue.into(),
            staging_dir,
            locks: None,
        }
    }

    pub fn with_locks(mut self, locks: DistributedLockService) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Fleet-wide locks, for one-time setup that must not race other workers
    pub fn locks(&self) -> Option<&DistributedLockService> {
        self.locks.as_ref()
    }
}

/// Outcome of a unit's self-check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyResults {
    failures: Vec<String>,
}

impl VerifyResults {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut results = Self::default();
        results.add_failure(message);
        results
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

/// A pluggable capability the dispatch loop routes targets to.
///
/// Prepared once at startup, then shared across every item the loop handles.
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup; an error keeps the loop from starting
    async fn prepare(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether this unit wants `target`. Called for every target of every
    /// item, so it must be cheap and free of side effects.
    fn is_handled(&self, target: &Target) -> bool;

    /// Same as `is_handled`, for items whose element status is `DELETE`
    fn is_delete_handled(&self, _target: &Target) -> bool {
        false
    }

    /// Whether the target's content must be staged to a local file first
    fn requires_local_resource(&self) -> bool {
        false
    }

    async fn execute(&self, input: UnitInput, work: &WorkData<'_>) -> anyhow::Result<()>;

    /// Self-check surfaced to operators
    async fn verify(&self) -> VerifyResults {
        VerifyResults::ok()
    }
}
