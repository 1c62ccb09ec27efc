use thiserror::Error;
use work_dispatch_core::CoreError;

/// Errors reported by a work item source
#[derive(Error, Debug)]
pub enum SourceError {
    /// The fetch was interrupted; the loop exits without retrying
    #[error("Fetch interrupted")]
    Interrupted,

    /// The receipt does not match an outstanding delivery, either because it
    /// was already settled or because its visibility window expired
    #[error("Unknown or expired receipt: {0}")]
    UnknownReceipt(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Errors materializing content into a local file
#[derive(Error, Debug)]
pub enum StageError {
    #[error("I/O error while staging: {0}")]
    Io(#[from] std::io::Error),
}

/// One processing unit's failure on one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit: String,
    pub target: String,
    pub message: String,
    pub panicked: bool,
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.panicked {
            write!(f, "unit {} panicked on {}: {}", self.unit, self.target, self.message)
        } else {
            write!(f, "unit {} failed on {}: {}", self.unit, self.target, self.message)
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Fatal fetch failure under the fail-fast policy
    #[error("Fetch from {queue} failed: {error}")]
    Fetch { queue: String, error: SourceError },

    #[error("Dispatch interrupted")]
    Interrupted,

    #[error("Processing units failed to prepare: {}", .0.join(", "))]
    Prepare(Vec<String>),

    #[error("Invalid work item: {0}")]
    InvalidItem(#[from] CoreError),

    #[error("Element store error on {element}: {error:#}")]
    Store {
        element: String,
        error: anyhow::Error,
    },

    #[error("Staging failed for {target}: {error}")]
    Stage { target: String, error: StageError },

    #[error("{} processing unit failure(s): {}", .0.len(), join_failures(.0))]
    Units(Vec<UnitFailure>),

    #[error("Dispatch panicked: {0}")]
    Panicked(String),
}

fn join_failures(failures: &[UnitFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DispatchError {
    /// Unit failures carried by this error, if it came from unit execution
    pub fn unit_failures(&self) -> &[UnitFailure] {
        match self {
            DispatchError::Units(failures) => failures,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
