pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod memory_source;
pub mod metrics;
pub mod registry;
pub mod source;
pub mod stager;
pub mod status;
pub mod store;
pub mod trace;
pub mod unit;
pub mod units;

pub use backoff::{BackoffPolicy, FetchErrorPolicy};
pub use config::{CommandSpec, StatusConfig, SweeperConfig, UnitSpec, WorkerConfig};
pub use dispatch::{DispatchLoop, DispatchLoopBuilder, ItemReport, LoopHandle};
pub use error::{DispatchError, Result, SourceError, StageError, UnitFailure};
pub use memory_source::MemoryWorkSource;
pub use registry::CapabilityRegistry;
pub use source::{Delivery, Receipt, WorkItemSource};
pub use stager::{ResourceStager, StagedResource};
pub use status::{HttpStatusReporter, LoopState, LoopStatus, StatusReporter, StatusSnapshot};
pub use store::{Content, ElementStore, MemoryElementStore, NullElementStore, UnitFilter};
pub use trace::{NoopTracer, SpanTracer, Tracer};
pub use unit::{ProcessingUnit, Target, UnitContext, UnitInput, VerifyResults, WorkData};
