//! Fleet-wide coordination primitives for dispatch workers.
//!
//! Two recipes run over one external coordination service: named mutual
//! exclusion ([`DistributedLockService::run_exclusively`]) and leader election
//! ([`DistributedLockService::elect`]). Both use ephemeral sequential nodes,
//! so a crashed or partitioned holder gives way once its session expires.

pub mod backend;
mod error;
mod leader;
mod memory;
mod mutex;
mod service;

pub use backend::{Coordinator, SequenceNode, Session, SessionId, SessionState};
pub use error::{CoordError, LockError, Result};
pub use leader::{ElectionHandle, LeaderListener, LeaderState};
pub use memory::InMemoryCoordinator;
pub use mutex::Exclusivity;
pub use service::{DistributedLockService, LockConfig};
