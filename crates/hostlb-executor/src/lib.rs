//! hostlb-executor — drives a migration plan against the provider.
//!
//! Every [`hostlb_core::MigrationAction`] runs through its own state
//! machine (`Pending → Dispatched → Succeeded | Failed`, or `Skipped`).
//! Failures stay local to their action: the executor always returns a full
//! [`ExecutionReport`].
//!
//! # Components
//!
//! - **`executor`** — `PlanExecutor::execute`: scheduling, cycle timeout, settlement
//! - **`tracker`** — Per-action state machine and retry policy
//! - **`pool`** — Bounded provider checkout
//! - **`queue`** — Plan-order tickets for actions sharing a guest or node
//! - **`report`** — Serializable execution outcome

pub mod error;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod report;
pub mod tracker;

pub use error::ExecutionFailure;
pub use executor::{ExecutorSettings, PlanExecutor};
pub use pool::{ProviderLease, ProviderPool};
pub use queue::{ConflictQueue, Ticket};
pub use report::{ActionOutcome, ExecutionReport};
pub use tracker::{ActionTracker, RetryPolicy};
