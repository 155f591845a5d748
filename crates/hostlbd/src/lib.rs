//! hostlbd — runs balancing cycles against a cluster.
//!
//! A cycle collects a snapshot, plans against it, and executes the plan
//! (or only reports it, in dry-run mode). Cycles never overlap.
//!
//! # Components
//!
//! - **`cycle`** — `Balancer`: the in-flight guard, `run_cycle`, and the scheduled service loop
//! - **`error`** — Cycle-level error taxonomy
//! - **`logging`** — tracing subscriber setup

pub mod cycle;
pub mod error;
pub mod logging;

pub use cycle::{Balancer, CycleGuard, CycleSummary};
pub use error::{CycleError, CycleResult};
pub use logging::LogFormat;
