//! hostlb planner — constraint resolution and greedy rebalancing.
//!
//! Given an immutable [`hostlb_core::ClusterState`], produces a
//! [`hostlb_core::MigrationPlan`]: an ordered list of guest moves that
//! lowers the spread of node loads without breaking hard placement rules.
//! Planning is pure and never touches the provider.
//!
//! # Components
//!
//! - **`scorer`** — Working load model (per-node load, deviation, headroom)
//! - **`resolver`** — Eligible targets per guest, incremental over planned moves
//! - **`engine`** — Greedy pairwise balancing loop and maintenance evacuation

pub mod engine;
pub mod error;
pub mod resolver;
pub mod scorer;

pub use engine::{BalancingEngine, EngineSettings};
pub use error::{PlanningError, PlanningResult};
pub use resolver::{ConstraintResolver, ConstraintSettings};
pub use scorer::LoadModel;
