//! hostlb-core — shared model for the hostlb cluster balancer.
//!
//! # Components
//!
//! - **`types`** — Immutable cluster snapshot, migration plan, and ids
//! - **`config`** — `hostlb.toml` parsing and validation
//! - **`provider`** — The `ClusterProvider` capability consumed by the
//!   collector and the executor
//! - **`memory`** — An in-process simulated cluster implementing the provider

pub mod config;
pub mod duration;
pub mod error;
pub mod memory;
pub mod provider;
pub mod types;

pub use config::{
    BalancerConfig, BalancingConfig, ClusterConfig, ExecutionConfig, NodeReserve, PressureLimits,
    PressureThresholds, PsiConfig, ServiceConfig,
};
pub use error::{ConfigurationError, InventoryError, StateError};
pub use memory::{InMemoryProvider, Inventory, ScriptedFailure};
pub use provider::{
    ClusterProvider, GroupRecord, GuestRecord, MigrationOptions, NodeRecord, OperationHandle,
    OperationStatus, ProviderError, ProviderFuture,
};
pub use types::*;
