//! Hypervisor provider capability.
//!
//! The balancer talks to the cluster only through [`ClusterProvider`]:
//! three inventory queries, a migration call that returns an operation
//! handle, and a poll for that operation's status. Implementations must
//! tolerate concurrent calls from the executor.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Footprint, GroupKind, GuestKind, Metric, PressureReadings, Strictness};

/// Boxed future returned by every provider call.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Errors a provider can return. Each kind is distinguishable so the
/// executor can decide whether to retry.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::Conflict(_) | ProviderError::Timeout(_)
        )
    }
}

/// Node inventory entry as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default)]
    pub maintenance: bool,
    pub memory: Metric,
    pub cpu: Metric,
    #[serde(default)]
    pub storage: Metric,
    #[serde(default)]
    pub pressure: PressureReadings,
}

/// Guest inventory entry as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: GuestKind,
    pub node: String,
    #[serde(default = "default_true")]
    pub running: bool,
    pub usage: Footprint,
    pub allocation: Footprint,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default = "default_true")]
    pub migratable: bool,
    #[serde(default)]
    pub pressure: PressureReadings,
}

/// Constraint group as reported by the provider. Members are guest ids
/// for affinity groups and node ids for node-restriction groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub kind: GroupKind,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub members: Vec<String>,
    /// Guests bound by a node-restriction group.
    #[serde(default)]
    pub guests: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Flags passed through to the hypervisor's migrate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Online migration for VMs; containers are restarted on the target.
    pub live: bool,
    pub with_local_disks: bool,
    pub with_conntrack_state: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            live: true,
            with_local_disks: true,
            with_conntrack_state: true,
        }
    }
}

/// Opaque handle for an in-progress provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// The external hypervisor capability.
pub trait ClusterProvider: Send + Sync {
    fn list_nodes(&self) -> ProviderFuture<'_, Vec<NodeRecord>>;

    fn list_guests(&self) -> ProviderFuture<'_, Vec<GuestRecord>>;

    fn list_groups(&self) -> ProviderFuture<'_, Vec<GroupRecord>>;

    /// Start moving `guest` to `target`. Returns once the provider has
    /// acknowledged the request.
    fn migrate<'a>(
        &'a self,
        guest: &'a str,
        target: &'a str,
        options: &'a MigrationOptions,
    ) -> ProviderFuture<'a, OperationHandle>;

    fn poll_operation<'a>(&'a self, handle: &'a OperationHandle) -> ProviderFuture<'a, OperationStatus>;

    /// Whether one node may take part in several migrations at once.
    fn supports_parallel_node_migrations(&self) -> bool {
        false
    }
}
