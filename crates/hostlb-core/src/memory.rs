//! In-process simulated cluster.
//!
//! [`InMemoryProvider`] holds a JSON-loadable [`Inventory`] and applies
//! migrations to it once their operations complete. Failures can be
//! scripted per guest so that retry, timeout, and isolation behavior can
//! be exercised without a hypervisor.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InventoryError;
use crate::provider::{
    ClusterProvider, GroupRecord, GuestRecord, MigrationOptions, NodeRecord, OperationHandle,
    OperationStatus, ProviderError, ProviderFuture,
};

/// Everything the simulated provider reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub nodes: Vec<NodeRecord>,
    pub guests: Vec<GuestRecord>,
    pub groups: Vec<GroupRecord>,
}

impl Inventory {
    pub fn from_json_str(content: &str) -> Result<Self, InventoryError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, InventoryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Scripted misbehavior for one guest's migrations.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFailure {
    /// Every `migrate` call fails with this error.
    Dispatch(ProviderError),
    /// The first `n` `migrate` calls fail, later ones are accepted.
    DispatchTimes(ProviderError, u32),
    /// Accepted, then the operation reports failure.
    Operation(String),
    /// Accepted, and the operation never finishes.
    Hang,
}

#[derive(Debug)]
struct Operation {
    guest: String,
    source: String,
    target: String,
    polls_left: u32,
    outcome: OperationStatus,
    settled: bool,
}

#[derive(Debug, Default)]
struct Activity {
    /// Acknowledged, unsettled operations per node.
    active: BTreeMap<String, u32>,
    max_per_node: u32,
    active_total: u32,
    max_total: u32,
    migrate_calls: BTreeMap<String, u32>,
    completed: Vec<(String, String)>,
}

impl Activity {
    fn begin(&mut self, source: &str, target: &str) {
        for node in [source, target] {
            let count = self.active.entry(node.to_string()).or_default();
            *count += 1;
            self.max_per_node = self.max_per_node.max(*count);
        }
        self.active_total += 1;
        self.max_total = self.max_total.max(self.active_total);
    }

    fn end(&mut self, source: &str, target: &str) {
        for node in [source, target] {
            if let Some(count) = self.active.get_mut(node) {
                *count = count.saturating_sub(1);
            }
        }
        self.active_total = self.active_total.saturating_sub(1);
    }
}

/// Simulated [`ClusterProvider`] backed by an [`Inventory`].
#[derive(Debug)]
pub struct InMemoryProvider {
    inventory: Mutex<Inventory>,
    operations: Mutex<BTreeMap<String, Operation>>,
    failures: Mutex<BTreeMap<String, ScriptedFailure>>,
    activity: Mutex<Activity>,
    list_error: Mutex<Option<ProviderError>>,
    next_op: AtomicU64,
    polls_to_complete: u32,
    dispatch_delay: Duration,
    parallel_node_migrations: bool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryProvider {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            inventory: Mutex::new(inventory),
            operations: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
            activity: Mutex::new(Activity::default()),
            list_error: Mutex::new(None),
            next_op: AtomicU64::new(1),
            polls_to_complete: 1,
            dispatch_delay: Duration::ZERO,
            parallel_node_migrations: false,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, InventoryError> {
        Ok(Self::new(Inventory::from_file(path)?))
    }

    /// Number of polls an accepted operation reports `Running` before it settles.
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls;
        self
    }

    /// Time each `migrate` call takes before it is acknowledged.
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub fn with_parallel_node_migrations(mut self, enabled: bool) -> Self {
        self.parallel_node_migrations = enabled;
        self
    }

    pub fn fail_guest(&self, guest: &str, failure: ScriptedFailure) {
        lock(&self.failures).insert(guest.to_string(), failure);
    }

    /// Make every inventory query fail with `error` (`None` restores them).
    pub fn fail_listing(&self, error: Option<ProviderError>) {
        *lock(&self.list_error) = error;
    }

    /// Current inventory, reflecting completed migrations.
    pub fn inventory(&self) -> Inventory {
        lock(&self.inventory).clone()
    }

    pub fn guest_node(&self, guest: &str) -> Option<String> {
        lock(&self.inventory)
            .guests
            .iter()
            .find(|g| g.id == guest)
            .map(|g| g.node.clone())
    }

    /// How many times `migrate` was called for `guest`.
    pub fn migrate_calls(&self, guest: &str) -> u32 {
        lock(&self.activity)
            .migrate_calls
            .get(guest)
            .copied()
            .unwrap_or(0)
    }

    /// Completed migrations in completion order, as (guest, target).
    pub fn completed(&self) -> Vec<(String, String)> {
        lock(&self.activity).completed.clone()
    }

    /// Highest number of simultaneous operations touching one node.
    pub fn max_concurrent_per_node(&self) -> u32 {
        lock(&self.activity).max_per_node
    }

    /// Highest number of simultaneous operations overall.
    pub fn max_concurrent(&self) -> u32 {
        lock(&self.activity).max_total
    }

    fn listing_error(&self) -> Option<ProviderError> {
        lock(&self.list_error).clone()
    }

    fn start_migration(&self, guest: &str, target: &str) -> Result<OperationHandle, ProviderError> {
        *lock(&self.activity)
            .migrate_calls
            .entry(guest.to_string())
            .or_default() += 1;

        let scripted = {
            let mut failures = lock(&self.failures);
            match failures.get_mut(guest) {
                Some(ScriptedFailure::Dispatch(err)) => return Err(err.clone()),
                Some(ScriptedFailure::DispatchTimes(err, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(err.clone());
                }
                Some(other) => Some(other.clone()),
                None => None,
            }
        };

        let source = {
            let inventory = lock(&self.inventory);
            let record = inventory
                .guests
                .iter()
                .find(|g| g.id == guest)
                .ok_or_else(|| ProviderError::NotFound(format!("guest {guest}")))?;
            if !inventory.nodes.iter().any(|n| n.id == target) {
                return Err(ProviderError::NotFound(format!("node {target}")));
            }
            if record.node == target {
                return Err(ProviderError::Conflict(format!(
                    "guest {guest} already runs on {target}"
                )));
            }
            record.node.clone()
        };

        let mut operations = lock(&self.operations);
        if operations.values().any(|op| op.guest == guest && !op.settled) {
            return Err(ProviderError::Conflict(format!(
                "guest {guest} has a migration in progress"
            )));
        }

        let (outcome, polls_left) = match scripted {
            Some(ScriptedFailure::Operation(reason)) => {
                (OperationStatus::Failed(reason), self.polls_to_complete)
            }
            Some(ScriptedFailure::Hang) => (OperationStatus::Running, u32::MAX),
            _ => (OperationStatus::Succeeded, self.polls_to_complete),
        };

        let id = format!("op-{}", self.next_op.fetch_add(1, Ordering::Relaxed));
        operations.insert(
            id.clone(),
            Operation {
                guest: guest.to_string(),
                source: source.clone(),
                target: target.to_string(),
                polls_left,
                outcome,
                settled: false,
            },
        );
        lock(&self.activity).begin(&source, target);
        debug!(guest, source = %source, target, op = %id, "migration accepted");
        Ok(OperationHandle(id))
    }

    fn advance(&self, handle: &OperationHandle) -> Result<OperationStatus, ProviderError> {
        let mut operations = lock(&self.operations);
        let op = operations
            .get_mut(&handle.0)
            .ok_or_else(|| ProviderError::NotFound(format!("operation {handle}")))?;

        if op.settled {
            return Ok(op.outcome.clone());
        }
        if op.polls_left > 1 {
            if op.polls_left != u32::MAX {
                op.polls_left -= 1;
            }
            return Ok(OperationStatus::Running);
        }

        op.settled = true;
        lock(&self.activity).end(&op.source, &op.target);
        if op.outcome == OperationStatus::Succeeded {
            self.apply_move(&op.guest, &op.source, &op.target);
            lock(&self.activity)
                .completed
                .push((op.guest.clone(), op.target.clone()));
        }
        Ok(op.outcome.clone())
    }

    fn apply_move(&self, guest: &str, source: &str, target: &str) {
        let mut inventory = lock(&self.inventory);
        let Some(record) = inventory.guests.iter_mut().find(|g| g.id == guest) else {
            return;
        };
        record.node = target.to_string();
        let (usage, allocation) = (record.usage, record.allocation);

        for node in inventory.nodes.iter_mut() {
            let sign = if node.id == source {
                -1.0
            } else if node.id == target {
                1.0
            } else {
                continue;
            };
            node.memory.used = (node.memory.used + sign * usage.memory).max(0.0);
            node.memory.assigned = (node.memory.assigned + sign * allocation.memory).max(0.0);
            node.cpu.used = (node.cpu.used + sign * usage.cpu).max(0.0);
            node.cpu.assigned = (node.cpu.assigned + sign * allocation.cpu).max(0.0);
            node.storage.used = (node.storage.used + sign * usage.storage).max(0.0);
            node.storage.assigned = (node.storage.assigned + sign * allocation.storage).max(0.0);
        }
        debug!(guest, source, target, "migration applied");
    }
}

impl ClusterProvider for InMemoryProvider {
    fn list_nodes(&self) -> ProviderFuture<'_, Vec<NodeRecord>> {
        Box::pin(async move {
            match self.listing_error() {
                Some(err) => Err(err),
                None => Ok(lock(&self.inventory).nodes.clone()),
            }
        })
    }

    fn list_guests(&self) -> ProviderFuture<'_, Vec<GuestRecord>> {
        Box::pin(async move {
            match self.listing_error() {
                Some(err) => Err(err),
                None => Ok(lock(&self.inventory).guests.clone()),
            }
        })
    }

    fn list_groups(&self) -> ProviderFuture<'_, Vec<GroupRecord>> {
        Box::pin(async move {
            match self.listing_error() {
                Some(err) => Err(err),
                None => Ok(lock(&self.inventory).groups.clone()),
            }
        })
    }

    fn migrate<'a>(
        &'a self,
        guest: &'a str,
        target: &'a str,
        _options: &'a MigrationOptions,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            if !self.dispatch_delay.is_zero() {
                tokio::time::sleep(self.dispatch_delay).await;
            }
            self.start_migration(guest, target)
        })
    }

    fn poll_operation<'a>(&'a self, handle: &'a OperationHandle) -> ProviderFuture<'a, OperationStatus> {
        Box::pin(async move { self.advance(handle) })
    }

    fn supports_parallel_node_migrations(&self) -> bool {
        self.parallel_node_migrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Footprint, GuestKind, Metric};

    fn inventory() -> Inventory {
        let json = r#"{
            "nodes": [
                {"id": "a", "memory": {"total": 100.0, "used": 90.0}, "cpu": {"total": 8.0, "used": 2.0}},
                {"id": "b", "memory": {"total": 100.0, "used": 10.0}, "cpu": {"total": 8.0, "used": 1.0}}
            ],
            "guests": [
                {"id": "100", "name": "web", "node": "a",
                 "usage": {"memory": 20.0, "cpu": 1.0}, "allocation": {"memory": 32.0, "cpu": 2.0}}
            ]
        }"#;
        Inventory::from_json_str(json).unwrap()
    }

    async fn drive(provider: &InMemoryProvider, handle: &OperationHandle) -> OperationStatus {
        loop {
            match provider.poll_operation(handle).await.unwrap() {
                OperationStatus::Running => continue,
                status => return status,
            }
        }
    }

    #[test]
    fn inventory_parses_defaults() {
        let inv = inventory();
        assert_eq!(inv.nodes.len(), 2);
        assert!(inv.nodes[0].online);
        assert_eq!(inv.nodes[0].storage, Metric::default());
        assert_eq!(inv.guests[0].kind, GuestKind::Vm);
        assert!(inv.groups.is_empty());
    }

    #[tokio::test]
    async fn completed_migration_moves_usage() {
        let provider = InMemoryProvider::new(inventory()).with_polls_to_complete(3);
        let handle = provider
            .migrate("100", "b", &MigrationOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.poll_operation(&handle).await.unwrap(), OperationStatus::Running);
        assert_eq!(drive(&provider, &handle).await, OperationStatus::Succeeded);

        assert_eq!(provider.guest_node("100").as_deref(), Some("b"));
        let inv = provider.inventory();
        assert_eq!(inv.nodes[0].memory.used, 70.0);
        assert_eq!(inv.nodes[1].memory.used, 30.0);
        assert_eq!(inv.nodes[1].memory.assigned, 32.0);
        assert_eq!(provider.completed(), vec![("100".to_string(), "b".to_string())]);
    }

    #[tokio::test]
    async fn scripted_dispatch_failures() {
        let provider = InMemoryProvider::new(inventory());
        provider.fail_guest(
            "100",
            ScriptedFailure::DispatchTimes(ProviderError::Network("reset".into()), 1),
        );
        let opts = MigrationOptions::default();

        let first = provider.migrate("100", "b", &opts).await;
        assert_eq!(first, Err(ProviderError::Network("reset".into())));
        assert!(provider.migrate("100", "b", &opts).await.is_ok());
        assert_eq!(provider.migrate_calls("100"), 2);
    }

    #[tokio::test]
    async fn scripted_operation_failure_leaves_guest() {
        let provider = InMemoryProvider::new(inventory());
        provider.fail_guest("100", ScriptedFailure::Operation("storage busy".into()));

        let handle = provider
            .migrate("100", "b", &MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(
            drive(&provider, &handle).await,
            OperationStatus::Failed("storage busy".into())
        );
        assert_eq!(provider.guest_node("100").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn unknown_guest_and_node_are_not_found() {
        let provider = InMemoryProvider::new(inventory());
        let opts = MigrationOptions::default();
        assert!(matches!(
            provider.migrate("999", "b", &opts).await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.migrate("100", "zz", &opts).await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.migrate("100", "a", &opts).await,
            Err(ProviderError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn listing_failure_is_reported() {
        let provider = InMemoryProvider::new(inventory());
        provider.fail_listing(Some(ProviderError::Auth("ticket expired".into())));
        assert!(matches!(provider.list_nodes().await, Err(ProviderError::Auth(_))));

        provider.fail_listing(None);
        assert_eq!(provider.list_guests().await.unwrap().len(), 1);
    }

    #[test]
    fn footprint_helpers() {
        let f = Footprint::new(1.0, 2.0, 0.0).plus(&Footprint::new(1.0, 0.0, 3.0));
        assert_eq!(f, Footprint::new(2.0, 2.0, 3.0));
        assert!(Footprint::ZERO.is_zero());
    }
}
