//! Shared types used across hostlb crates.
//!
//! A [`ClusterState`] is an immutable snapshot built once per balancing
//! cycle. [`MigrationPlan`] and the executor's report refer to nodes and
//! guests by id only, so they outlive the snapshot they were computed from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, StateError};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a guest (VM or container).
pub type GuestId = String;

/// Unique identifier for a constraint group.
pub type GroupId = String;

// ── Resources ──────────────────────────────────────────────────────

/// A resource dimension that can drive balancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Memory,
    Cpu,
    Storage,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Memory, Resource::Cpu, Resource::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Memory => "memory",
            Resource::Cpu => "cpu",
            Resource::Storage => "storage",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-shape resource amounts: bytes of memory, CPU cores, bytes of storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Footprint {
    pub memory: f64,
    pub cpu: f64,
    pub storage: f64,
}

impl Footprint {
    pub const ZERO: Footprint = Footprint {
        memory: 0.0,
        cpu: 0.0,
        storage: 0.0,
    };

    pub fn new(memory: f64, cpu: f64, storage: f64) -> Self {
        Self {
            memory,
            cpu,
            storage,
        }
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Memory => self.memory,
            Resource::Cpu => self.cpu,
            Resource::Storage => self.storage,
        }
    }

    pub fn is_zero(&self) -> bool {
        Resource::ALL.iter().all(|r| self.get(*r) == 0.0)
    }

    /// Component-wise sum.
    pub fn plus(&self, other: &Footprint) -> Footprint {
        Footprint {
            memory: self.memory + other.memory,
            cpu: self.cpu + other.cpu,
            storage: self.storage + other.storage,
        }
    }
}

/// Capacity and consumption of one resource dimension on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub total: f64,
    pub used: f64,
    /// Sum of configured allocations of the guests hosted on the node.
    #[serde(default)]
    pub assigned: f64,
}

impl Metric {
    pub fn new(total: f64, used: f64) -> Self {
        Self {
            total,
            used,
            assigned: 0.0,
        }
    }

    pub fn free(&self) -> f64 {
        (self.total - self.used).max(0.0)
    }

    /// `used <= total`, with both values finite and non-negative.
    pub fn is_consistent(&self) -> bool {
        self.total.is_finite()
            && self.used.is_finite()
            && self.total >= 0.0
            && self.used >= 0.0
            && self.used <= self.total
    }

    /// Consumption under `mode`: observed usage or summed allocations.
    /// Pressure mode accounts capacity by observed usage.
    pub fn consumption(&self, mode: BalancingMode) -> f64 {
        match mode {
            BalancingMode::Used | BalancingMode::Psi => self.used,
            BalancingMode::Assigned => self.assigned,
        }
    }
}

/// Per-dimension capacity of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub memory: Metric,
    pub cpu: Metric,
    pub storage: Metric,
}

impl NodeCapacity {
    pub fn get(&self, resource: Resource) -> &Metric {
        match resource {
            Resource::Memory => &self.memory,
            Resource::Cpu => &self.cpu,
            Resource::Storage => &self.storage,
        }
    }

    pub fn get_mut(&mut self, resource: Resource) -> &mut Metric {
        match resource {
            Resource::Memory => &mut self.memory,
            Resource::Cpu => &mut self.cpu,
            Resource::Storage => &mut self.storage,
        }
    }
}

/// Pressure stall readings for one resource, in percent of time stalled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pressure {
    /// Some tasks stalled (average).
    pub some: f64,
    /// All tasks stalled (average).
    pub full: f64,
    /// Recent peak of `full`.
    pub spikes: f64,
}

/// Pressure readings per resource dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureReadings {
    pub memory: Pressure,
    pub cpu: Pressure,
    #[serde(alias = "disk")]
    pub storage: Pressure,
}

impl PressureReadings {
    pub fn get(&self, resource: Resource) -> &Pressure {
        match resource {
            Resource::Memory => &self.memory,
            Resource::Cpu => &self.cpu,
            Resource::Storage => &self.storage,
        }
    }
}

// ── Nodes, guests, groups ──────────────────────────────────────────

/// A cluster host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub capacity: NodeCapacity,
    pub maintenance: bool,
    /// Node-restriction groups naming this node.
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    /// Guests currently hosted.
    #[serde(default)]
    pub guests: BTreeSet<GuestId>,
    #[serde(default)]
    pub pressure: PressureReadings,
}

impl Node {
    /// Every dimension satisfies `used <= total`. Inconsistent nodes are
    /// excluded from planning.
    pub fn is_consistent(&self) -> bool {
        Resource::ALL
            .iter()
            .all(|r| self.capacity.get(*r).is_consistent())
    }
}

/// Workload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    #[default]
    Vm,
    Container,
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestKind::Vm => f.write_str("vm"),
            GuestKind::Container => f.write_str("container"),
        }
    }
}

/// A VM or container running on exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub id: GuestId,
    pub name: String,
    pub kind: GuestKind,
    /// Observed consumption.
    pub usage: Footprint,
    /// Configured maxima.
    pub allocation: Footprint,
    pub node: NodeId,
    /// Never moves.
    pub pinned: bool,
    /// Excluded from accounting and movement.
    pub ignore: bool,
    /// Guest-level support for migration.
    pub migratable: bool,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    #[serde(default)]
    pub pressure: PressureReadings,
}

impl Guest {
    /// Resource amounts this guest contributes under `mode`.
    pub fn footprint(&self, mode: BalancingMode) -> Footprint {
        match mode {
            BalancingMode::Used | BalancingMode::Psi => self.usage,
            BalancingMode::Assigned => self.allocation,
        }
    }

    pub fn is_movable(&self) -> bool {
        !self.pinned && !self.ignore && self.migratable
    }
}

/// Constraint group kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    /// Member guests must share a node.
    Affinity,
    /// Member guests must not share a node.
    AntiAffinity,
    /// Member guests may only run on the group's nodes.
    NodeRestriction,
}

/// Whether a group filters candidates or only penalizes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    #[default]
    Hard,
    Soft,
}

/// An operator-defined constraint group.
///
/// Guest membership is recorded on [`Guest::groups`]; for node-restriction
/// groups the allowed nodes are recorded in `nodes` (and on [`Node::groups`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub kind: GroupKind,
    pub strictness: Strictness,
    #[serde(default)]
    pub guests: BTreeSet<GuestId>,
    #[serde(default)]
    pub nodes: BTreeSet<NodeId>,
}

impl Group {
    pub fn is_hard(&self) -> bool {
        self.strictness == Strictness::Hard
    }
}

// ── Cluster snapshot ───────────────────────────────────────────────

/// Immutable snapshot of the cluster for one balancing cycle.
///
/// Deserialization goes through [`ClusterState::new`], so a decoded
/// snapshot holds the same invariants as a collected one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotRecord")]
pub struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
    guests: BTreeMap<GuestId, Guest>,
    groups: BTreeMap<GroupId, Group>,
    /// Unix timestamp (seconds) at which the snapshot was taken.
    timestamp: u64,
}

/// Serialized shape of a [`ClusterState`].
#[derive(Deserialize)]
struct SnapshotRecord {
    #[serde(default)]
    nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    guests: BTreeMap<GuestId, Guest>,
    #[serde(default)]
    groups: BTreeMap<GroupId, Group>,
    #[serde(default)]
    timestamp: u64,
}

fn keyed_values<T>(
    kind: &'static str,
    map: BTreeMap<String, T>,
    id: impl Fn(&T) -> &str,
) -> Result<Vec<T>, StateError> {
    map.into_iter()
        .map(|(key, value)| {
            if key == id(&value) {
                Ok(value)
            } else {
                Err(StateError::MismatchedKey {
                    kind,
                    id: id(&value).to_string(),
                    key,
                })
            }
        })
        .collect()
}

impl TryFrom<SnapshotRecord> for ClusterState {
    type Error = StateError;

    fn try_from(record: SnapshotRecord) -> Result<Self, Self::Error> {
        Self::new(
            keyed_values("node", record.nodes, |n: &Node| n.id.as_str())?,
            keyed_values("guest", record.guests, |g: &Guest| g.id.as_str())?,
            keyed_values("group", record.groups, |g: &Group| g.id.as_str())?,
            record.timestamp,
        )
    }
}

impl ClusterState {
    /// Build a snapshot, checking the structural invariants: every guest
    /// runs on a known node, node guest lists agree with guest placement,
    /// and group members exist.
    pub fn new(
        nodes: Vec<Node>,
        guests: Vec<Guest>,
        groups: Vec<Group>,
        timestamp: u64,
    ) -> Result<Self, StateError> {
        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.contains_key(&node.id) {
                return Err(StateError::Duplicate {
                    kind: "node",
                    id: node.id,
                });
            }
            node_map.insert(node.id.clone(), node);
        }

        let mut guest_map = BTreeMap::new();
        for guest in guests {
            if guest_map.contains_key(&guest.id) {
                return Err(StateError::Duplicate {
                    kind: "guest",
                    id: guest.id,
                });
            }
            if !node_map.contains_key(&guest.node) {
                return Err(StateError::UnknownNode {
                    guest: guest.id,
                    node: guest.node,
                });
            }
            guest_map.insert(guest.id.clone(), guest);
        }

        for node in node_map.values() {
            for guest_id in &node.guests {
                match guest_map.get(guest_id) {
                    Some(g) if g.node != node.id => {
                        return Err(StateError::MisplacedGuest {
                            guest: guest_id.clone(),
                            node: g.node.clone(),
                            listed_on: node.id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        return Err(StateError::UnknownGroupMember {
                            group: format!("node:{}", node.id),
                            member: guest_id.clone(),
                        });
                    }
                }
            }
        }
        // Node guest lists are derived from placement so callers may leave them empty.
        for guest in guest_map.values() {
            if let Some(node) = node_map.get_mut(&guest.node) {
                node.guests.insert(guest.id.clone());
            }
        }

        let mut group_map = BTreeMap::new();
        for group in groups {
            if group_map.contains_key(&group.id) {
                return Err(StateError::Duplicate {
                    kind: "group",
                    id: group.id,
                });
            }
            for member in &group.guests {
                if !guest_map.contains_key(member) {
                    return Err(StateError::UnknownGroupMember {
                        group: group.id.clone(),
                        member: member.clone(),
                    });
                }
            }
            for member in &group.nodes {
                if !node_map.contains_key(member) {
                    return Err(StateError::UnknownGroupMember {
                        group: group.id.clone(),
                        member: member.clone(),
                    });
                }
            }
            group_map.insert(group.id.clone(), group);
        }

        // Mirror group membership onto guests and nodes.
        for group in group_map.values() {
            for member in &group.guests {
                if let Some(guest) = guest_map.get_mut(member) {
                    guest.groups.insert(group.id.clone());
                }
            }
            for member in &group.nodes {
                if let Some(node) = node_map.get_mut(member) {
                    node.groups.insert(group.id.clone());
                }
            }
        }
        for guest in guest_map.values() {
            for group_id in &guest.groups {
                if !group_map.contains_key(group_id) {
                    return Err(StateError::UnknownGroupMember {
                        group: group_id.clone(),
                        member: guest.id.clone(),
                    });
                }
            }
        }
        for (group_id, group) in group_map.iter_mut() {
            for guest in guest_map.values() {
                if guest.groups.contains(group_id) {
                    group.guests.insert(guest.id.clone());
                }
            }
        }

        Ok(Self {
            nodes: node_map,
            guests: guest_map,
            groups: group_map,
            timestamp,
        })
    }

    pub fn empty(timestamp: u64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            guests: BTreeMap::new(),
            groups: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    pub fn guests(&self) -> &BTreeMap<GuestId, Guest> {
        &self.guests
    }

    pub fn groups(&self) -> &BTreeMap<GroupId, Group> {
        &self.groups
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn guest(&self, id: &str) -> Option<&Guest> {
        self.guests.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Guests hosted on `node`, in id order.
    pub fn guests_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Guest> + 'a {
        self.guests.values().filter(move |g| g.node == node)
    }

    /// Groups the guest belongs to.
    pub fn groups_of<'a>(&'a self, guest: &'a Guest) -> impl Iterator<Item = &'a Group> + 'a {
        guest.groups.iter().filter_map(|id| self.groups.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Balancing method ───────────────────────────────────────────────

/// Whether node load is taken from observed usage or from allocations.
///
/// `Psi` accounts like `Used` but only moves guests off nodes whose
/// pressure stall readings exceed the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalancingMode {
    #[default]
    Used,
    Assigned,
    Psi,
}

/// Relative weights of the dimensions in a combined method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub memory: f64,
    pub cpu: f64,
    pub storage: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            memory: 1.0,
            cpu: 1.0,
            storage: 0.0,
        }
    }
}

/// Resource dimension(s) used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BalancingMethod {
    Memory,
    Cpu,
    Storage,
    Weighted(Weights),
}

impl BalancingMethod {
    /// Parse a method name; `weighted` uses the given weights.
    pub fn parse(name: &str, weights: Weights) -> Result<Self, ConfigurationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BalancingMethod::Memory),
            "cpu" => Ok(BalancingMethod::Cpu),
            "storage" | "disk" => Ok(BalancingMethod::Storage),
            "weighted" => BalancingMethod::Weighted(weights).validated(),
            other => Err(ConfigurationError::UnknownMethod(other.to_string())),
        }
    }

    /// Weight of `resource` in this method (0 when unused).
    pub fn weight(&self, resource: Resource) -> f64 {
        match (self, resource) {
            (BalancingMethod::Memory, Resource::Memory)
            | (BalancingMethod::Cpu, Resource::Cpu)
            | (BalancingMethod::Storage, Resource::Storage) => 1.0,
            (BalancingMethod::Weighted(w), Resource::Memory) => w.memory.max(0.0),
            (BalancingMethod::Weighted(w), Resource::Cpu) => w.cpu.max(0.0),
            (BalancingMethod::Weighted(w), Resource::Storage) => w.storage.max(0.0),
            _ => 0.0,
        }
    }

    /// Dimensions with a positive weight.
    pub fn dimensions(&self) -> Vec<Resource> {
        Resource::ALL
            .into_iter()
            .filter(|r| self.weight(*r) > 0.0)
            .collect()
    }

    /// Reject weighted methods without a positive weight.
    pub fn validated(self) -> Result<Self, ConfigurationError> {
        if let BalancingMethod::Weighted(w) = self {
            let finite = w.memory.is_finite() && w.cpu.is_finite() && w.storage.is_finite();
            if !finite || self.dimensions().is_empty() {
                return Err(ConfigurationError::InvalidWeights {
                    memory: w.memory,
                    cpu: w.cpu,
                    storage: w.storage,
                });
            }
        }
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BalancingMethod::Memory => "memory",
            BalancingMethod::Cpu => "cpu",
            BalancingMethod::Storage => "storage",
            BalancingMethod::Weighted(_) => "weighted",
        }
    }
}

impl FromStr for BalancingMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BalancingMethod::parse(s, Weights::default())
    }
}

impl fmt::Display for BalancingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancingMethod::Weighted(w) => write!(
                f,
                "weighted(memory={}, cpu={}, storage={})",
                w.memory, w.cpu, w.storage
            ),
            other => f.write_str(other.name()),
        }
    }
}

// ── Plan ───────────────────────────────────────────────────────────

/// Lifecycle of a single migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Skipped
        )
    }
}

/// One planned guest move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationAction {
    pub guest: GuestId,
    pub source: NodeId,
    pub target: NodeId,
    /// Predicted reduction of the source/target load gap.
    pub score_delta: f64,
    pub status: ActionStatus,
}

impl MigrationAction {
    pub fn new(guest: &str, source: &str, target: &str, score_delta: f64) -> Self {
        Self {
            guest: guest.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            score_delta,
            status: ActionStatus::Pending,
        }
    }
}

/// Load of one node under the plan's method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub node: NodeId,
    /// Fraction of capacity in use (0.0..=1.0 for consistent nodes).
    pub load: f64,
    pub maintenance: bool,
}

/// Why a plan is empty, partial, or stopped where it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanDiagnostic {
    EmptyCluster,
    NoEligibleTarget { detail: String },
    InconsistentNode { node: NodeId },
    WithinTolerance { deviation: f64 },
    BelowTriggerThreshold { max_load: f64 },
    NoImprovingMove,
    IterationCapReached { cap: u32 },
    UnplacedEvacuee { guest: GuestId },
    NoPressure,
}

impl fmt::Display for PlanDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanDiagnostic::EmptyCluster => f.write_str("empty cluster"),
            PlanDiagnostic::NoEligibleTarget { detail } => {
                write!(f, "no eligible target: {detail}")
            }
            PlanDiagnostic::InconsistentNode { node } => {
                write!(f, "node {node} reports usage above capacity; excluded from planning")
            }
            PlanDiagnostic::WithinTolerance { deviation } => {
                write!(f, "deviation {:.2}% is within tolerance", deviation * 100.0)
            }
            PlanDiagnostic::BelowTriggerThreshold { max_load } => write!(
                f,
                "highest load {:.2}% is below the trigger threshold",
                max_load * 100.0
            ),
            PlanDiagnostic::NoImprovingMove => f.write_str("no improving move left"),
            PlanDiagnostic::IterationCapReached { cap } => {
                write!(f, "iteration cap of {cap} reached")
            }
            PlanDiagnostic::UnplacedEvacuee { guest } => {
                write!(f, "guest {guest} could not be evacuated from its maintenance node")
            }
            PlanDiagnostic::NoPressure => f.write_str("no node is under pressure"),
        }
    }
}

/// Ordered migrations plus before/after load summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub method: BalancingMethod,
    pub mode: BalancingMode,
    pub actions: Vec<MigrationAction>,
    pub before: Vec<NodeLoad>,
    pub after: Vec<NodeLoad>,
    pub deviation_before: f64,
    pub deviation_after: f64,
    pub diagnostics: Vec<PlanDiagnostic>,
    /// Timestamp of the snapshot this plan was computed from.
    pub snapshot_timestamp: u64,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether any diagnostic renders text containing `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.to_string().contains(needle))
    }
}
