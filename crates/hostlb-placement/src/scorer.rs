//! Working load model.
//!
//! Per-node load is the weighted mean of `consumption / total` over the
//! dimensions the balancing method selects. The model is a mutable copy of
//! the snapshot's numbers, so planned moves can be applied without touching
//! the [`ClusterState`] itself.
//!
//! Deviation is `max(load) - mean(load)` over eligible nodes (online, not
//! in maintenance, consistent, with capacity in at least one scored
//! dimension).

use std::collections::BTreeMap;

use hostlb_core::{
    BalancingMethod, BalancingMode, ClusterState, Footprint, NodeId, NodeLoad, Resource,
};

/// Slack for float comparisons on loads.
pub const LOAD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
struct NodeModel {
    totals: Footprint,
    consumed: Footprint,
    maintenance: bool,
    consistent: bool,
}

/// Mutable per-node resource accounting for one planning run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadModel {
    method: BalancingMethod,
    nodes: BTreeMap<NodeId, NodeModel>,
}

impl LoadModel {
    pub fn new(state: &ClusterState, method: BalancingMethod, mode: BalancingMode) -> Self {
        let nodes = state
            .nodes()
            .values()
            .map(|node| {
                let c = &node.capacity;
                let model = NodeModel {
                    totals: Footprint::new(c.memory.total, c.cpu.total, c.storage.total),
                    consumed: Footprint::new(
                        c.memory.consumption(mode),
                        c.cpu.consumption(mode),
                        c.storage.consumption(mode),
                    ),
                    maintenance: node.maintenance,
                    consistent: node.is_consistent(),
                };
                (node.id.clone(), model)
            })
            .collect();
        Self { method, nodes }
    }

    pub fn method(&self) -> BalancingMethod {
        self.method
    }

    fn weighted_load(&self, totals: &Footprint, consumed: &Footprint) -> f64 {
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        for resource in Resource::ALL {
            let weight = self.method.weight(resource);
            let total = totals.get(resource);
            if weight <= 0.0 || total <= 0.0 {
                continue;
            }
            sum += weight * consumed.get(resource) / total;
            weight_sum += weight;
        }
        if weight_sum > 0.0 { sum / weight_sum } else { 0.0 }
    }

    fn has_capacity(&self, node: &NodeModel) -> bool {
        self.method
            .dimensions()
            .iter()
            .any(|r| node.totals.get(*r) > 0.0)
    }

    /// Current load of `node` (0 for unknown nodes).
    pub fn load(&self, node: &str) -> f64 {
        self.nodes
            .get(node)
            .map(|n| self.weighted_load(&n.totals, &n.consumed))
            .unwrap_or(0.0)
    }

    /// Load of `node` if `delta` were added (negative amounts remove).
    pub fn load_with(&self, node: &str, delta: &Footprint) -> f64 {
        self.nodes
            .get(node)
            .map(|n| self.weighted_load(&n.totals, &n.consumed.plus(delta)))
            .unwrap_or(0.0)
    }

    /// Whether `node` takes part in balancing.
    pub fn is_eligible(&self, node: &str) -> bool {
        self.nodes
            .get(node)
            .is_some_and(|n| !n.maintenance && n.consistent && self.has_capacity(n))
    }

    pub fn is_consistent(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|n| n.consistent)
    }

    /// Eligible nodes in id order.
    pub fn eligible_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| self.is_eligible(id))
            .cloned()
            .collect()
    }

    /// Whether `footprint` fits on `node` without any scored dimension
    /// exceeding `max_fill` of its total.
    pub fn fits(&self, node: &str, footprint: &Footprint, max_fill: f64) -> bool {
        let Some(n) = self.nodes.get(node) else {
            return false;
        };
        self.method.dimensions().into_iter().all(|resource| {
            let add = footprint.get(resource);
            if add <= 0.0 {
                return true;
            }
            let total = n.totals.get(resource);
            total > 0.0 && n.consumed.get(resource) + add <= max_fill * total + LOAD_EPSILON * total
        })
    }

    /// Source-side load drop from removing `footprint`; used to compare
    /// guest sizes on one node.
    pub fn share(&self, node: &str, footprint: &Footprint) -> f64 {
        self.load(node) - self.load_with(node, &negate(footprint))
    }

    fn deviation_of(loads: impl Iterator<Item = f64>) -> f64 {
        let loads: Vec<f64> = loads.collect();
        if loads.is_empty() {
            return 0.0;
        }
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let max = loads.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        max - mean
    }

    /// `max(load) - mean(load)` over eligible nodes.
    pub fn deviation(&self) -> f64 {
        Self::deviation_of(
            self.nodes
                .keys()
                .filter(|id| self.is_eligible(id))
                .map(|id| self.load(id)),
        )
    }

    /// Deviation if `footprint` moved from `source` to `target`.
    pub fn deviation_after_move(&self, source: &str, target: &str, footprint: &Footprint) -> f64 {
        let removed = negate(footprint);
        Self::deviation_of(self.nodes.keys().filter(|id| self.is_eligible(id)).map(|id| {
            if id == source {
                self.load_with(id, &removed)
            } else if id == target {
                self.load_with(id, footprint)
            } else {
                self.load(id)
            }
        }))
    }

    /// Highest load among eligible nodes.
    pub fn max_load(&self) -> f64 {
        self.nodes
            .keys()
            .filter(|id| self.is_eligible(id))
            .map(|id| self.load(id))
            .fold(0.0, f64::max)
    }

    /// Shift `footprint` from `source` to `target`.
    pub fn apply_move(&mut self, source: &str, target: &str, footprint: &Footprint) {
        if let Some(n) = self.nodes.get_mut(source) {
            n.consumed = n.consumed.plus(&negate(footprint));
        }
        if let Some(n) = self.nodes.get_mut(target) {
            n.consumed = n.consumed.plus(footprint);
        }
    }

    /// Per-node loads in id order, for plan summaries.
    pub fn node_loads(&self) -> Vec<NodeLoad> {
        self.nodes
            .iter()
            .map(|(id, n)| NodeLoad {
                node: id.clone(),
                load: self.weighted_load(&n.totals, &n.consumed),
                maintenance: n.maintenance,
            })
            .collect()
    }
}

pub fn negate(footprint: &Footprint) -> Footprint {
    Footprint::new(-footprint.memory, -footprint.cpu, -footprint.storage)
}
