//! Constraint resolution.
//!
//! Hard rules filter candidate nodes; soft rules only count violations,
//! which the engine turns into a rank penalty. Placement is tracked
//! incrementally: once a move is recorded, later checks see the guest on
//! its planned node.

use std::collections::{BTreeMap, BTreeSet};

use hostlb_core::{
    BalancingMode, ClusterState, Footprint, GroupKind, Guest, GuestId, NodeId, Strictness,
};

use crate::scorer::LoadModel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstraintSettings {
    /// Upper utilization bound per scored dimension.
    pub max_fill: f64,
    /// Skip the headroom check entirely.
    pub overprovisioning: bool,
    pub mode: BalancingMode,
}

impl Default for ConstraintSettings {
    fn default() -> Self {
        Self {
            max_fill: 0.9,
            overprovisioning: false,
            mode: BalancingMode::Used,
        }
    }
}

/// Computes eligible targets against the snapshot plus planned moves.
#[derive(Debug)]
pub struct ConstraintResolver<'a> {
    state: &'a ClusterState,
    settings: ConstraintSettings,
    planned: BTreeMap<GuestId, NodeId>,
}

impl<'a> ConstraintResolver<'a> {
    pub fn new(state: &'a ClusterState, settings: ConstraintSettings) -> Self {
        Self {
            state,
            settings,
            planned: BTreeMap::new(),
        }
    }

    /// Node the guest runs on once recorded moves are applied.
    pub fn location<'s>(&'s self, guest: &'s Guest) -> &'s str {
        self.planned
            .get(&guest.id)
            .map(String::as_str)
            .unwrap_or(guest.node.as_str())
    }

    fn location_of(&self, guest_id: &str) -> Option<&str> {
        match self.planned.get(guest_id) {
            Some(node) => Some(node.as_str()),
            None => self.state.guest(guest_id).map(|g| g.node.as_str()),
        }
    }

    pub fn record_move(&mut self, guest: &str, target: &str) {
        self.planned.insert(guest.to_string(), target.to_string());
    }

    pub fn has_moved(&self, guest: &str) -> bool {
        self.planned.contains_key(guest)
    }

    /// Eligible targets for a single guest.
    pub fn eligible_targets(&self, guest: &'a Guest, model: &LoadModel) -> BTreeSet<NodeId> {
        self.eligible_targets_for_unit(&[guest], model)
    }

    /// Eligible targets for guests that must move together.
    ///
    /// Empty when any member is pinned, ignored, or not migratable, or when
    /// members do not share a node.
    pub fn eligible_targets_for_unit(&self, unit: &[&'a Guest], model: &LoadModel) -> BTreeSet<NodeId> {
        let Some(first) = unit.first() else {
            return BTreeSet::new();
        };
        if unit.iter().any(|g| !g.is_movable()) {
            return BTreeSet::new();
        }
        let source = self.location(*first);
        if unit.iter().any(|g| self.location(*g) != source) {
            return BTreeSet::new();
        }

        let footprint = unit
            .iter()
            .fold(Footprint::ZERO, |acc, g| acc.plus(&g.footprint(self.settings.mode)));
        let members: BTreeSet<&str> = unit.iter().map(|g| g.id.as_str()).collect();

        self.state
            .nodes()
            .keys()
            .filter(|node| node.as_str() != source && model.is_eligible(node))
            .filter(|node| unit.iter().all(|g| self.satisfies_hard_rules(g, node, &members)))
            .filter(|node| self.settings.overprovisioning || model.fits(node, &footprint, self.settings.max_fill))
            .cloned()
            .collect()
    }

    fn satisfies_hard_rules(&self, guest: &Guest, node: &str, unit: &BTreeSet<&str>) -> bool {
        for group in self.state.groups_of(guest).filter(|g| g.is_hard()) {
            let others = group
                .guests
                .iter()
                .filter(|id| id.as_str() != guest.id && !unit.contains(id.as_str()));
            let ok = match group.kind {
                GroupKind::AntiAffinity => others
                    .filter_map(|id| self.location_of(id))
                    .all(|loc| loc != node),
                GroupKind::Affinity => others
                    .filter_map(|id| self.location_of(id))
                    .all(|loc| loc == node),
                GroupKind::NodeRestriction => group.nodes.contains(node),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Soft rules the unit would break on `node`.
    pub fn soft_violations(&self, unit: &[&Guest], node: &str) -> u32 {
        let members: BTreeSet<&str> = unit.iter().map(|g| g.id.as_str()).collect();
        let mut count = 0;
        for guest in unit {
            for group in self
                .state
                .groups_of(guest)
                .filter(|g| g.strictness == Strictness::Soft)
            {
                let mut others = group
                    .guests
                    .iter()
                    .filter(|id| !members.contains(id.as_str()))
                    .filter_map(|id| self.location_of(id));
                let violated = match group.kind {
                    GroupKind::AntiAffinity => others.any(|loc| loc == node),
                    GroupKind::Affinity => others.any(|loc| loc != node),
                    GroupKind::NodeRestriction => !group.nodes.contains(node),
                };
                if violated {
                    count += 1;
                }
            }
        }
        count
    }

    /// The guest plus every co-located, not yet moved guest linked to it
    /// through hard affinity groups, in id order.
    pub fn affinity_unit(&self, guest: &'a Guest) -> Vec<&'a Guest> {
        let source = self.location(guest).to_string();
        let mut unit: BTreeMap<&str, &'a Guest> = BTreeMap::new();
        let mut queue = vec![guest];
        while let Some(current) = queue.pop() {
            if unit.insert(current.id.as_str(), current).is_some() {
                continue;
            }
            for group in self.state.groups_of(current) {
                if group.kind != GroupKind::Affinity || !group.is_hard() {
                    continue;
                }
                for peer_id in &group.guests {
                    if unit.contains_key(peer_id.as_str()) || self.has_moved(peer_id) {
                        continue;
                    }
                    if let Some(peer) = self.state.guest(peer_id) {
                        if peer.node == source {
                            queue.push(peer);
                        }
                    }
                }
            }
        }
        unit.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlb_core::{BalancingMethod, Group, GuestKind, Metric, Node, NodeCapacity, PressureReadings};

    fn node(id: &str, used: f64, maintenance: bool) -> Node {
        Node {
            id: id.to_string(),
            capacity: NodeCapacity {
                memory: Metric::new(100.0, used),
                cpu: Metric::new(8.0, 0.0),
                storage: Metric::default(),
            },
            maintenance,
            groups: BTreeSet::new(),
            guests: BTreeSet::new(),
            pressure: PressureReadings::default(),
        }
    }

    fn guest(id: &str, node: &str, mem: f64) -> Guest {
        Guest {
            id: id.to_string(),
            name: id.to_string(),
            kind: GuestKind::Vm,
            usage: Footprint::new(mem, 0.0, 0.0),
            allocation: Footprint::new(mem, 0.0, 0.0),
            node: node.to_string(),
            pinned: false,
            ignore: false,
            migratable: true,
            groups: BTreeSet::new(),
            pressure: PressureReadings::default(),
        }
    }

    fn group(id: &str, kind: GroupKind, strictness: Strictness, guests: &[&str], nodes: &[&str]) -> Group {
        Group {
            id: id.to_string(),
            kind,
            strictness,
            guests: guests.iter().map(|s| s.to_string()).collect(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(set: &BTreeSet<NodeId>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    fn setup(guests: Vec<Guest>, groups: Vec<Group>) -> ClusterState {
        ClusterState::new(
            vec![
                node("a", 80.0, false),
                node("b", 10.0, false),
                node("c", 20.0, false),
                node("m", 0.0, true),
            ],
            guests,
            groups,
            0,
        )
        .unwrap()
    }

    fn model(state: &ClusterState) -> LoadModel {
        LoadModel::new(state, BalancingMethod::Memory, BalancingMode::Used)
    }

    #[test]
    fn excludes_current_and_maintenance_nodes() {
        let state = setup(vec![guest("1", "a", 10.0)], vec![]);
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let targets = resolver.eligible_targets(state.guest("1").unwrap(), &model(&state));
        assert_eq!(ids(&targets), vec!["b", "c"]);
    }

    #[test]
    fn pinned_ignored_and_unmigratable_have_no_targets() {
        let mut pinned = guest("1", "a", 10.0);
        pinned.pinned = true;
        let mut ignored = guest("2", "a", 10.0);
        ignored.ignore = true;
        let mut fixed = guest("3", "a", 10.0);
        fixed.migratable = false;
        let state = setup(vec![pinned, ignored, fixed], vec![]);
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let m = model(&state);
        for id in ["1", "2", "3"] {
            assert!(resolver.eligible_targets(state.guest(id).unwrap(), &m).is_empty());
        }
    }

    #[test]
    fn headroom_excludes_full_nodes() {
        let state = setup(vec![guest("1", "a", 75.0)], vec![]);
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let m = model(&state);
        assert_eq!(ids(&resolver.eligible_targets(state.guest("1").unwrap(), &m)), vec!["b"]);

        let loose = ConstraintSettings {
            overprovisioning: true,
            ..ConstraintSettings::default()
        };
        let resolver = ConstraintResolver::new(&state, loose);
        assert_eq!(ids(&resolver.eligible_targets(state.guest("1").unwrap(), &m)), vec!["b", "c"]);
    }

    #[test]
    fn hard_anti_affinity_is_incremental() {
        let state = setup(
            vec![guest("1", "a", 5.0), guest("2", "a", 5.0), guest("3", "c", 5.0)],
            vec![group("db", GroupKind::AntiAffinity, Strictness::Hard, &["1", "2", "3"], &[])],
        );
        let mut resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let m = model(&state);
        let g1 = state.guest("1").unwrap();
        let g2 = state.guest("2").unwrap();

        assert_eq!(ids(&resolver.eligible_targets(g1, &m)), vec!["b"]);
        resolver.record_move("1", "b");
        assert!(resolver.eligible_targets(g2, &m).is_empty());
    }

    #[test]
    fn hard_node_restriction_limits_targets() {
        let state = setup(
            vec![guest("1", "a", 5.0)],
            vec![group("rack", GroupKind::NodeRestriction, Strictness::Hard, &["1"], &["a", "c"])],
        );
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let targets = resolver.eligible_targets(state.guest("1").unwrap(), &model(&state));
        assert_eq!(ids(&targets), vec!["c"]);
    }

    #[test]
    fn hard_affinity_moves_as_unit() {
        let state = setup(
            vec![guest("1", "a", 5.0), guest("2", "a", 5.0), guest("3", "a", 5.0)],
            vec![group("app", GroupKind::Affinity, Strictness::Hard, &["1", "2"], &[])],
        );
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let m = model(&state);
        let g1 = state.guest("1").unwrap();

        // Alone, guest 1 would split the group.
        assert!(resolver.eligible_targets(g1, &m).is_empty());

        let unit = resolver.affinity_unit(g1);
        let unit_ids: Vec<&str> = unit.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(unit_ids, vec!["1", "2"]);
        assert_eq!(ids(&resolver.eligible_targets_for_unit(&unit, &m)), vec!["b", "c"]);
    }

    #[test]
    fn soft_rules_count_violations_only() {
        let state = setup(
            vec![guest("1", "a", 5.0), guest("2", "b", 5.0)],
            vec![
                group("spread", GroupKind::AntiAffinity, Strictness::Soft, &["1", "2"], &[]),
                group("pref", GroupKind::NodeRestriction, Strictness::Soft, &["1"], &["c"]),
            ],
        );
        let resolver = ConstraintResolver::new(&state, ConstraintSettings::default());
        let g1 = state.guest("1").unwrap();

        assert_eq!(ids(&resolver.eligible_targets(g1, &model(&state))), vec!["b", "c"]);
        assert_eq!(resolver.soft_violations(&[g1], "b"), 2);
        assert_eq!(resolver.soft_violations(&[g1], "c"), 0);
    }
}
