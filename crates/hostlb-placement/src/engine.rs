//! Greedy rebalancing.
//!
//! Each iteration takes the most loaded eligible node that still has an
//! improving move, scores every movable unit on it against every less
//! loaded eligible target, and applies the best move to the working
//! [`LoadModel`]. A move is accepted only if it narrows the source/target
//! gap by more than `min_improvement`, leaves the target no more loaded
//! than the source, and does not raise the cluster deviation. Planning
//! stops when the deviation is within tolerance, no move improves, or the
//! iteration cap is reached.
//!
//! In pressure mode the engine ignores the deviation target. It moves one
//! unit off each node whose pressure stall readings exceed the node limits,
//! preferring guests that are themselves under pressure, onto a node that
//! is not. Accepted moves still never raise the deviation.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tracing::{debug, info};

use hostlb_core::{
    BalancingConfig, BalancingMethod, BalancingMode, ClusterState, Footprint, Guest, MigrationAction,
    MigrationPlan, NodeId, PlanDiagnostic, PsiConfig, Resource,
};

use crate::error::PlanningResult;
use crate::resolver::{ConstraintResolver, ConstraintSettings};
use crate::scorer::{LOAD_EPSILON, LoadModel, negate};

/// Tunables for one planning run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub method: BalancingMethod,
    pub mode: BalancingMode,
    pub max_fill: f64,
    pub tolerance: f64,
    pub iteration_cap: u32,
    pub soft_penalty: f64,
    pub min_improvement: f64,
    pub trigger_threshold: Option<f64>,
    pub overprovisioning: bool,
    pub evacuate_maintenance: bool,
    pub larger_guests_first: bool,
    /// Pressure limits, used only in `BalancingMode::Psi`.
    pub psi: PsiConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            method: BalancingMethod::Memory,
            mode: BalancingMode::Used,
            max_fill: 0.9,
            tolerance: 0.05,
            iteration_cap: 64,
            soft_penalty: 0.05,
            min_improvement: 1e-6,
            trigger_threshold: None,
            overprovisioning: false,
            evacuate_maintenance: false,
            larger_guests_first: true,
            psi: PsiConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &BalancingConfig) -> PlanningResult<Self> {
        Ok(Self {
            method: config.method()?,
            mode: config.mode,
            max_fill: config.max_fill,
            tolerance: config.tolerance,
            iteration_cap: config.iteration_cap,
            soft_penalty: config.soft_penalty,
            min_improvement: config.min_improvement,
            trigger_threshold: config.trigger_threshold,
            overprovisioning: config.overprovisioning,
            evacuate_maintenance: config.evacuate_maintenance,
            larger_guests_first: config.larger_guests_first,
            psi: config.psi,
        })
    }

    pub fn constraints(&self) -> ConstraintSettings {
        ConstraintSettings {
            max_fill: self.max_fill,
            overprovisioning: self.overprovisioning,
            mode: self.mode,
        }
    }
}

/// Produces migration plans from cluster snapshots.
#[derive(Debug, Clone)]
pub struct BalancingEngine {
    settings: EngineSettings,
}

impl BalancingEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Fails with a configuration error for unknown methods or invalid weights.
    pub fn from_config(config: &BalancingConfig) -> PlanningResult<Self> {
        Ok(Self::new(EngineSettings::from_config(config)?))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Plan against `state` with a fresh resolver.
    pub fn plan(&self, state: &ClusterState) -> MigrationPlan {
        let resolver = ConstraintResolver::new(state, self.settings.constraints());
        self.plan_with(state, resolver)
    }

    /// Plan against `state`, recording moves into `resolver`.
    pub fn plan_with<'a>(&self, state: &'a ClusterState, resolver: ConstraintResolver<'a>) -> MigrationPlan {
        let settings = &self.settings;
        let model = LoadModel::new(state, settings.method, settings.mode);
        let before = model.node_loads();
        let deviation_before = model.deviation();

        let mut planner = Planner {
            state,
            settings,
            model,
            resolver,
            actions: Vec::new(),
            diagnostics: Vec::new(),
        };
        planner.run();

        let plan = MigrationPlan {
            method: settings.method,
            mode: settings.mode,
            after: planner.model.node_loads(),
            deviation_after: planner.model.deviation(),
            actions: planner.actions,
            before,
            deviation_before,
            diagnostics: planner.diagnostics,
            snapshot_timestamp: state.timestamp(),
        };
        info!(
            method = %plan.method,
            actions = plan.len(),
            deviation_before = plan.deviation_before,
            deviation_after = plan.deviation_after,
            "balancing plan computed"
        );
        for diagnostic in &plan.diagnostics {
            debug!(%diagnostic, "plan diagnostic");
        }
        plan
    }
}

/// Guests that move together, with their combined footprint and targets.
struct Unit<'a> {
    members: Vec<&'a Guest>,
    footprint: Footprint,
    targets: BTreeSet<NodeId>,
}

struct Candidate<'a> {
    members: Vec<&'a Guest>,
    footprint: Footprint,
    source: NodeId,
    target: NodeId,
    target_load: f64,
    reduction: f64,
    rank: f64,
    size: f64,
}

impl Candidate<'_> {
    fn lead(&self) -> &str {
        self.members.first().map(|g| g.id.as_str()).unwrap_or_default()
    }

    /// Higher rank, then size (per `larger_first`), then lower guest id,
    /// then the less loaded target, then target id.
    fn outranks(&self, other: &Self, larger_first: bool) -> bool {
        let by_size = if larger_first {
            self.size.total_cmp(&other.size)
        } else {
            other.size.total_cmp(&self.size)
        };
        self.rank
            .total_cmp(&other.rank)
            .then(by_size)
            .then_with(|| other.lead().cmp(self.lead()))
            .then_with(|| other.target_load.total_cmp(&self.target_load))
            .then_with(|| other.target.cmp(&self.target))
            == Ordering::Greater
    }
}

enum Search<'a> {
    Found(Candidate<'a>),
    NoTargets,
    NoImprovement,
}

struct Planner<'a, 's> {
    state: &'a ClusterState,
    settings: &'s EngineSettings,
    model: LoadModel,
    resolver: ConstraintResolver<'a>,
    actions: Vec<MigrationAction>,
    diagnostics: Vec<PlanDiagnostic>,
}

impl<'a> Planner<'a, '_> {
    fn run(&mut self) {
        if self.state.is_empty() {
            self.diagnostics.push(PlanDiagnostic::EmptyCluster);
            return;
        }
        for node in self.state.nodes().values() {
            if !node.is_consistent() {
                self.diagnostics.push(PlanDiagnostic::InconsistentNode {
                    node: node.id.clone(),
                });
            }
        }

        let eligible = self.model.eligible_nodes();
        if eligible.is_empty() {
            let detail = if self.state.nodes().values().all(|n| n.maintenance) {
                "all nodes are in maintenance".to_string()
            } else {
                "no node is available for balancing".to_string()
            };
            self.diagnostics.push(PlanDiagnostic::NoEligibleTarget { detail });
            return;
        }

        if self.settings.evacuate_maintenance {
            self.evacuate();
        }

        if eligible.len() == 1 {
            self.diagnostics.push(PlanDiagnostic::NoEligibleTarget {
                detail: format!("{} is the only node available for balancing", eligible[0]),
            });
            return;
        }

        if self.settings.mode == BalancingMode::Psi {
            self.relieve_pressure();
            return;
        }

        if let Some(threshold) = self.settings.trigger_threshold {
            let max_load = self.model.max_load();
            if max_load <= threshold {
                self.diagnostics
                    .push(PlanDiagnostic::BelowTriggerThreshold { max_load });
                return;
            }
        }

        self.rebalance();
    }

    fn rebalance(&mut self) {
        let mut iterations = 0;
        loop {
            let deviation = self.model.deviation();
            if deviation <= self.settings.tolerance {
                self.diagnostics
                    .push(PlanDiagnostic::WithinTolerance { deviation });
                return;
            }
            if iterations >= self.settings.iteration_cap {
                self.diagnostics.push(PlanDiagnostic::IterationCapReached {
                    cap: self.settings.iteration_cap,
                });
                return;
            }
            match self.best_move(deviation) {
                Search::Found(candidate) => {
                    self.apply(candidate);
                    iterations += 1;
                }
                Search::NoTargets => {
                    self.diagnostics.push(PlanDiagnostic::NoEligibleTarget {
                        detail: "no movable guest has an eligible target".to_string(),
                    });
                    return;
                }
                Search::NoImprovement => {
                    self.diagnostics.push(PlanDiagnostic::NoImprovingMove);
                    return;
                }
            }
        }
    }

    /// Movable units currently on `source`.
    fn units_on(&self, source: &str) -> Vec<Unit<'a>> {
        let state = self.state;
        let mut seen: BTreeSet<&'a str> = BTreeSet::new();
        let mut units = Vec::new();
        for guest in state.guests().values() {
            if seen.contains(guest.id.as_str())
                || !guest.is_movable()
                || self.resolver.has_moved(&guest.id)
                || self.resolver.location(guest) != source
            {
                continue;
            }
            let members = self.resolver.affinity_unit(guest);
            let mut footprint = Footprint::ZERO;
            for member in members.iter().copied() {
                seen.insert(member.id.as_str());
                footprint = footprint.plus(&member.footprint(self.settings.mode));
            }
            let targets = self.resolver.eligible_targets_for_unit(&members, &self.model);
            units.push(Unit {
                members,
                footprint,
                targets,
            });
        }
        units
    }

    fn best_move(&self, deviation: f64) -> Search<'a> {
        let mut sources = self.model.eligible_nodes();
        sources.sort_by(|a, b| {
            self.model
                .load(b)
                .total_cmp(&self.model.load(a))
                .then_with(|| a.cmp(b))
        });

        let mut any_target = false;
        for source in &sources {
            let source_load = self.model.load(source);
            let units = self.units_on(source);
            let mut best: Option<Candidate<'a>> = None;

            for unit in &units {
                any_target |= !unit.targets.is_empty();
                let removed = negate(&unit.footprint);
                let source_after = self.model.load_with(source, &removed);

                for target in &unit.targets {
                    let target_load = self.model.load(target);
                    if target_load + LOAD_EPSILON >= source_load {
                        continue;
                    }
                    let target_after = self.model.load_with(target, &unit.footprint);
                    if target_after > source_after + LOAD_EPSILON {
                        continue;
                    }
                    let reduction = (source_load - target_load) - (source_after - target_after);
                    if reduction <= self.settings.min_improvement {
                        continue;
                    }
                    let deviation_after = self.model.deviation_after_move(source, target, &unit.footprint);
                    if deviation_after > deviation + LOAD_EPSILON {
                        continue;
                    }

                    let violations = self.resolver.soft_violations(&unit.members, target);
                    let candidate = Candidate {
                        members: unit.members.clone(),
                        footprint: unit.footprint,
                        source: source.clone(),
                        target: target.clone(),
                        target_load,
                        reduction,
                        rank: reduction - self.settings.soft_penalty * f64::from(violations),
                        size: source_load - source_after,
                    };
                    let better = best
                        .as_ref()
                        .is_none_or(|b| candidate.outranks(b, self.settings.larger_guests_first));
                    if better {
                        best = Some(candidate);
                    }
                }
            }

            if let Some(candidate) = best {
                return Search::Found(candidate);
            }
        }

        if any_target {
            Search::NoImprovement
        } else {
            Search::NoTargets
        }
    }

    /// Eligible nodes reading above the node pressure limits, most loaded
    /// first.
    fn pressured_nodes(&self, dimensions: &[Resource]) -> Vec<NodeId> {
        let mut hot: Vec<NodeId> = self
            .model
            .eligible_nodes()
            .into_iter()
            .filter(|id| {
                self.state
                    .node(id)
                    .is_some_and(|n| self.settings.psi.nodes.is_hot(&n.pressure, dimensions))
            })
            .collect();
        hot.sort_by(|a, b| {
            self.model
                .load(b)
                .total_cmp(&self.model.load(a))
                .then_with(|| a.cmp(b))
        });
        hot
    }

    fn relieve_pressure(&mut self) {
        let dimensions = self.settings.method.dimensions();
        let sources = self.pressured_nodes(&dimensions);
        if sources.is_empty() {
            self.diagnostics.push(PlanDiagnostic::NoPressure);
            return;
        }
        debug!(nodes = ?sources, "nodes under pressure");

        let mut moves = 0;
        for source in &sources {
            if moves >= self.settings.iteration_cap {
                self.diagnostics.push(PlanDiagnostic::IterationCapReached {
                    cap: self.settings.iteration_cap,
                });
                return;
            }
            match self.pressure_move(source, &sources, &dimensions) {
                Some(candidate) => {
                    self.apply(candidate);
                    moves += 1;
                }
                None => self.diagnostics.push(PlanDiagnostic::NoEligibleTarget {
                    detail: format!("no movable guest on {source} has a target without pressure"),
                }),
            }
        }
    }

    /// Best unit to take off `source`: pressured guests first, then the
    /// usual size, id and target-load tie-breaks.
    fn pressure_move(&self, source: &str, pressured: &[NodeId], dimensions: &[Resource]) -> Option<Candidate<'a>> {
        let source_load = self.model.load(source);
        let deviation = self.model.deviation();
        let mut best: Option<Candidate<'a>> = None;

        for unit in self.units_on(source) {
            let hot_guest = unit
                .members
                .iter()
                .any(|g| self.settings.psi.guests.is_hot(&g.pressure, dimensions));
            let source_after = self.model.load_with(source, &negate(&unit.footprint));

            for target in unit.targets.iter().filter(|t| !pressured.contains(*t)) {
                if self.model.deviation_after_move(source, target, &unit.footprint) > deviation + LOAD_EPSILON {
                    continue;
                }
                let violations = self.resolver.soft_violations(&unit.members, target);
                let priority = if hot_guest { 1.0 } else { 0.0 };
                let candidate = Candidate {
                    members: unit.members.clone(),
                    footprint: unit.footprint,
                    source: source.to_string(),
                    target: target.clone(),
                    target_load: self.model.load(target),
                    reduction: source_load - source_after,
                    rank: priority - self.settings.soft_penalty * f64::from(violations),
                    size: source_load - source_after,
                };
                let better = best
                    .as_ref()
                    .is_none_or(|b| candidate.outranks(b, self.settings.larger_guests_first));
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn apply(&mut self, candidate: Candidate<'a>) {
        self.model
            .apply_move(&candidate.source, &candidate.target, &candidate.footprint);
        for guest in &candidate.members {
            self.resolver.record_move(&guest.id, &candidate.target);
            debug!(
                guest = %guest.id,
                source = %candidate.source,
                target = %candidate.target,
                reduction = candidate.reduction,
                "planned migration"
            );
            self.actions.push(MigrationAction::new(
                &guest.id,
                &candidate.source,
                &candidate.target,
                candidate.reduction,
            ));
        }
    }

    /// Move movable guests off maintenance nodes onto the eligible target
    /// that ends up least loaded.
    fn evacuate(&mut self) {
        let state = self.state;
        let mut unplaced: BTreeSet<&'a str> = BTreeSet::new();

        for node in state.nodes().values().filter(|n| n.maintenance) {
            for guest in state.guests_on(&node.id) {
                if !guest.is_movable()
                    || self.resolver.has_moved(&guest.id)
                    || unplaced.contains(guest.id.as_str())
                {
                    continue;
                }
                let members = self.resolver.affinity_unit(guest);
                let footprint = members
                    .iter()
                    .fold(Footprint::ZERO, |acc, g| acc.plus(&g.footprint(self.settings.mode)));
                let targets = self.resolver.eligible_targets_for_unit(&members, &self.model);
                let best = targets
                    .iter()
                    .min_by(|a, b| {
                        self.model
                            .load_with(a, &footprint)
                            .total_cmp(&self.model.load_with(b, &footprint))
                            .then_with(|| a.cmp(b))
                    })
                    .cloned();

                match best {
                    Some(target) => {
                        let share = self.model.share(&node.id, &footprint);
                        let candidate = Candidate {
                            members,
                            footprint,
                            source: node.id.clone(),
                            target_load: self.model.load(&target),
                            target,
                            reduction: share,
                            rank: share,
                            size: share,
                        };
                        self.apply(candidate);
                    }
                    None => {
                        for member in members {
                            if member.is_movable() && unplaced.insert(member.id.as_str()) {
                                self.diagnostics.push(PlanDiagnostic::UnplacedEvacuee {
                                    guest: member.id.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}
