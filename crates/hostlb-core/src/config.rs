//! hostlb.toml configuration.
//!
//! Every section and key is optional; missing values take the defaults
//! below. Durations are humanized strings ("5s", "30m", "12h").

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::config_duration;
use crate::error::ConfigurationError;
use crate::types::{
    BalancingMethod, BalancingMode, Footprint, GuestKind, NodeId, Pressure, PressureReadings, Resource,
    Weights,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub cluster: ClusterConfig,
    pub balancing: BalancingConfig,
    pub execution: ExecutionConfig,
    pub service: ServiceConfig,
}

/// Which parts of the inventory take part in balancing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes left out of the snapshot entirely.
    pub ignore_nodes: BTreeSet<NodeId>,
    /// Nodes treated as in maintenance regardless of provider state.
    pub maintenance_nodes: BTreeSet<NodeId>,
    /// Guest names never moved. A trailing `*` matches by prefix.
    pub ignore_guests: Vec<String>,
}

impl ClusterConfig {
    pub fn ignores_guest(&self, name: &str) -> bool {
        self.ignore_guests.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        })
    }
}

/// Per-node capacity withheld from planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeReserve {
    pub defaults: Footprint,
    pub nodes: BTreeMap<NodeId, Footprint>,
}

impl NodeReserve {
    pub fn for_node(&self, node: &str) -> Footprint {
        self.nodes.get(node).copied().unwrap_or(self.defaults)
    }
}

/// Pressure stall limits for one resource, in percent. A reading above
/// any of the three marks the resource as under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub pressure_full: f64,
    pub pressure_some: f64,
    pub pressure_spikes: f64,
}

impl PressureThresholds {
    pub fn exceeded_by(&self, reading: &Pressure) -> bool {
        reading.full > self.pressure_full
            || reading.some > self.pressure_some
            || reading.spikes > self.pressure_spikes
    }
}

/// Thresholds per resource. Resources without thresholds never count as
/// under pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureLimits {
    pub memory: Option<PressureThresholds>,
    pub cpu: Option<PressureThresholds>,
    #[serde(alias = "disk")]
    pub storage: Option<PressureThresholds>,
}

impl PressureLimits {
    pub fn get(&self, resource: Resource) -> Option<&PressureThresholds> {
        match resource {
            Resource::Memory => self.memory.as_ref(),
            Resource::Cpu => self.cpu.as_ref(),
            Resource::Storage => self.storage.as_ref(),
        }
    }

    /// Whether any of `resources` reads above its thresholds.
    pub fn is_hot(&self, readings: &PressureReadings, resources: &[Resource]) -> bool {
        resources.iter().any(|r| {
            self.get(*r)
                .is_some_and(|limits| limits.exceeded_by(readings.get(*r)))
        })
    }

    pub fn covers_any(&self, resources: &[Resource]) -> bool {
        resources.iter().any(|r| self.get(*r).is_some())
    }

    fn all(&self) -> impl Iterator<Item = &PressureThresholds> {
        Resource::ALL.iter().filter_map(|r| self.get(*r))
    }
}

/// `[balancing.psi]`: limits used when `mode = "psi"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsiConfig {
    /// Nodes above these limits shed guests.
    pub nodes: PressureLimits,
    /// Guests above these limits are moved first.
    pub guests: PressureLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancingConfig {
    /// memory | cpu | storage (alias disk) | weighted
    pub method: String,
    pub weights: Weights,
    pub mode: BalancingMode,
    /// Target utilization ceiling per dimension.
    pub max_fill: f64,
    /// Deviation below which no moves are planned.
    pub tolerance: f64,
    pub iteration_cap: u32,
    /// Rank penalty per violated soft rule.
    pub soft_penalty: f64,
    /// Smallest reduction a move must achieve.
    pub min_improvement: f64,
    /// Plan only when some node's load exceeds this fraction.
    pub trigger_threshold: Option<f64>,
    /// Skip the `max_fill` headroom check.
    pub overprovisioning: bool,
    /// Move guests off maintenance nodes before balancing.
    pub evacuate_maintenance: bool,
    /// Prefer larger guests among equally ranked candidates.
    pub larger_guests_first: bool,
    /// Guest kinds that may be moved; empty means all.
    pub guest_kinds: BTreeSet<GuestKind>,
    pub node_reserve: NodeReserve,
    pub psi: PsiConfig,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            method: "memory".to_string(),
            weights: Weights::default(),
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
            guest_kinds: [GuestKind::Vm, GuestKind::Container].into_iter().collect(),
            node_reserve: NodeReserve::default(),
            psi: PsiConfig::default(),
        }
    }
}

impl BalancingConfig {
    pub fn balances_kind(&self, kind: GuestKind) -> bool {
        self.guest_kinds.is_empty() || self.guest_kinds.contains(&kind)
    }

    pub fn method(&self) -> Result<BalancingMethod, ConfigurationError> {
        BalancingMethod::parse(&self.method, self.weights)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Parallel migrations across the cluster.
    pub concurrency: u32,
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff_initial: String,
    pub backoff_max: String,
    pub poll_interval: String,
    pub action_timeout: String,
    pub cycle_timeout: String,
    pub dry_run: bool,
    pub live: bool,
    pub with_local_disks: bool,
    pub with_conntrack_state: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retries: 2,
            backoff_initial: "5s".to_string(),
            backoff_max: "60s".to_string(),
            poll_interval: "5s".to_string(),
            action_timeout: "30m".to_string(),
            cycle_timeout: "2h".to_string(),
            dry_run: false,
            live: true,
            with_local_disks: true,
            with_conntrack_state: true,
        }
    }
}

/// Parsed execution durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    pub action_timeout: Duration,
    pub cycle_timeout: Duration,
}

impl ExecutionConfig {
    pub fn timings(&self) -> Result<ExecutionTimings, ConfigurationError> {
        Ok(ExecutionTimings {
            backoff_initial: config_duration("execution.backoff_initial", &self.backoff_initial)?,
            backoff_max: config_duration("execution.backoff_max", &self.backoff_max)?,
            poll_interval: config_duration("execution.poll_interval", &self.poll_interval)?,
            action_timeout: config_duration("execution.action_timeout", &self.action_timeout)?,
            cycle_timeout: config_duration("execution.cycle_timeout", &self.cycle_timeout)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Keep running cycles on `interval` instead of exiting after one.
    pub daemon: bool,
    pub interval: String,
    /// Wait before the first cycle.
    pub delay: Option<String>,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            daemon: true,
            interval: "12h".to_string(),
            delay: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn interval(&self) -> Result<Duration, ConfigurationError> {
        config_duration("service.interval", &self.interval)
    }

    pub fn delay(&self) -> Result<Duration, ConfigurationError> {
        match &self.delay {
            Some(d) => config_duration("service.delay", d),
            None => Ok(Duration::ZERO),
        }
    }
}

fn out_of_range(key: &'static str, value: impl ToString, expected: &'static str) -> ConfigurationError {
    ConfigurationError::OutOfRange {
        key,
        value: value.to_string(),
        expected,
    }
}

impl BalancerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigurationError> {
        let config: BalancerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigurationError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value the planner and executor will rely on.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let b = &self.balancing;
        let method = b.method()?;

        if !(b.max_fill > 0.0 && b.max_fill <= 1.0) {
            return Err(out_of_range("balancing.max_fill", b.max_fill, "0 < max_fill <= 1"));
        }
        if !(b.tolerance >= 0.0 && b.tolerance < 1.0) {
            return Err(out_of_range("balancing.tolerance", b.tolerance, "0 <= tolerance < 1"));
        }
        if b.iteration_cap == 0 {
            return Err(out_of_range("balancing.iteration_cap", b.iteration_cap, "at least 1"));
        }
        if !(b.soft_penalty >= 0.0 && b.soft_penalty.is_finite()) {
            return Err(out_of_range("balancing.soft_penalty", b.soft_penalty, "a non-negative number"));
        }
        if !(b.min_improvement >= 0.0 && b.min_improvement.is_finite()) {
            return Err(out_of_range(
                "balancing.min_improvement",
                b.min_improvement,
                "a non-negative number",
            ));
        }
        if let Some(t) = b.trigger_threshold {
            if !(t > 0.0 && t <= 1.0) {
                return Err(out_of_range("balancing.trigger_threshold", t, "0 < threshold <= 1"));
            }
        }
        let reserves = std::iter::once(&b.node_reserve.defaults).chain(b.node_reserve.nodes.values());
        for reserve in reserves {
            if reserve.memory < 0.0 || reserve.cpu < 0.0 || reserve.storage < 0.0 {
                return Err(out_of_range(
                    "balancing.node_reserve",
                    format!("{reserve:?}"),
                    "non-negative amounts",
                ));
            }
        }

        let psi_limits = b.psi.nodes.all().chain(b.psi.guests.all());
        for limits in psi_limits {
            let values = [limits.pressure_full, limits.pressure_some, limits.pressure_spikes];
            if values.iter().any(|v| !(*v >= 0.0 && *v <= 100.0)) {
                return Err(out_of_range(
                    "balancing.psi",
                    format!("{limits:?}"),
                    "percentages between 0 and 100",
                ));
            }
        }
        if b.mode == BalancingMode::Psi && !b.psi.nodes.covers_any(&method.dimensions()) {
            return Err(out_of_range(
                "balancing.psi.nodes",
                "none",
                "node thresholds for a balanced resource in psi mode",
            ));
        }

        let e = &self.execution;
        if e.concurrency == 0 {
            return Err(out_of_range("execution.concurrency", e.concurrency, "at least 1"));
        }
        let timings = e.timings()?;
        if timings.backoff_max < timings.backoff_initial {
            return Err(out_of_range(
                "execution.backoff_max",
                &e.backoff_max,
                "not less than backoff_initial",
            ));
        }
        if timings.poll_interval.is_zero() {
            return Err(out_of_range("execution.poll_interval", &e.poll_interval, "greater than zero"));
        }
        if timings.action_timeout.is_zero() {
            return Err(out_of_range("execution.action_timeout", &e.action_timeout, "greater than zero"));
        }
        if timings.cycle_timeout.is_zero() {
            return Err(out_of_range("execution.cycle_timeout", &e.cycle_timeout, "greater than zero"));
        }

        if self.service.interval()?.is_zero() {
            return Err(out_of_range("service.interval", &self.service.interval, "greater than zero"));
        }
        self.service.delay()?;
        Ok(())
    }
}
