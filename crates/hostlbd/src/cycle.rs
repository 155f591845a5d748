//! Balancing cycles.
//!
//! One cycle is collect, plan, then execute. [`Balancer::run_cycle`] holds
//! a [`CycleGuard`] for its whole duration, so a cycle can never start
//! planning against a cluster that an earlier plan is still migrating.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hostlb_collector::StateCollector;
use hostlb_core::{BalancerConfig, ClusterProvider, MigrationPlan};
use hostlb_executor::{ExecutionReport, ExecutorSettings, PlanExecutor};
use hostlb_placement::BalancingEngine;

use crate::error::{CycleError, CycleResult};

/// Marks a cycle as in flight; released on drop.
#[derive(Debug)]
pub struct CycleGuard {
    flag: Arc<AtomicBool>,
}

impl CycleGuard {
    /// `None` if another guard on `flag` is alive.
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What one cycle planned and, unless dry-run, how execution went.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub plan: MigrationPlan,
    pub report: Option<ExecutionReport>,
    pub dry_run: bool,
}

impl CycleSummary {
    pub fn is_success(&self) -> bool {
        self.report
            .as_ref()
            .is_none_or(ExecutionReport::is_complete_success)
    }

    /// Machine-readable form for `--json` output.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "dry_run": self.dry_run,
            "plan": self.plan,
            "report": self.report,
        })
    }
}

/// Owns the provider and configuration and runs cycles one at a time.
pub struct Balancer {
    provider: Arc<dyn ClusterProvider>,
    config: BalancerConfig,
    in_flight: Arc<AtomicBool>,
    cycles: AtomicU64,
}

impl Balancer {
    /// Rejects configurations that could fail mid-cycle.
    pub fn new(provider: Arc<dyn ClusterProvider>, config: BalancerConfig) -> CycleResult<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
            cycles: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Cycles that produced a plan, whether or not execution succeeded.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Collect, plan, and (unless dry-run) execute once.
    pub async fn run_cycle(&self) -> CycleResult<CycleSummary> {
        let _guard = CycleGuard::try_acquire(&self.in_flight).ok_or(CycleError::AlreadyRunning)?;
        let dry_run = self.config.execution.dry_run;

        let engine = BalancingEngine::from_config(&self.config.balancing)?;
        let settings = ExecutorSettings::from_config(&self.config.execution)?;

        let collector = StateCollector::new(Arc::clone(&self.provider), self.config.clone());
        let state = collector.collect().await?;

        let plan = engine.plan(&state);
        log_plan(&plan);

        let report = if dry_run {
            info!(actions = plan.len(), "dry run; plan not executed");
            None
        } else {
            let executor = PlanExecutor::new(Arc::clone(&self.provider), settings);
            Some(executor.execute(&plan).await)
        };

        if let Some(report) = &report {
            info!(
                attempted = report.attempted(),
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                in_flight_unknown = report.in_flight_unknown,
                cycle_timed_out = report.cycle_timed_out,
                "cycle finished"
            );
            for outcome in report.failures() {
                warn!(
                    guest = %outcome.action.guest,
                    source = %outcome.action.source,
                    target = %outcome.action.target,
                    attempts = outcome.attempts,
                    error = outcome.last_error.as_deref().unwrap_or("unknown"),
                    "migration not completed"
                );
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(CycleSummary {
            plan,
            report,
            dry_run,
        })
    }

    /// Run cycles until `shutdown` fires, or once when `service.daemon` is
    /// off. Failed cycles are logged and retried on the next interval.
    pub async fn run_service(&self, mut shutdown: watch::Receiver<bool>) -> CycleResult<()> {
        let interval = self.config.service.interval()?;
        let delay = self.config.service.delay()?;
        let daemon = self.config.service.daemon;

        info!(
            daemon,
            interval_secs = interval.as_secs(),
            delay_secs = delay.as_secs(),
            "balancer service started"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("balancer service shutting down");
                    return Ok(());
                }
            }
        }

        loop {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "balancing cycle failed");
            }
            if !daemon {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("balancer service shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn log_plan(plan: &MigrationPlan) {
    for (before, after) in plan.before.iter().zip(&plan.after) {
        info!(
            node = %before.node,
            before = before.load,
            after = after.load,
            maintenance = before.maintenance,
            "node load"
        );
    }
}
