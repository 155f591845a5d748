//! Plan execution.
//!
//! Every action runs as its own task. Before dispatching it waits for its
//! [`Ticket`]: earlier actions on the same guest, and on the same source or
//! target node unless the provider allows parallel migrations per node,
//! must finish first. Then it takes a provider lease, which bounds the
//! number of simultaneous migrations. Actions that share nothing with a
//! stalled migration keep going. With a concurrency of one every action
//! queues behind its predecessor, giving strict plan order.
//!
//! The whole run is bounded by the cycle timeout. On expiry every task is
//! aborted and unfinished actions are settled: never-acknowledged ones as
//! `CycleTimeout`, acknowledged ones as `InFlightUnknown`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use hostlb_core::config::ExecutionConfig;
use hostlb_core::{
    ClusterProvider, ConfigurationError, MigrationAction, MigrationOptions, MigrationPlan,
    OperationHandle, OperationStatus,
};

use crate::error::ExecutionFailure;
use crate::pool::{ProviderLease, ProviderPool};
use crate::queue::{ConflictQueue, Ticket};
use crate::report::ExecutionReport;
use crate::tracker::{ActionTracker, RetryPolicy};

/// Execution tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Bound on a single migrate call and, separately, on waiting for an
    /// acknowledged migration to finish.
    pub action_timeout: Duration,
    pub cycle_timeout: Duration,
    pub options: MigrationOptions,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(5),
            action_timeout: Duration::from_secs(30 * 60),
            cycle_timeout: Duration::from_secs(2 * 3600),
            options: MigrationOptions::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &ExecutionConfig) -> Result<Self, ConfigurationError> {
        let timings = config.timings()?;
        Ok(Self {
            concurrency: config.concurrency.max(1) as usize,
            retry: RetryPolicy {
                max_retries: config.retries,
                initial_backoff: timings.backoff_initial,
                max_backoff: timings.backoff_max,
                multiplier: 2.0,
            },
            poll_interval: timings.poll_interval,
            action_timeout: timings.action_timeout,
            cycle_timeout: timings.cycle_timeout,
            options: MigrationOptions {
                live: config.live,
                with_local_disks: config.with_local_disks,
                with_conntrack_state: config.with_conntrack_state,
            },
        })
    }
}

/// State shared between the coordinator and action tasks.
struct Shared {
    trackers: Mutex<Vec<ActionTracker>>,
    failed_guests: Mutex<BTreeSet<String>>,
    settings: ExecutorSettings,
}

impl Shared {
    fn update<R>(&self, index: usize, f: impl FnOnce(&mut ActionTracker) -> R) -> Option<R> {
        let mut trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        trackers.get_mut(index).map(f)
    }

    fn guest_failed(&self, guest: &str) -> bool {
        self.failed_guests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(guest)
    }

    fn mark_failed(&self, guest: &str) {
        self.failed_guests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(guest.to_string());
    }
}

/// Runs migration plans against a provider.
pub struct PlanExecutor {
    provider: Arc<dyn ClusterProvider>,
    settings: ExecutorSettings,
}

impl PlanExecutor {
    pub fn new(provider: Arc<dyn ClusterProvider>, settings: ExecutorSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute every action of `plan` and report how each one ended.
    pub async fn execute(&self, plan: &MigrationPlan) -> ExecutionReport {
        let started = Instant::now();
        if plan.is_empty() {
            return ExecutionReport::empty();
        }

        let shared = Arc::new(Shared {
            trackers: Mutex::new(plan.actions.iter().cloned().map(ActionTracker::new).collect()),
            failed_guests: Mutex::new(BTreeSet::new()),
            settings: self.settings,
        });
        let pool = ProviderPool::new(Arc::clone(&self.provider), self.settings.concurrency);
        let lock_nodes = !pool.supports_parallel_node_migrations();
        let sequential = pool.size() == 1;
        let mut queue = ConflictQueue::new();
        let mut tasks = JoinSet::new();

        info!(
            actions = plan.len(),
            concurrency = pool.size(),
            "executing migration plan"
        );

        for (index, action) in plan.actions.iter().enumerate() {
            let mut keys = vec![format!("guest:{}", action.guest)];
            if lock_nodes {
                keys.push(format!("node:{}", action.source));
                keys.push(format!("node:{}", action.target));
            }
            if sequential {
                keys.push("plan".to_string());
            }
            let ticket = queue.enqueue(keys);
            tasks.spawn(run_action(
                Arc::clone(&shared),
                index,
                action.clone(),
                pool.clone(),
                ticket,
            ));
        }

        let run = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "migration task ended abnormally");
                }
            }
        };

        let cycle_timed_out = timeout(self.settings.cycle_timeout, run).await.is_err();
        if cycle_timed_out {
            warn!(
                timeout_secs = self.settings.cycle_timeout.as_secs(),
                "cycle timeout reached; abandoning unfinished migrations"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let trackers = {
            let mut trackers = shared.trackers.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *trackers)
        };
        let outcomes = trackers
            .into_iter()
            .map(|mut tracker| {
                tracker.cancel();
                tracker.into_outcome()
            })
            .collect();

        let report = ExecutionReport::new(outcomes, cycle_timed_out, started.elapsed());
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            in_flight_unknown = report.in_flight_unknown,
            "plan execution finished"
        );
        report
    }
}

enum PollOutcome {
    Succeeded,
    Failed(String),
    Error(ExecutionFailure),
    TimedOut,
}

/// Wait for the action's turn, then dispatch, poll, and retry it. The
/// ticket is held until this returns.
async fn run_action(
    shared: Arc<Shared>,
    index: usize,
    action: MigrationAction,
    pool: ProviderPool,
    mut ticket: Ticket,
) {
    let settings = shared.settings;
    let (guest, source, target) = (&action.guest, &action.source, &action.target);

    if ticket.pending() > 0 {
        debug!(%guest, %source, %target, waiting_on = ticket.pending(), "migration queued behind earlier actions");
    }
    ticket.ready().await;

    if shared.guest_failed(guest) {
        info!(%guest, "skipping migration; guest failed earlier in this plan");
        shared.update(index, |t| t.skip(format!("guest {guest} failed earlier in this plan")));
        return;
    }

    let Some(lease) = pool.checkout().await else {
        shared.update(index, |t| t.skip("provider pool closed".to_string()));
        return;
    };

    loop {
        let attempt = shared
            .update(index, |t| {
                t.dispatch();
                t.attempts()
            })
            .unwrap_or(0);
        info!(%guest, %source, %target, attempt, "dispatching migration");

        let failure = match timeout(settings.action_timeout, lease.migrate(guest, target, &settings.options)).await {
            Ok(Ok(handle)) => {
                debug!(%guest, op = %handle, "migration acknowledged");
                shared.update(index, |t| t.acknowledge(handle.clone()));
                match poll_until_done(&lease, &handle, &settings).await {
                    PollOutcome::Succeeded => {
                        shared.update(index, |t| t.succeed());
                        info!(%guest, %source, %target, attempt, "migration succeeded");
                        return;
                    }
                    PollOutcome::Failed(reason) => ExecutionFailure::Operation { reason },
                    PollOutcome::Error(failure) => failure,
                    PollOutcome::TimedOut => {
                        let failure = ExecutionFailure::InFlightUnknown;
                        warn!(%guest, op = %handle, "stopped waiting for migration; {failure}");
                        shared.update(index, |t| t.fail(failure));
                        shared.mark_failed(guest);
                        return;
                    }
                }
            }
            Ok(Err(e)) => ExecutionFailure::from(e),
            Err(_) => ExecutionFailure::ActionTimeout {
                after: settings.action_timeout,
            },
        };

        if failure.is_retryable() && settings.retry.allows_retry(attempt) {
            let delay = settings.retry.backoff(attempt);
            warn!(
                %guest,
                attempt,
                error = %failure,
                retry_in_ms = delay.as_millis() as u64,
                "migration attempt failed; retrying"
            );
            shared.update(index, |t| t.retry(&failure));
            sleep(delay).await;
            continue;
        }

        error!(%guest, %source, %target, attempt, error = %failure, "migration failed");
        shared.update(index, |t| t.fail(failure));
        shared.mark_failed(guest);
        return;
    }
}

/// Poll until the operation settles or `action_timeout` elapses. Transient
/// poll errors are tolerated; others end the attempt.
async fn poll_until_done(
    provider: &ProviderLease,
    handle: &OperationHandle,
    settings: &ExecutorSettings,
) -> PollOutcome {
    let polling = async {
        loop {
            match provider.poll_operation(handle).await {
                Ok(OperationStatus::Running) => {}
                Ok(OperationStatus::Succeeded) => return PollOutcome::Succeeded,
                Ok(OperationStatus::Failed(reason)) => return PollOutcome::Failed(reason),
                Err(e) if e.is_retryable() => {
                    debug!(op = %handle, error = %e, "transient poll error");
                }
                Err(e) => return PollOutcome::Error(e.into()),
            }
            sleep(settings.poll_interval).await;
        }
    };
    timeout(settings.action_timeout, polling)
        .await
        .unwrap_or(PollOutcome::TimedOut)
}
