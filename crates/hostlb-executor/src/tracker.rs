//! Per-action state machine and retry policy.
//!
//! ```text
//! Pending ──dispatch──▶ Dispatched ──succeed──▶ Succeeded
//!    ▲                      │
//!    └──────retry───────────┤
//!                           └──fail──▶ Failed
//! Pending ──skip──▶ Skipped
//! ```
//!
//! Transitions that do not apply to the current status are ignored.

use std::time::Duration;

use hostlb_core::{ActionStatus, MigrationAction, OperationHandle};

use crate::error::ExecutionFailure;
use crate::report::ActionOutcome;

/// Exponential backoff between dispatch attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based), capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

/// Tracks one action through execution.
#[derive(Debug, Clone)]
pub struct ActionTracker {
    action: MigrationAction,
    attempts: u32,
    handle: Option<OperationHandle>,
    last_error: Option<String>,
    failure: Option<ExecutionFailure>,
}

impl ActionTracker {
    pub fn new(mut action: MigrationAction) -> Self {
        action.status = ActionStatus::Pending;
        Self {
            action,
            attempts: 0,
            handle: None,
            last_error: None,
            failure: None,
        }
    }

    pub fn action(&self) -> &MigrationAction {
        &self.action
    }

    pub fn status(&self) -> ActionStatus {
        self.action.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Acknowledged by the provider in the current attempt.
    pub fn is_acknowledged(&self) -> bool {
        self.handle.is_some()
    }

    pub fn dispatch(&mut self) {
        if self.action.status == ActionStatus::Pending {
            self.action.status = ActionStatus::Dispatched;
            self.attempts += 1;
            self.handle = None;
        }
    }

    pub fn acknowledge(&mut self, handle: OperationHandle) {
        if self.action.status == ActionStatus::Dispatched {
            self.handle = Some(handle);
        }
    }

    pub fn succeed(&mut self) {
        if self.action.status == ActionStatus::Dispatched {
            self.action.status = ActionStatus::Succeeded;
        }
    }

    /// Back to `Pending` ahead of another attempt.
    pub fn retry(&mut self, failure: &ExecutionFailure) {
        if self.action.status == ActionStatus::Dispatched {
            self.action.status = ActionStatus::Pending;
            self.last_error = Some(failure.to_string());
            self.handle = None;
        }
    }

    pub fn fail(&mut self, failure: ExecutionFailure) {
        if !self.action.status.is_terminal() {
            self.action.status = ActionStatus::Failed;
            self.last_error = Some(failure.to_string());
            self.failure = Some(failure);
        }
    }

    pub fn skip(&mut self, reason: String) {
        if self.action.status == ActionStatus::Pending {
            self.action.status = ActionStatus::Skipped;
            self.last_error = Some(reason);
        }
    }

    /// Settle a non-terminal action when the cycle is cut short.
    /// Acknowledged migrations are reported as in-flight rather than
    /// timed out.
    pub fn cancel(&mut self) {
        if self.action.status.is_terminal() {
            return;
        }
        let failure = if self.action.status == ActionStatus::Dispatched && self.is_acknowledged() {
            ExecutionFailure::InFlightUnknown
        } else {
            ExecutionFailure::CycleTimeout
        };
        self.fail(failure);
    }

    pub fn into_outcome(self) -> ActionOutcome {
        ActionOutcome {
            status: self.action.status,
            action: self.action,
            attempts: self.attempts,
            last_error: self.last_error,
            failure: self.failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlb_core::ProviderError;

    fn tracker() -> ActionTracker {
        ActionTracker::new(MigrationAction::new("100", "a", "b", 0.4))
    }

    #[test]
    fn happy_path() {
        let mut t = tracker();
        assert_eq!(t.status(), ActionStatus::Pending);
        t.dispatch();
        assert_eq!(t.status(), ActionStatus::Dispatched);
        t.acknowledge(OperationHandle("op-1".into()));
        t.succeed();
        assert_eq!(t.status(), ActionStatus::Succeeded);
        assert_eq!(t.attempts(), 1);

        // Terminal states stay put.
        t.fail(ExecutionFailure::CycleTimeout);
        assert_eq!(t.status(), ActionStatus::Succeeded);
    }

    #[test]
    fn retry_returns_to_pending_and_counts_attempts() {
        let mut t = tracker();
        let failure = ExecutionFailure::from(ProviderError::Conflict("locked".into()));
        t.dispatch();
        t.retry(&failure);
        assert_eq!(t.status(), ActionStatus::Pending);
        t.dispatch();
        t.fail(failure);

        let outcome = t.into_outcome();
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.action.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.last_error.as_deref(), Some("conflict: locked"));
    }

    #[test]
    fn succeed_requires_dispatch() {
        let mut t = tracker();
        t.succeed();
        assert_eq!(t.status(), ActionStatus::Pending);
    }

    #[test]
    fn cancel_distinguishes_in_flight() {
        let mut pending = tracker();
        pending.cancel();
        assert_eq!(pending.into_outcome().failure, Some(ExecutionFailure::CycleTimeout));

        let mut unacked = tracker();
        unacked.dispatch();
        unacked.cancel();
        assert_eq!(unacked.into_outcome().failure, Some(ExecutionFailure::CycleTimeout));

        let mut in_flight = tracker();
        in_flight.dispatch();
        in_flight.acknowledge(OperationHandle("op-9".into()));
        in_flight.cancel();
        let outcome = in_flight.into_outcome();
        assert_eq!(outcome.failure, Some(ExecutionFailure::InFlightUnknown));
        assert_eq!(outcome.last_error.as_deref(), Some("in-flight, result unknown"));
    }

    #[test]
    fn skip_only_from_pending() {
        let mut t = tracker();
        t.skip("guest 100 failed earlier".into());
        assert_eq!(t.status(), ActionStatus::Skipped);

        let mut d = tracker();
        d.dispatch();
        d.skip("ignored".into());
        assert_eq!(d.status(), ActionStatus::Dispatched);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
