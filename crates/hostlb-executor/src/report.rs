//! Execution outcome.

use std::time::Duration;

use serde::Serialize;

use hostlb_core::{ActionStatus, MigrationAction};

use crate::error::ExecutionFailure;

/// Terminal state of one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub action: MigrationAction,
    pub status: ActionStatus,
    /// Dispatch attempts made, including retries.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure: Option<ExecutionFailure>,
}

/// Per-action results of one plan execution, in plan order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<ActionOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed actions whose migration may still be running.
    pub in_flight_unknown: usize,
    pub cycle_timed_out: bool,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn new(outcomes: Vec<ActionOutcome>, cycle_timed_out: bool, elapsed: Duration) -> Self {
        let count = |status: ActionStatus| outcomes.iter().filter(|o| o.status == status).count();
        let succeeded = count(ActionStatus::Succeeded);
        let failed = count(ActionStatus::Failed);
        let skipped = count(ActionStatus::Skipped);
        let in_flight_unknown = outcomes
            .iter()
            .filter(|o| o.failure == Some(ExecutionFailure::InFlightUnknown))
            .count();
        Self {
            outcomes,
            succeeded,
            failed,
            skipped,
            in_flight_unknown,
            cycle_timed_out,
            elapsed,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), false, Duration::ZERO)
    }

    /// Actions that reached the provider or settled `Failed`.
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn outcome(&self, guest: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.action.guest == guest)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ActionStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlb_core::ProviderError;

    fn outcome(guest: &str, status: ActionStatus, failure: Option<ExecutionFailure>) -> ActionOutcome {
        let mut action = MigrationAction::new(guest, "a", "b", 0.1);
        action.status = status;
        ActionOutcome {
            action,
            status,
            attempts: 1,
            last_error: failure.as_ref().map(ToString::to_string),
            failure,
        }
    }

    #[test]
    fn counts_by_status() {
        let report = ExecutionReport::new(
            vec![
                outcome("1", ActionStatus::Succeeded, None),
                outcome(
                    "2",
                    ActionStatus::Failed,
                    Some(ProviderError::Auth("denied".into()).into()),
                ),
                outcome("3", ActionStatus::Failed, Some(ExecutionFailure::InFlightUnknown)),
                outcome("4", ActionStatus::Skipped, None),
            ],
            true,
            Duration::from_secs(3),
        );
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.in_flight_unknown, 1);
        assert_eq!(report.attempted(), 3);
        assert!(!report.is_complete_success());
        assert_eq!(report.failures().count(), 2);
        assert_eq!(report.outcome("4").unwrap().status, ActionStatus::Skipped);
    }

    #[test]
    fn empty_report_is_success() {
        let report = ExecutionReport::empty();
        assert!(report.is_complete_success());
        assert_eq!(report.attempted(), 0);
    }

    #[test]
    fn report_serializes_failures_distinctly() {
        let report = ExecutionReport::new(
            vec![outcome("3", ActionStatus::Failed, Some(ExecutionFailure::InFlightUnknown))],
            false,
            Duration::ZERO,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "failed");
        assert_eq!(json["outcomes"][0]["failure"]["kind"], "in_flight_unknown");
        assert_eq!(json["outcomes"][0]["last_error"], "in-flight, result unknown");
    }
}
