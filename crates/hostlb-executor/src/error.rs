use std::time::Duration;

use hostlb_core::ProviderError;
use serde::Serialize;
use thiserror::Error;

/// Why a migration action ended `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    #[error("{error}")]
    Provider { error: ProviderError },

    /// The provider accepted the migration and later reported it failed.
    #[error("migration failed: {reason}")]
    Operation { reason: String },

    /// The migrate call itself was not acknowledged in time.
    #[error("migrate call timed out after {}s", .after.as_secs())]
    ActionTimeout { after: Duration },

    #[error("cycle timed out before the migration completed")]
    CycleTimeout,

    /// The provider acknowledged the migration but its outcome was never
    /// observed. The guest may or may not have moved.
    #[error("in-flight, result unknown")]
    InFlightUnknown,
}

impl ExecutionFailure {
    /// Failures that warrant another dispatch attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionFailure::Provider { error } => error.is_retryable(),
            ExecutionFailure::Operation { .. } | ExecutionFailure::ActionTimeout { .. } => true,
            ExecutionFailure::CycleTimeout | ExecutionFailure::InFlightUnknown => false,
        }
    }
}

impl From<ProviderError> for ExecutionFailure {
    fn from(error: ProviderError) -> Self {
        ExecutionFailure::Provider { error }
    }
}
