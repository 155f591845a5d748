use hostlb_core::ConfigurationError;
use thiserror::Error;

/// Planning refuses to start only for unusable settings. Unsatisfiable
/// constraints yield an empty or partial plan with diagnostics instead.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

pub type PlanningResult<T> = Result<T, PlanningError>;
