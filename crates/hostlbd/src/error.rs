use hostlb_collector::CollectionError;
use hostlb_core::ConfigurationError;
use hostlb_placement::PlanningError;
use thiserror::Error;

/// Why a cycle ended without a plan. The cluster is left untouched in
/// every case.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a balancing cycle is already running")]
    AlreadyRunning,

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("collection failed: {0}")]
    Collection(#[from] CollectionError),

    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),
}

pub type CycleResult<T> = Result<T, CycleError>;
