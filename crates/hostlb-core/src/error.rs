//! Error types shared across hostlb crates.

use thiserror::Error;

/// Invalid or unusable configuration.
///
/// Fatal at startup and during per-cycle validation; never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown balancing method: {0}")]
    UnknownMethod(String),

    #[error("weighted method needs at least one positive weight (memory={memory}, cpu={cpu}, storage={storage})")]
    InvalidWeights { memory: f64, cpu: f64, storage: f64 },

    #[error("{key} = {value} is out of range: expected {expected}")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{key}: invalid duration {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A snapshot that breaks the structural invariants of [`crate::ClusterState`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("guest {guest} references unknown node {node}")]
    UnknownNode { guest: String, node: String },

    #[error("group {group} references unknown member {member}")]
    UnknownGroupMember { group: String, member: String },

    #[error("guest {guest} is listed by node {listed_on} but runs on {node}")]
    MisplacedGuest {
        guest: String,
        node: String,
        listed_on: String,
    },

    #[error("duplicate {kind} id: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} keyed as {key} has id {id}")]
    MismatchedKey {
        kind: &'static str,
        key: String,
        id: String,
    },
}

/// Failure loading a JSON inventory for the in-memory provider.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse inventory: {0}")]
    Parse(#[from] serde_json::Error),
}
