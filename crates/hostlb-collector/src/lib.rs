//! hostlb-collector — cluster snapshot construction.
//!
//! Pulls node, guest, and group inventories from a
//! [`hostlb_core::ClusterProvider`] and turns them into an immutable
//! [`hostlb_core::ClusterState`]. A snapshot is either complete and
//! structurally valid or not produced at all.
//!
//! # Components
//!
//! - **`collector`** — `StateCollector::collect`, provider queries, summary logging
//! - **`convert`** — Provider records to model types (filters, reservations, groups)

pub mod collector;
pub mod convert;
pub mod error;

pub use collector::StateCollector;
pub use convert::{CollectionSummary, build_state};
pub use error::{CollectionError, CollectionResult};
