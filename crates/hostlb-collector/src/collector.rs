//! Snapshot collection from a live provider.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use hostlb_core::{BalancerConfig, ClusterProvider, ClusterState};

use crate::convert::{CollectionSummary, build_state};
use crate::error::CollectionResult;

/// Builds one [`ClusterState`] per call from the provider's inventories.
pub struct StateCollector {
    provider: Arc<dyn ClusterProvider>,
    config: BalancerConfig,
}

impl StateCollector {
    pub fn new(provider: Arc<dyn ClusterProvider>, config: BalancerConfig) -> Self {
        Self { provider, config }
    }

    /// Query nodes, guests, and groups, then validate and assemble the
    /// snapshot. Any provider error or structural inconsistency aborts the
    /// collection.
    pub async fn collect(&self) -> CollectionResult<ClusterState> {
        let (nodes, guests, groups) = tokio::try_join!(
            self.provider.list_nodes(),
            self.provider.list_guests(),
            self.provider.list_groups(),
        )
        .inspect_err(|e| warn!(error = %e, "inventory query failed"))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let (state, summary) = build_state(nodes, guests, groups, &self.config, timestamp)
            .inspect_err(|e| warn!(error = %e, "inventory rejected"))?;
        log_summary(&summary);
        Ok(state)
    }
}

fn log_summary(summary: &CollectionSummary) {
    info!(
        nodes = summary.nodes,
        maintenance = ?summary.maintenance_nodes,
        skipped_nodes = summary.skipped_nodes,
        guests = summary.guests,
        pinned = summary.pinned_guests,
        ignored = summary.ignored_guests,
        stopped = summary.stopped_guests,
        groups = summary.groups,
        "cluster snapshot collected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlb_core::{InMemoryProvider, Inventory, ProviderError};

    use crate::CollectionError;

    fn provider() -> Arc<InMemoryProvider> {
        let inventory = Inventory::from_json_str(
            r#"{
                "nodes": [
                    {"id": "a", "memory": {"total": 100.0, "used": 90.0}, "cpu": {"total": 8.0, "used": 4.0}},
                    {"id": "b", "memory": {"total": 100.0, "used": 10.0}, "cpu": {"total": 8.0, "used": 1.0}}
                ],
                "guests": [
                    {"id": "100", "node": "a", "usage": {"memory": 20.0}, "allocation": {"memory": 24.0}}
                ]
            }"#,
        )
        .unwrap();
        Arc::new(InMemoryProvider::new(inventory))
    }

    #[tokio::test]
    async fn collects_snapshot() {
        let collector = StateCollector::new(provider(), BalancerConfig::default());
        let state = collector.collect().await.unwrap();

        assert_eq!(state.nodes().len(), 2);
        assert_eq!(state.guest("100").unwrap().node, "a");
        assert_eq!(state.guest("100").unwrap().name, "100");
        assert!(state.timestamp() > 0);
    }

    #[tokio::test]
    async fn unreachable_provider_fails_collection() {
        let provider = provider();
        provider.fail_listing(Some(ProviderError::Network("connection refused".into())));
        let collector = StateCollector::new(provider, BalancerConfig::default());

        let err = collector.collect().await.unwrap_err();
        assert!(matches!(err, CollectionError::Provider(ProviderError::Network(_))));
    }
}
