//! Bounded provider access.
//!
//! [`ProviderPool`] hands out at most `size` concurrent leases on the shared
//! provider. A lease holds a semaphore permit and returns it when dropped,
//! whether the holder finished, failed, timed out, or was aborted.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use hostlb_core::ClusterProvider;

/// Semaphore-bounded checkout of a shared provider.
#[derive(Clone)]
pub struct ProviderPool {
    provider: Arc<dyn ClusterProvider>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ProviderPool {
    pub fn new(provider: Arc<dyn ClusterProvider>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            provider,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot. Returns `None` only if the pool was closed.
    pub async fn checkout(&self) -> Option<ProviderLease> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        debug!(available = self.available(), "provider lease checked out");
        Some(ProviderLease {
            provider: Arc::clone(&self.provider),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn supports_parallel_node_migrations(&self) -> bool {
        self.provider.supports_parallel_node_migrations()
    }
}

/// Scoped provider access. Dropping the lease checks it back in.
pub struct ProviderLease {
    provider: Arc<dyn ClusterProvider>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ProviderLease {
    type Target = dyn ClusterProvider;

    fn deref(&self) -> &Self::Target {
        self.provider.as_ref()
    }
}
