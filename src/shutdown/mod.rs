//! Graceful pool shutdown.
//!
//! Draining marks each affected pool as draining right away, so new acquires
//! fail immediately, then runs the wait-and-close phase in the background.
//! A cancelled shutdown still removes its pools from the registry; their idle
//! connections are closed in the background and borrowed ones on release.

use futures::future::join_all;
use std::sync::Arc;

use crate::executor::{AsyncTaskHandle, TaskExecutor};
use crate::pool::ConnectionPool;
use crate::registry::ClusterPoolRegistry;
use crate::types::{Session, ShutdownReport};

/// Drains and closes cluster pools.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<ClusterPoolRegistry>,
    executor: TaskExecutor,
}

impl ShutdownCoordinator {
    /// Creates a coordinator for the registry's pools.
    pub fn new(registry: Arc<ClusterPoolRegistry>, executor: TaskExecutor) -> Self {
        Self { registry, executor }
    }

    /// Shuts down every cluster pool `session` is registered to.
    ///
    /// Returns immediately. The handle resolves once every affected pool has
    /// been drained, closed and removed from the registry.
    pub fn shutdown_connection_pools(
        &self,
        session: &Session,
    ) -> AsyncTaskHandle<Vec<ShutdownReport>> {
        let pools = self.registry.pools_for(session);
        if pools.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                session = %session,
                "Session is not registered to any cluster, nothing to shut down"
            );
            return AsyncTaskHandle::completed("smtp-pool-shutdown", Ok(Vec::new()));
        }
        self.shutdown(pools)
    }

    /// Shuts down every pool in the registry.
    pub fn shutdown_all(&self) -> AsyncTaskHandle<Vec<ShutdownReport>> {
        self.shutdown(self.registry.all_pools())
    }

    fn shutdown(&self, pools: Vec<Arc<ConnectionPool>>) -> AsyncTaskHandle<Vec<ShutdownReport>> {
        for pool in &pools {
            pool.begin_drain();
        }

        let registry = Arc::clone(&self.registry);
        let drains = async move {
            let registry = &registry;
            let reports = join_all(pools.iter().map(|pool| async move {
                let _retire = Retire { registry, pool };
                pool.drain(pool.config().drain_timeout).await
            }))
            .await;
            Ok(reports)
        };

        // Close transports on the runtime that owns their I/O when there is one.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => self.executor.execute_on(&runtime, "smtp-pool-shutdown", drains),
            Err(_) => self.executor.execute_async("smtp-pool-shutdown", drains),
        }
    }
}

/// Removes a pool from the registry when its drain finishes or is dropped.
struct Retire<'a> {
    registry: &'a ClusterPoolRegistry,
    pool: &'a Arc<ConnectionPool>,
}

impl Drop for Retire<'_> {
    fn drop(&mut self) {
        self.registry.remove_pool(self.pool.cluster_key(), self.pool);
        self.pool.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_config, test_session, MockFactory};
    use crate::types::ClusterKey;

    #[tokio::test]
    async fn test_unregistered_session_completes_immediately() {
        let registry = Arc::new(ClusterPoolRegistry::new(Arc::new(MockFactory::new())));
        let coordinator = ShutdownCoordinator::new(registry, TaskExecutor::new());

        let handle = coordinator.shutdown_connection_pools(&test_session("smtp.example.com"));
        assert!(handle.is_done());
        assert!(handle.wait().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_only_touches_session_clusters() {
        let registry = Arc::new(ClusterPoolRegistry::new(Arc::new(MockFactory::new())));
        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), TaskExecutor::new());
        let (mine, theirs) = (ClusterKey::new(), ClusterKey::new());
        let s1 = test_session("smtp.example.com");
        let s2 = test_session("smtp.example.com");

        registry.register_to_cluster(&test_config(1), mine, &s1).unwrap();
        registry.register_to_cluster(&test_config(1), theirs, &s2).unwrap();

        let reports = coordinator.shutdown_connection_pools(&s1).wait().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cluster_key, mine);
        assert_eq!(registry.cluster_keys(), vec![theirs]);
    }

    #[test]
    fn test_shutdown_without_runtime_uses_worker() {
        let registry = Arc::new(ClusterPoolRegistry::new(Arc::new(MockFactory::new())));
        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), TaskExecutor::new());
        let session = test_session("smtp.example.com");
        registry
            .register_to_cluster(&test_config(1), ClusterKey::new(), &session)
            .unwrap();

        let reports = coordinator.shutdown_all().blocking_wait().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_clean());
        assert!(registry.is_empty());
    }
}
