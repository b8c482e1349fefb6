//! Cluster pool registry.
//!
//! Maps each [`ClusterKey`] to exactly one [`ConnectionPool`] and tracks the
//! sessions registered to it. Pools are created on first registration and
//! removed only by shutdown.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::OperationalConfig;
use crate::errors::{BatchError, BatchResult};
use crate::pool::ConnectionPool;
use crate::transport::{PooledTransport, TransportFactory};
use crate::types::{ClusterKey, PoolStatus, Session};

/// Registry of per-cluster connection pools.
pub struct ClusterPoolRegistry {
    factory: Arc<dyn TransportFactory>,
    pools: DashMap<ClusterKey, Arc<ConnectionPool>>,
}

impl ClusterPoolRegistry {
    /// Creates an empty registry whose pools open connections through `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            pools: DashMap::new(),
        }
    }

    /// Registers `session` to the cluster, creating its pool on first use.
    ///
    /// Idempotent: an existing pool is reused as is and `config` only applies
    /// to the call that creates the pool. Concurrent first registrations
    /// create exactly one pool.
    pub fn register_to_cluster(
        &self,
        config: &OperationalConfig,
        cluster_key: ClusterKey,
        session: &Session,
    ) -> BatchResult<Arc<ConnectionPool>> {
        config.validate()?;

        let pool = self
            .pools
            .entry(cluster_key)
            .or_insert_with(|| {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    %cluster_key,
                    max_pool_size = config.max_pool_size,
                    "Creating connection pool"
                );
                Arc::new(ConnectionPool::new(
                    cluster_key,
                    config.clone(),
                    Arc::clone(&self.factory),
                ))
            })
            .clone();

        if pool.is_draining() {
            return Err(BatchError::draining(cluster_key));
        }

        if pool.add_member(session) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%cluster_key, session = %session, "Session registered to cluster");
        }

        Ok(pool)
    }

    /// Returns the pool for `cluster_key`.
    pub fn pool(&self, cluster_key: ClusterKey) -> BatchResult<Arc<ConnectionPool>> {
        self.pools
            .get(&cluster_key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BatchError::pool_not_found(cluster_key))
    }

    /// Borrows a connection from the cluster's pool.
    pub async fn acquire_transport(
        &self,
        cluster_key: ClusterKey,
        session: &Session,
        sticky: bool,
    ) -> BatchResult<PooledTransport> {
        let pool = self.pool(cluster_key)?;
        pool.acquire(session, sticky).await
    }

    /// Returns the keys of every cluster `session` is registered to.
    pub fn clusters_for(&self, session: &Session) -> Vec<ClusterKey> {
        self.pools_for(session)
            .iter()
            .map(|pool| pool.cluster_key())
            .collect()
    }

    /// Returns the pools of every cluster `session` is registered to.
    pub fn pools_for(&self, session: &Session) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .iter()
            .filter(|entry| entry.value().has_member(session))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns every registered pool.
    pub fn all_pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Removes the entry for `cluster_key` if it still maps to `pool`.
    pub fn remove_pool(&self, cluster_key: ClusterKey, pool: &Arc<ConnectionPool>) -> bool {
        let removed = self
            .pools
            .remove_if(&cluster_key, |_, current| Arc::ptr_eq(current, pool))
            .is_some();

        #[cfg(feature = "tracing")]
        if removed {
            tracing::debug!(%cluster_key, "Connection pool removed from registry");
        }

        removed
    }

    /// Returns the status of the cluster's pool.
    pub fn status(&self, cluster_key: ClusterKey) -> BatchResult<PoolStatus> {
        Ok(self.pool(cluster_key)?.status())
    }

    /// Returns every registered cluster key.
    pub fn cluster_keys(&self) -> Vec<ClusterKey> {
        self.pools.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns the number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns true if no pool is registered.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl fmt::Debug for ClusterPoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterPoolRegistry")
            .field("pools", &self.pools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BatchErrorKind;
    use crate::mocks::{test_config, test_session, MockFactory};

    fn registry() -> ClusterPoolRegistry {
        ClusterPoolRegistry::new(Arc::new(MockFactory::new()))
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry();
        let key = ClusterKey::new();
        let session = test_session("smtp.example.com");

        let first = registry.register_to_cluster(&test_config(2), key, &session).unwrap();
        let second = registry.register_to_cluster(&test_config(8), key, &session).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        // The first registration's configuration wins.
        assert_eq!(second.config().max_pool_size, 2);
        assert_eq!(second.members().len(), 1);
    }

    #[test]
    fn test_unknown_key_reports_missing_registration() {
        let err = registry().pool(ClusterKey::new()).unwrap_err();
        assert_eq!(err.kind(), BatchErrorKind::PoolNotFound);
        assert!(err.message().contains("register_to_cluster"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = registry();
        let session = test_session("smtp.example.com");
        let err = registry
            .register_to_cluster(&test_config(0), ClusterKey::new(), &session)
            .unwrap_err();
        assert_eq!(err.kind(), BatchErrorKind::ConfigInvalid);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clusters_for_session() {
        let registry = registry();
        let (k1, k2, k3) = (ClusterKey::new(), ClusterKey::new(), ClusterKey::new());
        let s1 = test_session("smtp.example.com");
        let s2 = test_session("smtp.example.com");

        registry.register_to_cluster(&test_config(2), k1, &s1).unwrap();
        registry.register_to_cluster(&test_config(2), k2, &s1).unwrap();
        registry.register_to_cluster(&test_config(2), k3, &s2).unwrap();

        let mut keys = registry.clusters_for(&s1);
        keys.sort();
        let mut expected = vec![k1, k2];
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(registry.clusters_for(&s2), vec![k3]);
        assert_eq!(registry.cluster_keys().len(), 3);
    }

    #[test]
    fn test_remove_pool_only_removes_same_instance() {
        let registry = registry();
        let key = ClusterKey::new();
        let pool = registry
            .register_to_cluster(&test_config(1), key, &test_session("smtp.example.com"))
            .unwrap();
        let factory = Arc::new(MockFactory::new());
        let stranger = Arc::new(ConnectionPool::new(key, test_config(1), factory));

        assert!(!registry.remove_pool(key, &stranger));
        assert!(registry.remove_pool(key, &pool));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_to_draining_pool_fails() {
        let registry = registry();
        let key = ClusterKey::new();
        let session = test_session("smtp.example.com");
        let pool = registry.register_to_cluster(&test_config(1), key, &session).unwrap();

        pool.begin_drain();
        let err = registry.register_to_cluster(&test_config(1), key, &session).unwrap_err();
        assert_eq!(err.kind(), BatchErrorKind::PoolDraining);
        assert!(registry.status(key).unwrap().draining);
    }
}
