//! Batch mailer façade.
//!
//! Ties the registry, executor and shutdown coordinator together behind a
//! send-oriented API.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::config::OperationalConfig;
use crate::errors::BatchResult;
use crate::executor::{AsyncTaskHandle, TaskExecutor, WorkerPool};
use crate::registry::ClusterPoolRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::TransportFactory;
use crate::types::{BatchSendResult, ClusterKey, OutgoingMessage, Session, ShutdownReport};

/// Sends mail through clustered connection pools.
#[derive(Debug)]
pub struct BatchMailer {
    config: Arc<OperationalConfig>,
    registry: Arc<ClusterPoolRegistry>,
    coordinator: ShutdownCoordinator,
    executor: TaskExecutor,
    workers: Mutex<Option<Arc<WorkerPool>>>,
}

impl BatchMailer {
    /// Creates a mailer using `config` for every cluster it registers.
    pub fn new(config: OperationalConfig, factory: Arc<dyn TransportFactory>) -> BatchResult<Self> {
        config.validate()?;
        let registry = Arc::new(ClusterPoolRegistry::new(factory));
        let executor = TaskExecutor::new();
        Ok(Self {
            config: Arc::new(config),
            coordinator: ShutdownCoordinator::new(Arc::clone(&registry), executor.clone()),
            registry,
            executor,
            workers: Mutex::new(None),
        })
    }

    /// Returns the registry backing this mailer.
    pub fn registry(&self) -> &Arc<ClusterPoolRegistry> {
        &self.registry
    }

    /// Returns the mailer configuration.
    pub fn config(&self) -> &OperationalConfig {
        &self.config
    }

    /// Sends one message through a shared connection of the cluster.
    ///
    /// A transport failure invalidates the connection used and is returned.
    pub async fn send(
        &self,
        cluster_key: ClusterKey,
        session: &Session,
        message: &OutgoingMessage,
    ) -> BatchResult<()> {
        deliver(&self.registry, &self.config, cluster_key, session, message).await
    }

    /// Sends one message on the worker pool.
    pub fn send_async(
        &self,
        cluster_key: ClusterKey,
        session: &Session,
        message: OutgoingMessage,
    ) -> BatchResult<AsyncTaskHandle<()>> {
        let workers = self.workers()?;
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let session = session.clone();

        Ok(self.executor.execute_async_in(
            &workers,
            format!("smtp-send-{}", cluster_key),
            async move { deliver(&registry, &config, cluster_key, &session, &message).await },
        ))
    }

    /// Sends every message on the worker pool and collects the results in
    /// submission order.
    pub async fn send_batch(
        &self,
        cluster_key: ClusterKey,
        session: &Session,
        messages: Vec<OutgoingMessage>,
    ) -> BatchResult<BatchSendResult> {
        let started = Instant::now();
        let handles = messages
            .into_iter()
            .map(|message| self.send_async(cluster_key, session, message))
            .collect::<BatchResult<Vec<_>>>()?;

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.wait().await);
        }

        let total = results.len();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();

        #[cfg(feature = "tracing")]
        tracing::info!(%cluster_key, total, succeeded, "Batch send finished");

        Ok(BatchSendResult {
            results,
            total,
            succeeded,
            failed: total - succeeded,
            duration: started.elapsed(),
        })
    }

    /// Verifies the session can reach the cluster's server.
    ///
    /// Borrows a connection bound to this session and health-checks it.
    pub async fn test_connection(
        &self,
        cluster_key: ClusterKey,
        session: &Session,
    ) -> BatchResult<()> {
        let pool = self.registry.register_to_cluster(&self.config, cluster_key, session)?;
        let mut transport = pool.acquire(session, true).await?;
        match transport.health_check().await {
            Ok(()) => {
                transport.release();
                Ok(())
            }
            Err(e) => {
                transport.invalidate();
                Err(e)
            }
        }
    }

    /// Shuts down every cluster pool `session` is registered to.
    pub fn shutdown_connection_pools(
        &self,
        session: &Session,
    ) -> AsyncTaskHandle<Vec<ShutdownReport>> {
        self.coordinator.shutdown_connection_pools(session)
    }

    /// Shuts down every pool.
    pub fn shutdown_all(&self) -> AsyncTaskHandle<Vec<ShutdownReport>> {
        self.coordinator.shutdown_all()
    }

    fn workers(&self) -> BatchResult<Arc<WorkerPool>> {
        let mut workers = self.workers.lock();
        if let Some(pool) = workers.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(TaskExecutor::create_default_executor_service(
            self.config.thread_pool_size,
            self.config.thread_pool_keep_alive,
        )?);
        *workers = Some(Arc::clone(&pool));
        Ok(pool)
    }
}

async fn deliver(
    registry: &ClusterPoolRegistry,
    config: &OperationalConfig,
    cluster_key: ClusterKey,
    session: &Session,
    message: &OutgoingMessage,
) -> BatchResult<()> {
    let pool = registry.register_to_cluster(config, cluster_key, session)?;
    let mut transport = pool.acquire(session, false).await?;
    match transport.send_message(message).await {
        Ok(()) => {
            transport.release();
            Ok(())
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                %cluster_key,
                handle_id = transport.id(),
                error = %e,
                "Send failed, invalidating connection"
            );
            transport.invalidate();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BatchError, BatchErrorKind};
    use crate::mocks::{test_config, test_message, test_session, MockFactory};

    #[tokio::test]
    async fn test_send_reuses_connection() {
        let factory = Arc::new(MockFactory::new());
        let mailer = BatchMailer::new(test_config(2), factory.clone()).unwrap();
        let key = ClusterKey::new();
        let session = test_session("smtp.example.com");

        mailer.send(key, &session, &test_message("a@example.com")).await.unwrap();
        mailer.send(key, &session, &test_message("b@example.com")).await.unwrap();

        assert_eq!(factory.connect_count(), 1);
        assert_eq!(factory.probes()[0].sent().len(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_invalidates_connection() {
        let factory = Arc::new(MockFactory::new());
        let mailer = BatchMailer::new(test_config(1), factory.clone()).unwrap();
        let key = ClusterKey::new();
        let session = test_session("smtp.example.com");

        mailer.send(key, &session, &test_message("a@example.com")).await.unwrap();
        factory.probes()[0].fail_next_send_with(BatchError::transport("421 closing channel"));

        let err = mailer
            .send(key, &session, &test_message("b@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), BatchErrorKind::TransportFailed);
        assert_eq!(mailer.registry().status(key).unwrap().invalid, 1);

        mailer.send(key, &session, &test_message("c@example.com")).await.unwrap();
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_check_is_sticky() {
        let factory = Arc::new(MockFactory::new());
        let mailer = BatchMailer::new(test_config(2), factory.clone()).unwrap();
        let key = ClusterKey::new();
        let session = test_session("smtp.example.com");

        mailer.test_connection(key, &session).await.unwrap();
        mailer.test_connection(key, &session).await.unwrap();

        assert_eq!(factory.connect_count(), 1);
        assert_eq!(factory.probes()[0].health_checks(), 2);
        assert!(mailer.registry().pool(key).unwrap().handles()[0].sticky);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = BatchMailer::new(test_config(0), Arc::new(MockFactory::new())).unwrap_err();
        assert_eq!(err.kind(), BatchErrorKind::ConfigInvalid);
    }
}
