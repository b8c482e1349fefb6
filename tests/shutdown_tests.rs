//! Tests for graceful pool shutdown.

use integrations_smtp_batch::mocks::{test_config, test_session, MockFactory};
use integrations_smtp_batch::{
    BatchErrorKind, ClusterKey, ClusterPoolRegistry, OperationalConfig, ShutdownCoordinator,
    TaskExecutor,
};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MockFactory>, Arc<ClusterPoolRegistry>, ShutdownCoordinator) {
    let factory = Arc::new(MockFactory::new());
    let registry = Arc::new(ClusterPoolRegistry::new(factory.clone()));
    let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), TaskExecutor::new());
    (factory, registry, coordinator)
}

#[tokio::test]
async fn test_shutdown_waits_for_borrowed_handle() {
    let (factory, registry, coordinator) = setup();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");
    registry.register_to_cluster(&test_config(2), key, &session).unwrap();

    let idle = registry.acquire_transport(key, &session, false).await.unwrap();
    let borrowed = registry.acquire_transport(key, &session, false).await.unwrap();
    idle.release();

    let shutdown = coordinator.shutdown_connection_pools(&session);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_done());

    // New work is refused while draining.
    let err = registry
        .acquire_transport(key, &session, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BatchErrorKind::PoolDraining);

    borrowed.release();
    let reports = tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].closed, 2);
    assert!(reports[0].is_clean());
    assert!(factory.probes().iter().all(|p| p.is_closed()));

    let err = registry
        .acquire_transport(key, &session, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BatchErrorKind::PoolNotFound);
}

#[tokio::test]
async fn test_close_failures_do_not_stop_the_drain() {
    let (factory, registry, coordinator) = setup();
    factory.fail_close_on_all();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");
    registry.register_to_cluster(&test_config(2), key, &session).unwrap();

    let a = registry.acquire_transport(key, &session, false).await.unwrap();
    let b = registry.acquire_transport(key, &session, false).await.unwrap();
    a.release();
    b.release();

    let reports = coordinator.shutdown_connection_pools(&session).wait().await.unwrap();
    assert_eq!(reports[0].close_failures, 2);
    assert!(factory.probes().iter().all(|p| p.close_calls() == 1));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_drain_timeout_reports_abandoned_handles() {
    let (factory, registry, coordinator) = setup();
    let config = OperationalConfig::builder()
        .max_pool_size(2)
        .drain_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");
    registry.register_to_cluster(&config, key, &session).unwrap();

    let stuck = registry.acquire_transport(key, &session, false).await.unwrap();
    let reports = coordinator.shutdown_all().wait().await.unwrap();

    assert_eq!(reports[0].abandoned, 1);
    assert!(!reports[0].is_clean());
    assert!(registry.is_empty());

    stuck.release();
    for _ in 0..50 {
        if factory.probes()[0].is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(factory.probes()[0].is_closed());
}

#[tokio::test]
async fn test_reregistration_after_shutdown_creates_fresh_pool() {
    let (factory, registry, coordinator) = setup();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");

    let old = registry.register_to_cluster(&test_config(1), key, &session).unwrap();
    registry.acquire_transport(key, &session, false).await.unwrap().release();
    coordinator.shutdown_connection_pools(&session).wait().await.unwrap();

    let fresh = registry.register_to_cluster(&test_config(1), key, &session).unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    registry.acquire_transport(key, &session, false).await.unwrap();
    assert_eq!(factory.connect_count(), 2);
}

#[tokio::test]
async fn test_cancelled_shutdown_frees_cluster_key() {
    let (factory, registry, coordinator) = setup();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");
    registry.register_to_cluster(&test_config(2), key, &session).unwrap();

    let idle = registry.acquire_transport(key, &session, false).await.unwrap();
    let borrowed = registry.acquire_transport(key, &session, false).await.unwrap();
    idle.release();

    let shutdown = coordinator.shutdown_connection_pools(&session);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_done());
    assert!(shutdown.cancel(true));
    let err = shutdown.wait().await.unwrap_err();
    assert_eq!(err.kind(), BatchErrorKind::TaskCancelled);

    assert!(registry.is_empty());
    let fresh = registry.register_to_cluster(&test_config(2), key, &session).unwrap();
    assert!(!fresh.is_draining());

    borrowed.release();
    for _ in 0..100 {
        if factory.probes().iter().all(|p| p.is_closed()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(factory.probes().iter().all(|p| p.is_closed()));
}
