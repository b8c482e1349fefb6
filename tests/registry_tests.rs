//! Tests for cluster registration.

use integrations_smtp_batch::mocks::{test_config, test_session, MockFactory};
use integrations_smtp_batch::{BatchErrorKind, ClusterKey, ClusterPoolRegistry};
use rstest::rstest;
use std::sync::{Arc, Barrier};
use std::thread;

#[rstest]
#[case(2)]
#[case(8)]
#[case(32)]
fn test_concurrent_registration_creates_one_pool(#[case] callers: usize) {
    let registry = Arc::new(ClusterPoolRegistry::new(Arc::new(MockFactory::new())));
    let key = ClusterKey::new();
    let barrier = Arc::new(Barrier::new(callers));

    let threads: Vec<_> = (0..callers)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = test_session("smtp.example.com");
                barrier.wait();
                registry.register_to_cluster(&test_config(2), key, &session).unwrap()
            })
        })
        .collect();
    let pools: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(registry.len(), 1);
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    assert_eq!(pools[0].members().len(), callers);
}

#[test]
fn test_second_registration_does_not_reconfigure() {
    let registry = ClusterPoolRegistry::new(Arc::new(MockFactory::new()));
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");

    registry.register_to_cluster(&test_config(2), key, &session).unwrap();
    registry.register_to_cluster(&test_config(10), key, &session).unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.status(key).unwrap().max_size, 2);
    assert_eq!(registry.pool(key).unwrap().members().len(), 1);
}

#[tokio::test]
async fn test_acquire_without_registration_fails() {
    let registry = ClusterPoolRegistry::new(Arc::new(MockFactory::new()));
    let err = registry
        .acquire_transport(ClusterKey::new(), &test_session("smtp.example.com"), false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), BatchErrorKind::PoolNotFound);
    assert!(err.to_string().contains("register_to_cluster"));
}

#[tokio::test]
async fn test_clusters_are_isolated() {
    let factory = Arc::new(MockFactory::new());
    let registry = ClusterPoolRegistry::new(factory.clone());
    let (k1, k2) = (ClusterKey::new(), ClusterKey::new());
    let session = test_session("smtp.example.com");
    registry.register_to_cluster(&test_config(1), k1, &session).unwrap();
    registry.register_to_cluster(&test_config(1), k2, &session).unwrap();

    let _a = registry.acquire_transport(k1, &session, false).await.unwrap();
    let _b = registry.acquire_transport(k2, &session, false).await.unwrap();

    assert_eq!(factory.connect_count(), 2);
    assert_eq!(registry.status(k1).unwrap().in_use, 1);
    assert_eq!(registry.status(k2).unwrap().in_use, 1);
    assert_eq!(registry.clusters_for(&session).len(), 2);
}
