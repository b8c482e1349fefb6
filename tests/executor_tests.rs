//! Tests for asynchronous task dispatch.

use integrations_smtp_batch::mocks::{test_config, test_message, test_session, MockFactory};
use integrations_smtp_batch::{
    BatchError, BatchErrorKind, BatchMailer, ClusterKey, TaskExecutor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_failing_task_reports_error_and_tears_down_worker() {
    let executor = TaskExecutor::new();
    let failures = Arc::new(AtomicUsize::new(0));

    let handle = executor.execute_async("deliver-digest", async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<(), _>(BatchError::transport("554 transaction failed"))
    });
    let counter = Arc::clone(&failures);
    handle.on_failure(move |e| {
        assert_eq!(e.kind(), BatchErrorKind::TransportFailed);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), BatchErrorKind::TransportFailed);
    assert!(err.message().contains("554 transaction failed"));
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    for _ in 0..100 {
        if executor.active_single_use_workers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executor.active_single_use_workers(), 0);
}

#[test]
fn test_successful_task_result() {
    let executor = TaskExecutor::new();
    let handle = executor.execute_async("count", async { Ok(21 * 2) });
    assert_eq!(tokio_test::assert_ok!(handle.blocking_wait()), 42);
}

#[tokio::test]
async fn test_send_batch_collects_results_in_order() {
    let factory = Arc::new(MockFactory::new());
    let mailer = BatchMailer::new(test_config(2), factory.clone()).unwrap();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");

    let messages = (0..6)
        .map(|i| test_message(&format!("user{}@example.com", i)))
        .collect();
    let result = mailer.send_batch(key, &session, messages).await.unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.total, 6);
    assert_eq!(result.succeeded, 6);
    assert!(factory.connect_count() <= 2);

    let sent: usize = factory.probes().iter().map(|p| p.sent().len()).sum();
    assert_eq!(sent, 6);
}

#[tokio::test]
async fn test_send_batch_reports_individual_failures() {
    let factory = Arc::new(MockFactory::new());
    factory.fail_next_with(BatchError::transport("connection refused"));
    let config = integrations_smtp_batch::OperationalConfig::builder()
        .max_pool_size(1)
        .thread_pool_size(1)
        .build()
        .unwrap();
    let mailer = BatchMailer::new(config, factory.clone()).unwrap();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");

    let messages = vec![test_message("a@example.com"), test_message("b@example.com")];
    let result = mailer.send_batch(key, &session, messages).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.succeeded, 1);
    let failure = result.failures().next().unwrap();
    assert_eq!(failure.kind(), BatchErrorKind::ConnectionCreationFailed);
}

#[tokio::test]
async fn test_mailer_shutdown_after_async_sends() {
    let factory = Arc::new(MockFactory::new());
    let mailer = BatchMailer::new(test_config(2), factory.clone()).unwrap();
    let key = ClusterKey::new();
    let session = test_session("smtp.example.com");

    let handle = mailer
        .send_async(key, &session, test_message("a@example.com"))
        .unwrap();
    handle.wait().await.unwrap();

    let reports = mailer.shutdown_connection_pools(&session).wait().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].closed, 1);
    assert!(mailer.registry().is_empty());
}
