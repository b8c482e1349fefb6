//! Batch Send Example
//!
//! This example demonstrates how to:
//! - Register two sessions to one cluster
//! - Send a batch of messages through the shared pool
//! - Check a session's own connection
//! - Shut the cluster's pool down and inspect the report
//!
//! Connections come from the in-memory mock factory, so no server is needed.

use integrations_smtp_batch::mocks::MockFactory;
use integrations_smtp_batch::{
    BatchError, BatchMailer, ClusterKey, OnExhausted, OperationalConfig, OutgoingMessage, Session,
    SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), BatchError> {
    let config = OperationalConfig::builder()
        .max_pool_size(2)
        .on_exhausted(OnExhausted::Wait)
        .drain_timeout(Duration::from_secs(5))
        .thread_pool_size(4)
        .build()?;

    let factory = Arc::new(MockFactory::new());
    let mailer = BatchMailer::new(config, factory.clone())?;

    let cluster = ClusterKey::new();
    let newsletter = Session::new(
        SessionConfig::new("smtp.example.com", 587)
            .credentials("newsletter@example.com", "your-password")
            .tls(true),
    );
    let alerts = Session::new(
        SessionConfig::new("smtp.example.com", 587)
            .credentials("alerts@example.com", "your-password")
            .tls(true),
    );

    println!("Checking connections...");
    mailer.test_connection(cluster, &newsletter).await?;
    mailer.test_connection(cluster, &alerts).await?;

    let messages = (1..=10)
        .map(|i| {
            OutgoingMessage::new(
                "newsletter@example.com",
                vec![format!("subscriber{}@example.com", i)],
                format!("Subject: Issue #{}\r\n\r\nThanks for reading!\r\n", i),
            )
        })
        .collect();

    println!("Sending batch...");
    let result = mailer.send_batch(cluster, &newsletter, messages).await?;
    println!(
        "Sent {}/{} messages in {:?}",
        result.succeeded, result.total, result.duration
    );
    for failure in result.failures() {
        println!("  failed: {}", failure);
    }

    let status = mailer.registry().status(cluster)?;
    println!(
        "Pool: {} live, {} idle, {} in use (max {})",
        status.total, status.idle, status.in_use, status.max_size
    );
    println!("Connections opened: {}", factory.connect_count());

    println!("Shutting down...");
    for report in mailer.shutdown_connection_pools(&newsletter).wait().await? {
        println!(
            "Cluster {}: closed {}, close failures {}, abandoned {} ({:?})",
            report.cluster_key,
            report.closed,
            report.close_failures,
            report.abandoned,
            report.duration
        );
    }

    Ok(())
}
