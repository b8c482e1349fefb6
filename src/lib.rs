//! # SMTP Batch Dispatch Library
//!
//! Clustered SMTP connection pools with asynchronous dispatch:
//! - Per-cluster connection pools created lazily and bounded by `max_pool_size`
//! - Sticky (session-bound) and shared connection acquisition
//! - Configurable exhaustion and sticky-miss policies
//! - Background task execution with cancellable, awaitable handles
//! - Graceful pool shutdown with an optional drain timeout
//! - Per-pool metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use integrations_smtp_batch::{
//!     BatchMailer, ClusterKey, OperationalConfig, OutgoingMessage, Session, SessionConfig,
//! };
//! use integrations_smtp_batch::mocks::MockFactory;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OperationalConfig::builder().max_pool_size(2).build()?;
//!     let mailer = BatchMailer::new(config, Arc::new(MockFactory::new()))?;
//!
//!     let cluster = ClusterKey::new();
//!     let session = Session::new(
//!         SessionConfig::new("smtp.example.com", 587).credentials("user", "password"),
//!     );
//!
//!     let message = OutgoingMessage::new(
//!         "sender@example.com",
//!         vec!["recipient@example.com".to_string()],
//!         "Subject: Hello\r\n\r\nHello from Rust!\r\n",
//!     );
//!     mailer.send(cluster, &session, &message).await?;
//!
//!     let reports = mailer.shutdown_connection_pools(&session).wait().await?;
//!     println!("closed {} connections", reports[0].closed);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Transport abstractions
pub mod transport;

// Pooling
pub mod pool;
pub mod registry;

// Dispatch
pub mod executor;
pub mod shutdown;

// Observability
pub mod observability;

// Façade
pub mod mailer;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use config::{OnExhausted, OnStickyMiss, OperationalConfig, OperationalConfigBuilder};
pub use errors::{BatchError, BatchErrorKind, BatchResult, ErrorSeverity};
pub use executor::{AsyncTaskHandle, TaskExecutor, WorkerPool};
pub use mailer::BatchMailer;
pub use observability::{MetricsSnapshot, PoolMetrics};
pub use pool::{ConnectionPool, HandleInfo};
pub use registry::ClusterPoolRegistry;
pub use shutdown::ShutdownCoordinator;
pub use transport::{HandleState, PooledTransport, Transport, TransportFactory};
pub use types::{
    BatchSendResult, ClusterKey, OutgoingMessage, PoolStatus, Session, SessionConfig,
    ShutdownReport,
};
