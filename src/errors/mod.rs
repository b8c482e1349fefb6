//! Error types for the batch module.
//!
//! Provides a single error type for pool, registry, executor and shutdown
//! failures, with retryability detection and severity classification.

use std::fmt;
use thiserror::Error;

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchErrorKind {
    // Registry errors
    /// No pool is registered for the cluster key.
    PoolNotFound,
    /// The pool is draining and does not hand out connections.
    PoolDraining,

    // Pool errors
    /// Pool is at capacity and the configured policy does not wait.
    PoolExhausted,
    /// Waiting for a connection exceeded the claim timeout.
    AcquireTimeout,
    /// The transport factory failed to produce a connection.
    ConnectionCreationFailed,
    /// A borrowed transport failed while in use.
    TransportFailed,
    /// A transport could not be closed cleanly.
    CloseFailed,

    // Executor errors
    /// The dispatched operation failed or panicked.
    TaskFailed,
    /// The dispatched operation was cancelled.
    TaskCancelled,
    /// No worker could be started for the operation.
    ExecutorUnavailable,

    // Configuration errors
    /// Configuration is invalid.
    ConfigInvalid,
}

impl BatchErrorKind {
    /// Returns true if this error kind is typically retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchErrorKind::PoolDraining
                | BatchErrorKind::PoolExhausted
                | BatchErrorKind::AcquireTimeout
                | BatchErrorKind::ConnectionCreationFailed
                | BatchErrorKind::TransportFailed
        )
    }

    /// Returns the severity level of this error kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BatchErrorKind::ConfigInvalid | BatchErrorKind::ExecutorUnavailable => {
                ErrorSeverity::Critical
            }

            BatchErrorKind::PoolNotFound
            | BatchErrorKind::ConnectionCreationFailed
            | BatchErrorKind::TransportFailed
            | BatchErrorKind::TaskFailed => ErrorSeverity::Error,

            BatchErrorKind::PoolExhausted
            | BatchErrorKind::AcquireTimeout
            | BatchErrorKind::CloseFailed => ErrorSeverity::Warning,

            BatchErrorKind::PoolDraining | BatchErrorKind::TaskCancelled => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for BatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchErrorKind::PoolNotFound => write!(f, "Connection pool not found"),
            BatchErrorKind::PoolDraining => write!(f, "Connection pool is draining"),
            BatchErrorKind::PoolExhausted => write!(f, "Connection pool exhausted"),
            BatchErrorKind::AcquireTimeout => write!(f, "Pool acquire timeout"),
            BatchErrorKind::ConnectionCreationFailed => write!(f, "Connection creation failed"),
            BatchErrorKind::TransportFailed => write!(f, "Transport failed"),
            BatchErrorKind::CloseFailed => write!(f, "Transport close failed"),
            BatchErrorKind::TaskFailed => write!(f, "Task failed"),
            BatchErrorKind::TaskCancelled => write!(f, "Task cancelled"),
            BatchErrorKind::ExecutorUnavailable => write!(f, "Executor unavailable"),
            BatchErrorKind::ConfigInvalid => write!(f, "Invalid configuration"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected during normal operation, such as shutdown.
    Info,
    /// Transient; retrying later may succeed.
    Warning,
    /// The operation failed.
    Error,
    /// Misconfiguration or an unusable executor.
    Critical,
}

/// Batch module error with detailed information.
#[derive(Error, Debug)]
pub struct BatchError {
    kind: BatchErrorKind,
    message: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BatchError {
    /// Creates a new error.
    pub fn new(kind: BatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> BatchErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the underlying cause, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    // Convenience constructors

    /// Creates a pool-not-found error for the given cluster key.
    pub fn pool_not_found(cluster_key: impl fmt::Display) -> Self {
        Self::new(
            BatchErrorKind::PoolNotFound,
            format!(
                "no connection pool for cluster {}; \
                 register_to_cluster was never called for this key",
                cluster_key
            ),
        )
    }

    /// Creates a pool draining error.
    pub fn draining(cluster_key: impl fmt::Display) -> Self {
        Self::new(
            BatchErrorKind::PoolDraining,
            format!(
                "connection pool for cluster {} is shutting down; retry after shutdown completes",
                cluster_key
            ),
        )
    }

    /// Creates a pool error.
    pub fn pool(kind: BatchErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a connection creation error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(BatchErrorKind::ConnectionCreationFailed, message)
    }

    /// Creates a transport failure error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BatchErrorKind::TransportFailed, message)
    }

    /// Creates a task failure error.
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(BatchErrorKind::TaskFailed, message)
    }

    /// Creates a task cancelled error.
    pub fn cancelled(process_name: &str) -> Self {
        Self::new(
            BatchErrorKind::TaskCancelled,
            format!("task '{}' was cancelled", process_name),
        )
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(BatchErrorKind::ConfigInvalid, message)
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}
