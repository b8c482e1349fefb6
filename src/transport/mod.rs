//! Transport layer abstractions.
//!
//! The pool never speaks SMTP itself. It borrows connections produced by a
//! [`TransportFactory`] and hands them out wrapped in a [`PooledTransport`],
//! which returns the connection to its pool when released or dropped.

use async_trait::async_trait;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::errors::BatchResult;
use crate::pool::ConnectionPool;
use crate::types::{ClusterKey, OutgoingMessage, Session};

/// A live connection to a mail server.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns false once the connection is known to be unusable.
    fn is_connected(&self) -> bool;

    /// Sends one encoded message.
    async fn send_message(&mut self, message: &OutgoingMessage) -> BatchResult<()>;

    /// Performs a health check (NOOP).
    async fn health_check(&mut self) -> BatchResult<()>;

    /// Closes the connection gracefully.
    async fn close(&mut self) -> BatchResult<()>;
}

/// Produces live connections for a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a connection using the session's settings.
    async fn connect(&self, session: &Session) -> BatchResult<Box<dyn Transport>>;
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Parked in the pool, ready to be acquired.
    Idle,
    /// Checked out by exactly one caller.
    Borrowed,
    /// Failed while in use; never handed out again.
    Invalid,
    /// Closed. Terminal.
    Closed,
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the underlying [`Transport`]. Calling [`release`] or simply
/// dropping the wrapper returns the connection to the pool; [`invalidate`]
/// retires it instead.
///
/// [`release`]: PooledTransport::release
/// [`invalidate`]: PooledTransport::invalidate
pub struct PooledTransport {
    pool: Arc<ConnectionPool>,
    id: u64,
    session: Session,
    sticky: bool,
    transport: Option<Box<dyn Transport>>,
}

impl PooledTransport {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        id: u64,
        session: Session,
        sticky: bool,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            pool,
            id,
            session,
            sticky,
            transport: Some(transport),
        }
    }

    /// Returns the pool-assigned handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the session this connection was created from.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns true if the connection was created by a sticky acquire.
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Returns the cluster this connection belongs to.
    pub fn cluster_key(&self) -> ClusterKey {
        self.pool.cluster_key()
    }

    /// Returns the connection to the pool for reuse.
    pub fn release(mut self) {
        self.check_in(false);
    }

    /// Marks the connection as failed so it is never handed out again.
    pub fn invalidate(mut self) {
        self.check_in(true);
    }

    fn check_in(&mut self, failed: bool) {
        if let Some(transport) = self.transport.take() {
            self.pool.check_in(self.id, transport, failed);
        }
    }
}

impl Deref for PooledTransport {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport
            .as_deref()
            .expect("transport is present until the handle is checked in")
    }
}

impl DerefMut for PooledTransport {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport
            .as_deref_mut()
            .expect("transport is present until the handle is checked in")
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        self.check_in(false);
    }
}

impl fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTransport")
            .field("cluster_key", &self.pool.cluster_key())
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("sticky", &self.sticky)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_state_debug() {
        assert!(format!("{:?}", HandleState::Borrowed).contains("Borrowed"));
        assert_ne!(HandleState::Idle, HandleState::Closed);
    }
}
