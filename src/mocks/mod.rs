//! Mock implementations for testing.
//!
//! Provides an in-memory transport, a factory that records every connection it
//! opens, and helpers for building sessions and messages.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OperationalConfig;
use crate::errors::{BatchError, BatchResult};
use crate::transport::{Transport, TransportFactory};
use crate::types::{OutgoingMessage, Session, SessionConfig};

#[derive(Debug)]
struct TransportState {
    connected: bool,
    closed: bool,
    close_calls: usize,
    health_checks: usize,
    sent: Vec<OutgoingMessage>,
    fail_next_send: Option<BatchError>,
    fail_close: bool,
    close_delay: Option<Duration>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            connected: true,
            closed: false,
            close_calls: 0,
            health_checks: 0,
            sent: Vec::new(),
            fail_next_send: None,
            fail_close: false,
            close_delay: None,
        }
    }
}

/// Observes and steers a [`MockTransport`] after it was handed to a pool.
#[derive(Debug, Clone)]
pub struct TransportProbe {
    serial: usize,
    session: Session,
    state: Arc<Mutex<TransportState>>,
}

impl TransportProbe {
    /// Returns the order in which the factory created the transport, from 0.
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Returns the session the transport was created from.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns messages sent through the transport.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.state.lock().sent.clone()
    }

    /// Returns the number of health checks performed.
    pub fn health_checks(&self) -> usize {
        self.state.lock().health_checks
    }

    /// Returns true once `close` succeeded.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of `close` calls, successful or not.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Simulates the server dropping the connection.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Makes the next send fail with `error`.
    pub fn fail_next_send_with(&self, error: BatchError) {
        self.state.lock().fail_next_send = Some(error);
    }

    /// Makes every `close` call fail.
    pub fn fail_close(&self) {
        self.state.lock().fail_close = true;
    }

    /// Makes every `close` call take `delay` before it takes effect.
    pub fn set_close_delay(&self, delay: Duration) {
        self.state.lock().close_delay = Some(delay);
    }
}

/// Mock transport for testing.
#[derive(Debug)]
pub struct MockTransport {
    probe: TransportProbe,
}

impl MockTransport {
    /// Creates a connected transport for the session, with a probe to inspect it.
    pub fn new(session: &Session) -> (Self, TransportProbe) {
        Self::with_serial(session, 0)
    }

    fn with_serial(session: &Session, serial: usize) -> (Self, TransportProbe) {
        let probe = TransportProbe {
            serial,
            session: session.clone(),
            state: Arc::new(Mutex::new(TransportState::default())),
        };
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        let state = self.probe.state.lock();
        state.connected && !state.closed
    }

    async fn send_message(&mut self, message: &OutgoingMessage) -> BatchResult<()> {
        let mut state = self.probe.state.lock();
        if let Some(error) = state.fail_next_send.take() {
            return Err(error);
        }
        if !state.connected || state.closed {
            return Err(BatchError::transport("connection lost"));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    async fn health_check(&mut self) -> BatchResult<()> {
        let mut state = self.probe.state.lock();
        state.health_checks += 1;
        if state.connected {
            Ok(())
        } else {
            Err(BatchError::transport("NOOP failed: connection lost"))
        }
    }

    async fn close(&mut self) -> BatchResult<()> {
        let delay = self.probe.state.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.probe.state.lock();
        state.close_calls += 1;
        state.connected = false;
        if state.fail_close {
            return Err(BatchError::new(
                crate::errors::BatchErrorKind::CloseFailed,
                "QUIT rejected",
            ));
        }
        state.closed = true;
        Ok(())
    }
}

/// Mock transport factory recording every transport it creates.
#[derive(Debug, Default)]
pub struct MockFactory {
    created: Mutex<Vec<TransportProbe>>,
    failures: Mutex<VecDeque<BatchError>>,
    connect_delay: Mutex<Option<Duration>>,
    fail_close: Mutex<bool>,
    close_delay: Mutex<Option<Duration>>,
}

impl MockFactory {
    /// Creates a factory whose connections always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `connect` call fail with `error`. Calls queue up.
    pub fn fail_next_with(&self, error: BatchError) -> &Self {
        self.failures.lock().push_back(error);
        self
    }

    /// Delays every `connect` call.
    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        *self.connect_delay.lock() = Some(delay);
        self
    }

    /// Makes `close` fail on every transport created from now on.
    pub fn fail_close_on_all(&self) -> &Self {
        *self.fail_close.lock() = true;
        self
    }

    /// Delays `close` on every transport created from now on.
    pub fn set_close_delay(&self, delay: Duration) -> &Self {
        *self.close_delay.lock() = Some(delay);
        self
    }

    /// Returns the number of transports created.
    pub fn connect_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Returns probes for every transport created, in creation order.
    pub fn probes(&self) -> Vec<TransportProbe> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, session: &Session) -> BatchResult<Box<dyn Transport>> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let mut created = self.created.lock();
        let (transport, probe) = MockTransport::with_serial(session, created.len());
        if *self.fail_close.lock() {
            probe.fail_close();
        }
        if let Some(delay) = *self.close_delay.lock() {
            probe.set_close_delay(delay);
        }
        created.push(probe);
        Ok(Box::new(transport))
    }
}

/// Creates a session for the given host with test credentials.
pub fn test_session(host: &str) -> Session {
    Session::new(SessionConfig::new(host, 587).credentials("user@example.com", "password"))
}

/// Creates a test message.
pub fn test_message(to: &str) -> OutgoingMessage {
    OutgoingMessage::new(
        "sender@example.com",
        vec![to.to_string()],
        format!("Subject: Test\r\n\r\nHello {}\r\n", to),
    )
}

/// Creates a configuration with the given maximum pool size.
pub fn test_config(max_pool_size: usize) -> OperationalConfig {
    OperationalConfig {
        max_pool_size,
        ..Default::default()
    }
}
