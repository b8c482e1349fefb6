//! Core types shared by the pool, registry and dispatcher.
//!
//! This module provides:
//! - Cluster keys naming a logical mail server configuration
//! - Sessions describing how to connect to that server
//! - Messages handed to a transport
//! - Pool status, shutdown and batch result types

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::BatchError;

/// Opaque identifier naming one logical mail server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterKey(Uuid);

impl ClusterKey {
    /// Creates a new random cluster key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing identifier.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying identifier.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClusterKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Connection settings supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password.
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Whether the transport negotiates TLS.
    #[serde(default)]
    pub tls: bool,
    /// Free-form protocol properties passed through to the transport factory.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl SessionConfig {
    /// Creates settings for the given server.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets whether TLS is used.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Adds a protocol property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    config: SessionConfig,
}

/// Caller-owned connection settings, observed and compared by the pool.
///
/// Clones share identity; two sessions built separately from equal settings
/// are equivalent but not identical.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session with a fresh identity.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                config,
            }),
        }
    }

    /// Returns the identity of this session.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the connection settings.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns true if both values refer to the same session.
    pub fn same_identity(&self, other: &Session) -> bool {
        self.inner.id == other.inner.id
    }

    /// Returns true if both sessions connect to the same server as the same user.
    pub fn is_equivalent(&self, other: &Session) -> bool {
        let (a, b) = (self.config(), other.config());
        a.host == b.host && a.port == b.port && a.username == b.username && a.tls == b.tls
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config().username {
            Some(user) => write!(f, "{}@{} [{}]", user, self.config().address(), self.id()),
            None => write!(f, "{} [{}]", self.config().address(), self.id()),
        }
    }
}

/// A fully encoded message ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients.
    pub recipients: Vec<String>,
    /// Encoded message content.
    pub data: Vec<u8>,
}

impl OutgoingMessage {
    /// Creates a message.
    pub fn new(from: impl Into<String>, recipients: Vec<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            from: from.into(),
            recipients,
            data: data.into(),
        }
    }
}

/// Connection pool status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live connections (idle, in use, or being created).
    pub total: usize,
    /// Idle connections.
    pub idle: usize,
    /// In-use connections.
    pub in_use: usize,
    /// Invalidated connections awaiting close.
    pub invalid: usize,
    /// Connections currently being created.
    pub pending: usize,
    /// Maximum pool size.
    pub max_size: usize,
    /// True once shutdown has started.
    pub draining: bool,
}

/// Outcome of draining one cluster's pool.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Cluster the pool belonged to.
    pub cluster_key: ClusterKey,
    /// Transports closed cleanly.
    pub closed: usize,
    /// Transports whose close failed.
    pub close_failures: usize,
    /// Borrowed transports still out when the drain timeout fired.
    pub abandoned: usize,
    /// Time spent draining and closing.
    pub duration: Duration,
}

impl ShutdownReport {
    /// Returns true if every transport was returned and closed cleanly.
    pub fn is_clean(&self) -> bool {
        self.close_failures == 0 && self.abandoned == 0
    }
}

/// Result of a batch send.
#[derive(Debug)]
pub struct BatchSendResult {
    /// Individual results, in submission order.
    pub results: Vec<Result<(), BatchError>>,
    /// Total messages attempted.
    pub total: usize,
    /// Successfully sent count.
    pub succeeded: usize,
    /// Failed count.
    pub failed: usize,
    /// Total duration.
    pub duration: Duration,
}

impl BatchSendResult {
    /// Returns true if all messages were sent successfully.
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0
    }

    /// Returns an iterator over failed results.
    pub fn failures(&self) -> impl Iterator<Item = &BatchError> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }
}
