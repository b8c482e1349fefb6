//! Operational configuration for clustered transport pools.
//!
//! Provides pool sizing, exhaustion and sticky-miss policies, idle expiry,
//! the shutdown drain timeout and worker pool settings, with a builder and
//! JSON loading.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{BatchError, BatchResult};

/// Default maximum number of live connections per cluster.
pub const DEFAULT_MAX_POOL_SIZE: usize = 4;

/// Default claim timeout when waiting with a timeout.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle expiry for connections above the core size.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(5);

/// Default worker pool size for asynchronous sends.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 10;

/// Default keep-alive for idle worker threads.
pub const DEFAULT_THREAD_POOL_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Behavior when a pool is at capacity and nothing is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// Wait until a connection is released (default).
    #[default]
    Wait,
    /// Fail immediately with `PoolExhausted`.
    Reject,
    /// Wait at most `claim_timeout`, then fail with `AcquireTimeout`.
    WaitWithTimeout,
}

/// Behavior for a sticky acquire when the session owns no idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnStickyMiss {
    /// Create a connection for the session, evicting an idle foreign one if needed (default).
    #[default]
    Create,
    /// Never evict. Fails with `PoolExhausted` if the pool is full and the
    /// session has no connection checked out that it could wait for.
    Reject,
}

/// Operational configuration shared by a cluster's pool and the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalConfig {
    /// Live connections exempt from idle expiry.
    #[serde(default)]
    pub core_pool_size: usize,
    /// Maximum number of live connections per cluster.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Claim timeout used with `OnExhausted::WaitWithTimeout`.
    #[serde(default = "default_claim_timeout", with = "humantime_serde")]
    pub claim_timeout: Duration,
    /// Exhaustion policy.
    #[serde(default)]
    pub on_exhausted: OnExhausted,
    /// Sticky miss policy.
    #[serde(default)]
    pub on_sticky_miss: OnStickyMiss,
    /// Idle expiry for connections above the core size.
    #[serde(default = "default_expire_after", with = "humantime_serde")]
    pub expire_after: Duration,
    /// Maximum time a shutdown waits for borrowed connections. `None` waits forever.
    #[serde(default, with = "humantime_serde::option")]
    pub drain_timeout: Option<Duration>,
    /// Worker pool size for asynchronous sends.
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Keep-alive for idle worker threads.
    #[serde(default = "default_thread_pool_keep_alive", with = "humantime_serde")]
    pub thread_pool_keep_alive: Duration,
}

fn default_max_pool_size() -> usize { DEFAULT_MAX_POOL_SIZE }
fn default_claim_timeout() -> Duration { DEFAULT_CLAIM_TIMEOUT }
fn default_expire_after() -> Duration { DEFAULT_EXPIRE_AFTER }
fn default_thread_pool_size() -> usize { DEFAULT_THREAD_POOL_SIZE }
fn default_thread_pool_keep_alive() -> Duration { DEFAULT_THREAD_POOL_KEEP_ALIVE }

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 0,
            max_pool_size: default_max_pool_size(),
            claim_timeout: default_claim_timeout(),
            on_exhausted: OnExhausted::default(),
            on_sticky_miss: OnStickyMiss::default(),
            expire_after: default_expire_after(),
            drain_timeout: None,
            thread_pool_size: default_thread_pool_size(),
            thread_pool_keep_alive: default_thread_pool_keep_alive(),
        }
    }
}

impl OperationalConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> OperationalConfigBuilder {
        OperationalConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> BatchResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            BatchError::configuration(format!("Failed to parse configuration: {}", e)).with_cause(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> BatchResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BatchError::configuration(format!("Failed to read {}", path.display())).with_cause(e)
        })?;
        Self::from_json(&json)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BatchResult<()> {
        if self.max_pool_size == 0 {
            return Err(BatchError::configuration("max_pool_size must be positive"));
        }

        if self.core_pool_size > self.max_pool_size {
            return Err(BatchError::configuration(
                "core_pool_size cannot exceed max_pool_size",
            ));
        }

        if self.thread_pool_size == 0 {
            return Err(BatchError::configuration("thread_pool_size must be positive"));
        }

        if self.on_exhausted == OnExhausted::WaitWithTimeout && self.claim_timeout.is_zero() {
            return Err(BatchError::configuration(
                "claim_timeout must be positive when waiting with a timeout",
            ));
        }

        Ok(())
    }
}

/// Builder for operational configuration.
#[derive(Debug, Default)]
pub struct OperationalConfigBuilder {
    config: OperationalConfig,
}

impl OperationalConfigBuilder {
    /// Sets the core pool size.
    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.config.core_pool_size = size;
        self
    }

    /// Sets the maximum pool size.
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    /// Waits at most `timeout` for a connection when the pool is exhausted.
    pub fn claim_timeout(mut self, timeout: Duration) -> Self {
        self.config.claim_timeout = timeout;
        self.config.on_exhausted = OnExhausted::WaitWithTimeout;
        self
    }

    /// Sets the exhaustion policy.
    pub fn on_exhausted(mut self, behavior: OnExhausted) -> Self {
        self.config.on_exhausted = behavior;
        self
    }

    /// Sets the sticky miss policy.
    pub fn on_sticky_miss(mut self, behavior: OnStickyMiss) -> Self {
        self.config.on_sticky_miss = behavior;
        self
    }

    /// Sets the idle expiry.
    pub fn expire_after(mut self, expiry: Duration) -> Self {
        self.config.expire_after = expiry;
        self
    }

    /// Sets the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = Some(timeout);
        self
    }

    /// Sets the worker pool size.
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        self.config.thread_pool_size = size;
        self
    }

    /// Sets the worker keep-alive.
    pub fn thread_pool_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.thread_pool_keep_alive = keep_alive;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> BatchResult<OperationalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = OperationalConfig::builder().build().unwrap();

        assert_eq!(config.max_pool_size, DEFAULT_MAX_POOL_SIZE);
        assert_eq!(config.on_exhausted, OnExhausted::Wait);
        assert_eq!(config.on_sticky_miss, OnStickyMiss::Create);
        assert!(config.drain_timeout.is_none());
    }

    #[test]
    fn test_claim_timeout_switches_policy() {
        let config = OperationalConfig::builder()
            .claim_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.on_exhausted, OnExhausted::WaitWithTimeout);
        assert_eq!(config.claim_timeout, Duration::from_millis(250));
    }

    #[rstest]
    #[case::zero_max(OperationalConfig { max_pool_size: 0, ..Default::default() })]
    #[case::core_above_max(OperationalConfig {
        core_pool_size: 5,
        max_pool_size: 2,
        ..Default::default()
    })]
    #[case::zero_threads(OperationalConfig { thread_pool_size: 0, ..Default::default() })]
    #[case::zero_claim_timeout(OperationalConfig {
        on_exhausted: OnExhausted::WaitWithTimeout,
        claim_timeout: Duration::ZERO,
        ..Default::default()
    })]
    fn test_config_validation_rejects(#[case] config: OperationalConfig) {
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::errors::BatchErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_from_json() {
        let config = OperationalConfig::from_json(
            r#"{
                "max_pool_size": 2,
                "on_exhausted": "wait_with_timeout",
                "claim_timeout": "500ms",
                "drain_timeout": "10s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_pool_size, 2);
        assert_eq!(config.claim_timeout, Duration::from_millis(500));
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.expire_after, DEFAULT_EXPIRE_AFTER);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(OperationalConfig::from_json(r#"{"max_pool_size": 0}"#).is_err());
        assert!(OperationalConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_pool_size": 3, "on_sticky_miss": "reject"}}"#).unwrap();

        let config = OperationalConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.on_sticky_miss, OnStickyMiss::Reject);
    }
}
