//! Election timing configuration
//!
//! Values are layered with figment: built-in defaults first, then any
//! `SAH_ELECTION_*` environment variables. Durations are expressed in
//! milliseconds, e.g. `SAH_ELECTION_POLL_INTERVAL_MS=5000`.

use std::time::Duration;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ElectionError, Result};

/// Environment variable prefix for election settings
pub const ENV_PREFIX: &str = "SAH_ELECTION_";

/// Configuration for a [`LeaderElection`](crate::LeaderElection)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Session lease TTL
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,

    /// Upper bound on a single session negotiation
    #[serde(rename = "session_timeout_ms", with = "millis")]
    pub session_timeout: Duration,

    /// Period of the fallback leader poll
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Delay before retrying after a failed session negotiation
    #[serde(rename = "session_retry_delay_ms", with = "millis")]
    pub session_retry_delay: Duration,

    /// Delay before starting a new cycle after an observation failure
    #[serde(rename = "cycle_retry_delay_ms", with = "millis")]
    pub cycle_retry_delay: Duration,

    /// How long `start` waits for a leader to be determined
    #[serde(rename = "ready_timeout_ms", with = "millis")]
    pub ready_timeout: Duration,

    /// Consecutive transient poll failures tolerated before the cycle is
    /// abandoned. Zero disables the limit.
    pub max_poll_failures: u32,

    /// Prefix for generated candidate ids, typically the host address
    pub id_prefix: Option<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            session_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(20),
            session_retry_delay: Duration::from_secs(5),
            cycle_retry_delay: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            max_poll_failures: 3,
            id_prefix: None,
        }
    }
}

impl ElectionConfig {
    /// Create a configuration with the default timings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from defaults and `SAH_ELECTION_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_figment(Figment::new().merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract configuration from a caller-supplied figment layered over the defaults
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(figment)
            .extract()?;
        config.validate()?;
        debug!(?config, "Loaded election configuration");
        Ok(config)
    }

    /// Check that every timing is usable
    pub fn validate(&self) -> Result<()> {
        if self.ttl < Duration::from_secs(1) {
            return Err(invalid("ttl", "must be at least one second"));
        }
        for (key, value) in [
            ("session_timeout", self.session_timeout),
            ("poll_interval", self.poll_interval),
            ("ready_timeout", self.ready_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if matches!(&self.id_prefix, Some(prefix) if prefix.is_empty()) {
            return Err(invalid("id_prefix", "must not be empty when set"));
        }
        Ok(())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_session_retry_delay(mut self, delay: Duration) -> Self {
        self.session_retry_delay = delay;
        self
    }

    pub fn with_cycle_retry_delay(mut self, delay: Duration) -> Self {
        self.cycle_retry_delay = delay;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_max_poll_failures(mut self, failures: u32) -> Self {
        self.max_poll_failures = failures;
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }
}

fn invalid(key: &str, message: &str) -> ElectionError {
    ElectionError::InvalidConfig {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds
mod millis {
    use std::time::Duration;

    use serde::{ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(ser::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    #[test]
    fn test_default_timings() {
        let config = ElectionConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(20));
        assert_eq!(config.session_retry_delay, Duration::from_secs(5));
        assert_eq!(config.cycle_retry_delay, Duration::from_secs(1));
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.max_poll_failures, 3);
        assert!(config.id_prefix.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_figment_overrides_defaults() {
        let overrides = Figment::new()
            .merge(Serialized::default("poll_interval_ms", 2_500u64))
            .merge(Serialized::default("max_poll_failures", 0u32))
            .merge(Serialized::default("id_prefix", "10.0.0.7"));

        let config = ElectionConfig::from_figment(overrides).unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.max_poll_failures, 0);
        assert_eq!(config.id_prefix.as_deref(), Some("10.0.0.7"));
        assert_eq!(config.ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_from_figment_rejects_invalid_ttl() {
        let overrides = Figment::new().merge(Serialized::default("ttl_ms", 500u64));

        let err = ElectionConfig::from_figment(overrides).unwrap_err();
        assert!(matches!(err, ElectionError::InvalidConfig { ref key, .. } if key == "ttl"));
    }

    #[test]
    fn test_from_figment_reports_type_errors() {
        let overrides = Figment::new().merge(Serialized::default("ttl_ms", "soon"));

        let err = ElectionConfig::from_figment(overrides).unwrap_err();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = ElectionConfig::new().with_poll_interval(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn test_oversized_duration_is_rejected_not_truncated() {
        let config = ElectionConfig::new().with_ready_timeout(Duration::MAX);

        let err = ElectionConfig::from_figment(Figment::from(Serialized::defaults(config)))
            .unwrap_err();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_empty_prefix() {
        let config = ElectionConfig::new().with_id_prefix("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = ElectionConfig::new()
            .with_ttl(Duration::from_secs(3))
            .with_session_timeout(Duration::from_secs(2))
            .with_session_retry_delay(Duration::from_millis(50))
            .with_cycle_retry_delay(Duration::from_millis(20))
            .with_ready_timeout(Duration::from_secs(4))
            .with_max_poll_failures(9);

        assert_eq!(config.ttl, Duration::from_secs(3));
        assert_eq!(config.session_timeout, Duration::from_secs(2));
        assert_eq!(config.session_retry_delay, Duration::from_millis(50));
        assert_eq!(config.cycle_retry_delay, Duration::from_millis(20));
        assert_eq!(config.ready_timeout, Duration::from_secs(4));
        assert_eq!(config.max_poll_failures, 9);
    }
}
