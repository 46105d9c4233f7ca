//! Connection configuration and tunables

use std::time::Duration;

use crate::error::QueueError;

/// Default liveness refresh interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default TTL on the heartbeat key; a connection whose key has expired is
/// considered dead by the cleaner
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(60);

/// Default pause applied when a consumer receives a Sleep signal
pub const DEFAULT_SIGNAL_SLEEP: Duration = Duration::from_secs(1);

/// Configuration for a queue connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Redis connection URL
    pub url: String,
    /// How often the heartbeat key is refreshed
    pub heartbeat_interval: Duration,
    /// TTL written with each heartbeat refresh; must comfortably exceed
    /// the interval
    pub heartbeat_ttl: Duration,
    /// How long a consumer pauses on a Sleep signal
    pub signal_sleep: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
            signal_sleep: DEFAULT_SIGNAL_SLEEP,
        }
    }
}

impl ConnectionConfig {
    /// Create config with a custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Validate tunables before a connection is opened
    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.heartbeat_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "heartbeat interval must be non-zero".into(),
            ));
        }
        if self.heartbeat_ttl < self.heartbeat_interval * 2 {
            return Err(QueueError::InvalidConfig(format!(
                "heartbeat TTL {:?} must be at least twice the interval {:?}",
                self.heartbeat_ttl, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_with_url() {
        let config = ConnectionConfig::with_url("redis://custom:6380");
        assert_eq!(config.url, "redis://custom:6380");
    }

    #[test]
    fn test_config_rejects_tight_ttl() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(15),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
