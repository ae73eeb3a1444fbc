//! Configuration for the domain controller.

use std::time::Duration;

use crate::constants::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_PING_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::types::ManagementVersion;

/// Tunables of the coordination layer.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// How often each registered host is probed when its connection has
    /// been silent. Any inbound traffic within the interval counts as
    /// liveness and skips the probe.
    ///
    /// Default: 15s
    pub heartbeat_interval: Duration,

    /// How long a probe waits for its reply before the host is declared
    /// unreachable and the connection closed.
    ///
    /// Default: 5s
    pub ping_timeout: Duration,

    /// Oldest management version a joining host may advertise.
    pub min_management_version: ManagementVersion,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            min_management_version: ManagementVersion::MIN_SUPPORTED,
        }
    }
}

impl DomainConfig {
    /// Config with a custom heartbeat interval; the ping timeout scales to
    /// a third of the interval, floored at 100ms.
    pub fn with_heartbeat_interval(interval: Duration) -> Self {
        DomainConfig {
            heartbeat_interval: interval,
            ping_timeout: (interval / 3).max(Duration::from_millis(100)),
            ..Default::default()
        }
    }

    /// Longest a silent, unreachable host can linger before its probe
    /// fails: one full interval plus the probe timeout.
    pub fn detection_time(&self) -> Duration {
        self.heartbeat_interval + self.ping_timeout
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.ping_timeout.is_zero() {
            return Err(Error::Config("ping_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DomainConfig::default().validate().is_ok());
    }

    #[test]
    fn custom_interval_scales_timeout() {
        let config = DomainConfig::with_heartbeat_interval(Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.ping_timeout, Duration::from_secs(10));
    }

    #[test]
    fn short_interval_keeps_timeout_floor() {
        let config = DomainConfig::with_heartbeat_interval(Duration::from_millis(120));
        assert_eq!(config.ping_timeout, Duration::from_millis(100));
    }

    #[test]
    fn detection_time_sums_interval_and_timeout() {
        let config = DomainConfig::with_heartbeat_interval(Duration::from_secs(15));
        assert_eq!(config.detection_time(), Duration::from_secs(20));
    }

    #[test]
    fn validation_rejects_zero_durations() {
        let mut config = DomainConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = DomainConfig::default();
        config.ping_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
