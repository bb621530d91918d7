//! Engine configuration.

use crate::error::{Result, TunnelError};
use std::time::Duration;
use yuki_tun::MAX_PACKET_SIZE;

/// Tunnel engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Upper bound on a single interface read before timers are checked
    pub poll_interval: Duration,
    /// Session ends when the peer has been silent this long
    pub keepalive_timeout: Duration,
    /// Initiator sends a ping this often
    pub keepalive_interval: Duration,
    /// Deadline for the peer's handshake record
    pub handshake_timeout: Duration,
    /// Allowance applied to clients whose record sets none (0 = unlimited)
    pub default_max_bandwidth: u64,
    /// Interface read buffer size
    pub read_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            default_max_bandwidth: 0,
            read_buffer_size: MAX_PACKET_SIZE,
        }
    }
}

impl TunnelConfig {
    /// Set the interface poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the idle deadline.
    #[must_use]
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the handshake deadline.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the default bandwidth allowance.
    #[must_use]
    pub fn with_default_max_bandwidth(mut self, bytes: u64) -> Self {
        self.default_max_bandwidth = bytes;
        self
    }

    /// Set the interface read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Allowance for a client whose record carries `record_limit`.
    #[must_use]
    pub fn effective_bandwidth(&self, record_limit: u64) -> u64 {
        if record_limit > 0 {
            record_limit
        } else {
            self.default_max_bandwidth
        }
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(TunnelError::Config("poll_interval must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TunnelError::Config(
                "handshake_timeout must be non-zero".into(),
            ));
        }
        if self.keepalive_timeout <= self.poll_interval {
            return Err(TunnelError::Config(format!(
                "keepalive_timeout ({:?}) must exceed poll_interval ({:?})",
                self.keepalive_timeout, self.poll_interval
            )));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.keepalive_timeout {
            return Err(TunnelError::Config(format!(
                "keepalive_interval ({:?}) must be non-zero and below keepalive_timeout ({:?})",
                self.keepalive_interval, self.keepalive_timeout
            )));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > MAX_PACKET_SIZE {
            return Err(TunnelError::Config(format!(
                "read_buffer_size must be in 1..={MAX_PACKET_SIZE}, got {}",
                self.read_buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = TunnelConfig::default()
            .with_poll_interval(Duration::from_millis(100))
            .with_keepalive_timeout(Duration::from_secs(5))
            .with_keepalive_interval(Duration::from_secs(2))
            .with_default_max_bandwidth(1 << 30);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.default_max_bandwidth, 1 << 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid() {
        let zero_poll = TunnelConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(zero_poll.validate(), Err(TunnelError::Config(_))));

        let short_timeout = TunnelConfig::default().with_keepalive_timeout(Duration::from_secs(1));
        assert!(short_timeout.validate().is_err());

        let slow_ping = TunnelConfig::default().with_keepalive_interval(Duration::from_secs(30));
        assert!(slow_ping.validate().is_err());

        let big_buffer = TunnelConfig::default().with_read_buffer_size(MAX_PACKET_SIZE + 1);
        assert!(big_buffer.validate().is_err());
    }

    #[test]
    fn test_effective_bandwidth() {
        let config = TunnelConfig::default().with_default_max_bandwidth(500);
        assert_eq!(config.effective_bandwidth(0), 500);
        assert_eq!(config.effective_bandwidth(1000), 1000);
        assert_eq!(TunnelConfig::default().effective_bandwidth(0), 0);
    }
}
