//! Timeout configuration for mq-link client operations.
//!
//! Covers the connection lifecycle (`connect()` / `disconnect()`) and
//! pending RPC calls. A zero duration means "wait forever".

use std::time::Duration;

/// Timeout configuration for mq-link client operations.
///
/// # Examples
///
/// ```rust
/// use mq_link::MqLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (RPC calls never expire)
/// let timeouts = MqLinkTimeouts::default();
///
/// // Expire unanswered RPC calls after 30 seconds
/// let timeouts = MqLinkTimeouts::builder()
///     .rpc_timeout(Duration::from_secs(30))
///     .build();
///
/// // Aggressive timeouts for a local broker
/// let timeouts = MqLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct MqLinkTimeouts {
    /// How long a `connect()` caller waits for the transport to report a
    /// connection. Activation keeps running after the caller gives up.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// How long a `disconnect()` caller waits for the transport to report the
    /// connection closed.
    /// Default: 10 seconds
    pub disconnect_timeout: Duration,

    /// How long a pending RPC call keeps its reply subscription open.
    /// On expiry the reply subscription is cancelled and the callback is
    /// never invoked. Also bounds `request()`.
    /// Default: 0 (pending calls never expire)
    pub rpc_timeout: Duration,
}

impl Default for MqLinkTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::ZERO,
        }
    }
}

impl MqLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> MqLinkTimeoutsBuilder {
        MqLinkTimeoutsBuilder::new()
    }

    /// Create timeouts optimized for a broker on localhost.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(10),
        }
    }

    /// Create timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connect_timeout: Duration::from_secs(120),
            disconnect_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::ZERO,
        }
    }

    /// Create timeouts suitable for tests with a bounded RPC wait.
    pub fn for_testing(rpc_timeout_secs: u64) -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365) // > 1 year
    }
}

/// Builder for creating custom [`MqLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct MqLinkTimeoutsBuilder {
    timeouts: MqLinkTimeouts,
}

impl MqLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: MqLinkTimeouts::default(),
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_timeout = timeout;
        self
    }

    /// Set the connect timeout in seconds.
    pub fn connect_timeout_secs(self, secs: u64) -> Self {
        self.connect_timeout(Duration::from_secs(secs))
    }

    /// Set the disconnect timeout.
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.disconnect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout in seconds.
    pub fn disconnect_timeout_secs(self, secs: u64) -> Self {
        self.disconnect_timeout(Duration::from_secs(secs))
    }

    /// Set the RPC expiry. Set to 0 to keep pending calls forever.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.rpc_timeout = timeout;
        self
    }

    /// Set the RPC expiry in milliseconds.
    pub fn rpc_timeout_ms(self, ms: u64) -> Self {
        self.rpc_timeout(Duration::from_millis(ms))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> MqLinkTimeouts {
        self.timeouts
    }
}
