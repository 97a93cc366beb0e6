use serde::{Deserialize, Serialize};

/// Broker connection settings handed to the transport.
///
/// These options control:
/// - Where the broker lives (`host`, `port`, `ssl`)
/// - How the client authenticates (`username`, `password`)
/// - Reconnection and heartbeat timing, which the transport enforces
/// - How queue names map to destinations and the default prefetch
///
/// Observers (debug output, protocol and transport errors) are registered
/// separately through [`EventHandlers`](crate::EventHandlers).
///
/// # Example
///
/// ```rust
/// use mq_link::ConnectionConfig;
///
/// let config = ConnectionConfig::new("broker.local", 61614)
///     .with_credentials("admin", "admin")
///     .with_ssl(true)
///     .with_reconnect_delay_ms(2000);
///
/// assert_eq!(config.broker_url(), "wss://broker.local:61614");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker host name or IP address
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port (STOMP over WebSocket)
    /// Default: 61614
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login sent in the CONNECT headers
    #[serde(default)]
    pub username: String,

    /// Passcode sent in the CONNECT headers
    #[serde(default)]
    pub password: String,

    /// Use `wss://` instead of `ws://`
    #[serde(default)]
    pub ssl: bool,

    /// Delay in milliseconds before the transport retries a lost connection
    /// Default: 5000ms
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Expected interval of broker heartbeats, in milliseconds
    /// Default: 4000ms
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_incoming_ms: u64,

    /// Interval of client heartbeats, in milliseconds
    /// Default: 4000ms
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_outgoing_ms: u64,

    /// Prefix joined to a queue name to form its destination
    /// Default: "/queue/"
    #[serde(default = "default_destination_prefix")]
    pub destination_prefix: String,

    /// Prefetch applied when a descriptor does not pick its own
    /// Default: 1
    #[serde(default = "default_prefetch_size")]
    pub default_prefetch_size: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    61614
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_heartbeat_ms() -> u64 {
    4000
}

fn default_destination_prefix() -> String {
    "/queue/".to_string()
}

fn default_prefetch_size() -> u32 {
    1
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            ssl: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_incoming_ms: default_heartbeat_ms(),
            heartbeat_outgoing_ms: default_heartbeat_ms(),
            destination_prefix: default_destination_prefix(),
            default_prefetch_size: default_prefetch_size(),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for the given broker endpoint with defaults elsewhere
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the login and passcode
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Use a TLS WebSocket (`wss://`)
    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Set the delay before the transport reconnects (in milliseconds)
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the incoming and outgoing heartbeat intervals (in milliseconds)
    pub fn with_heartbeats_ms(mut self, incoming_ms: u64, outgoing_ms: u64) -> Self {
        self.heartbeat_incoming_ms = incoming_ms;
        self.heartbeat_outgoing_ms = outgoing_ms;
        self
    }

    /// Set the destination prefix (e.g. `/queue/` or `/topic/`)
    pub fn with_destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.destination_prefix = prefix.into();
        self
    }

    /// Set the prefetch used by descriptors that do not override it
    pub fn with_default_prefetch_size(mut self, prefetch: u32) -> Self {
        self.default_prefetch_size = prefetch;
        self
    }

    /// WebSocket URL of the broker.
    pub fn broker_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Headers carried by the CONNECT frame.
    pub fn connect_headers(&self) -> Vec<(String, String)> {
        vec![
            ("login".to_string(), self.username.clone()),
            ("passcode".to_string(), self.password.clone()),
        ]
    }

    /// Map a queue name to its broker destination.
    pub fn destination_for(&self, queue_name: &str) -> String {
        format!("{}{}", self.destination_prefix, queue_name)
    }
}
