//! Connection lifecycle and transport observers for the mq-link client.
//!
//! Provides callback-based hooks for monitoring the broker connection:
//!
//! - [`on_connect`](EventHandlers::on_connect): Fired after the transport reports a
//!   connection and every registered queue has been re-subscribed
//! - [`on_disconnect`](EventHandlers::on_disconnect): Fired when the transport reports
//!   the connection closed
//! - [`on_protocol_error`](EventHandlers::on_protocol_error): Broker-level protocol errors
//!   (e.g. an ERROR frame)
//! - [`on_transport_error`](EventHandlers::on_transport_error): Socket-level failures
//! - [`on_debug`](EventHandlers::on_debug): Transport debug output
//! - [`on_receive`](EventHandlers::on_receive) / [`on_send`](EventHandlers::on_send):
//!   Optional debug hooks for raw message bodies
//!
//! Errors reported here never fail a pending `connect()` or `disconnect()`;
//! reconnection policy belongs to the transport.
//!
//! # Example
//!
//! ```rust
//! use mq_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("Connected to broker"))
//!     .on_disconnect(|reason| println!("Disconnected: {}", reason))
//!     .on_protocol_error(|err| eprintln!("Broker error: {}", err))
//!     .on_transport_error(|err| eprintln!("Socket error: {}", err));
//! ```

use std::fmt;
use std::sync::Arc;

/// Close code the transport reports for a close the client asked for.
pub const NORMAL_CLOSE: u16 = 1000;

/// Why the broker session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// Close code of the underlying connection, when the transport has one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    /// The close that follows `Transport::deactivate`.
    pub fn requested() -> Self {
        Self::with_code("Client deactivated", NORMAL_CLOSE)
    }

    /// Whether the client ended the session itself.
    pub fn is_requested(&self) -> bool {
        self.code == Some(NORMAL_CLOSE)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} [close {}]", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// A broker ERROR frame or a socket failure, as handed to the error observers.
///
/// `recoverable` tells whether the transport will keep reconnecting on its
/// own. The client never fails a pending call because of one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }

    /// Broker rejected a frame. The session may already be gone.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    /// Socket-level failure the transport retries past.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_disconnect callback.
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Type alias for the protocol/transport error callbacks.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Type alias for the string-valued debug hooks (debug, receive, send).
pub type OnTextCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle and transport observers.
///
/// All handlers are optional. Handlers are `Send + Sync` because they are
/// invoked from the background connection task and from per-subscription
/// dispatcher tasks.
#[derive(Clone, Default)]
pub struct EventHandlers {
    /// Called after the transport connects and the registry has been replayed.
    pub(crate) on_connect: Option<OnConnectCallback>,

    /// Called when the transport reports the connection closed.
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,

    /// Called for broker-level protocol errors.
    pub(crate) on_protocol_error: Option<OnErrorCallback>,

    /// Called for socket-level failures.
    pub(crate) on_transport_error: Option<OnErrorCallback>,

    /// Called with transport debug output.
    pub(crate) on_debug: Option<OnTextCallback>,

    /// Called with every raw inbound message body before it is parsed.
    pub(crate) on_receive: Option<OnTextCallback>,

    /// Called with every raw outbound message body.
    pub(crate) on_send: Option<OnTextCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_protocol_error", &self.on_protocol_error.is_some())
            .field("on_transport_error", &self.on_transport_error.is_some())
            .field("on_debug", &self.on_debug.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked once the connection is usable.
    ///
    /// By the time it fires every registered queue has a live subscription.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the connection closes.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback for broker protocol errors.
    ///
    /// # Example
    /// ```rust
    /// use mq_link::EventHandlers;
    ///
    /// let handlers = EventHandlers::new()
    ///     .on_protocol_error(|err| eprintln!("protocol (recoverable={}): {}", err.recoverable, err));
    /// ```
    pub fn on_protocol_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_protocol_error = Some(Arc::new(f));
        self
    }

    /// Register a callback for socket-level transport errors.
    pub fn on_transport_error(
        mut self,
        f: impl Fn(ConnectionError) + Send + Sync + 'static,
    ) -> Self {
        self.on_transport_error = Some(Arc::new(f));
        self
    }

    /// Register a callback receiving transport debug output.
    pub fn on_debug(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_debug = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw message body received.
    ///
    /// This is a **debug/tracing hook**. Not needed for normal operation.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw message body published.
    ///
    /// This is a **debug/tracing hook**. Not needed for normal operation.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_protocol_error.is_some()
            || self.on_transport_error.is_some()
            || self.on_debug.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_protocol_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_protocol_error {
            cb(error);
        }
    }

    pub(crate) fn emit_transport_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_transport_error {
            cb(error);
        }
    }

    pub(crate) fn emit_debug(&self, msg: &str) {
        if let Some(cb) = &self.on_debug {
            cb(msg);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}
