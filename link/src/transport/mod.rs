//! Transport adapter boundary.
//!
//! The client never speaks the wire protocol itself. A [`Transport`] owns the
//! socket, frame codec, heartbeats and reconnect backoff, and exposes:
//!
//! - activation control (`activate` / `deactivate`)
//! - subscribe / publish primitives, with per-message acknowledgement
//!   carried by [`InboundMessage`]
//! - connection-state and error events, pushed through the
//!   [`TransportEventSender`] handed over in [`Transport::bind`]
//!
//! [`MemoryTransport`] is an in-process broker used by the test-suite and
//! local demos.

pub mod memory;

pub use memory::{MemoryBroker, MemoryTransport};

use crate::error::Result;
use crate::event_handlers::{ConnectionError, DisconnectReason};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Header selecting client-side acknowledgement.
pub const ACK_HEADER: &str = "ack";

/// Header carrying the broker prefetch limit.
pub const PREFETCH_HEADER: &str = "activemq.prefetchSize";

/// Connection-state and diagnostics events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The session is established and usable.
    Connected,
    /// The session closed (deactivation or connection loss).
    Disconnected(DisconnectReason),
    /// The broker rejected something at protocol level.
    ProtocolError(ConnectionError),
    /// The underlying socket failed.
    TransportError(ConnectionError),
    /// Free-form debug output.
    Debug(String),
}

/// Channel the transport pushes [`TransportEvent`]s into.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Channel the transport pushes deliveries of one subscription into.
pub type DeliverySender = mpsc::UnboundedSender<InboundMessage>;

type AckFn = Box<dyn FnOnce() + Send>;

/// A message delivered by the transport, acknowledged at most once.
pub struct InboundMessage {
    body: String,
    ack: Option<AckFn>,
}

impl InboundMessage {
    pub fn new(body: impl Into<String>, ack: impl FnOnce() + Send + 'static) -> Self {
        Self {
            body: body.into(),
            ack: Some(Box::new(ack)),
        }
    }

    /// Raw message body as received.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Acknowledge the message. Returns `false` if it was already acknowledged.
    pub fn ack(&mut self) -> bool {
        match self.ack.take() {
            Some(ack) => {
                ack();
                true
            },
            None => false,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.ack.is_none()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("body", &self.body)
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Subscribe-frame headers the client sends for every subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeHeaders {
    /// Max unacknowledged messages the broker may push.
    pub prefetch_size: u32,
}

impl SubscribeHeaders {
    pub fn new(prefetch_size: u32) -> Self {
        Self {
            prefetch_size: prefetch_size.max(1),
        }
    }

    /// Headers as sent on the wire: client acks plus the prefetch limit.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        vec![
            (ACK_HEADER.to_string(), "client".to_string()),
            (PREFETCH_HEADER.to_string(), self.prefetch_size.to_string()),
        ]
    }
}

/// A live subscription owned by the transport session.
pub trait TransportSubscription: Send + Sync {
    fn destination(&self) -> &str;

    /// Stop deliveries. Messages delivered but not yet acknowledged are
    /// returned to the queue. A no-op once the owning session has closed.
    fn unsubscribe(self: Box<Self>);
}

/// Wire-protocol engine consumed by the client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Install the event sink. Called once when the client is built.
    fn bind(&self, events: TransportEventSender);

    /// Start connecting. The outcome is reported through `Connected`.
    async fn activate(&self) -> Result<()>;

    /// Close the session and stop reconnecting. Emits `Disconnected` only if
    /// a session was open.
    async fn deactivate(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn subscribe(
        &self,
        destination: &str,
        headers: &SubscribeHeaders,
        deliveries: DeliverySender,
    ) -> Result<Box<dyn TransportSubscription>>;

    async fn publish(&self, destination: &str, body: String) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inbound_message_acks_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut msg = InboundMessage::new("{}", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!msg.is_acked());
        assert!(msg.ack());
        assert!(!msg.ack());
        assert!(msg.is_acked());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_headers() {
        let headers = SubscribeHeaders::new(5).to_headers();
        assert_eq!(
            headers,
            vec![
                ("ack".to_string(), "client".to_string()),
                ("activemq.prefetchSize".to_string(), "5".to_string()),
            ]
        );
        assert_eq!(SubscribeHeaders::new(0).prefetch_size, 1);
    }
}
