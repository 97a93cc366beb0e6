//! # mq-link
//!
//! Client library for queue brokers that speak STOMP-style destinations
//! (`/queue/<name>`). The wire protocol is delegated to a [`Transport`];
//! this crate manages everything above it:
//!
//! - **Lifecycle**: idempotent, single-flight `connect()` / `disconnect()`
//! - **Durable subscriptions**: registrations survive disconnects and are
//!   replayed on every reconnect
//! - **Publish**: one-way JSON messages wrapped in `{"body": ...}`
//! - **RPC**: request/response over temporary reply queues, correlated by
//!   reply destination
//! - **Acknowledgement**: every delivery is acked exactly once after its
//!   handler finishes, even if the handler fails or panics
//!
//! ## Example
//!
//! ```rust,no_run
//! use mq_link::{MemoryBroker, MqLinkClient, QueueDescriptor};
//!
//! # async fn example() -> mq_link::Result<()> {
//! let broker = MemoryBroker::new();
//! let responder = MqLinkClient::builder().transport(broker.transport()).build()?;
//! let requester = MqLinkClient::builder().transport(broker.transport()).build()?;
//!
//! responder.connect().await?;
//! // Handlers live in the connection task; hold the client weakly.
//! let replies = responder.downgrade();
//! responder
//!     .subscribe(QueueDescriptor::for_queue("math"), move |envelope| {
//!         let replies = replies.clone();
//!         async move {
//!             let n: i64 = envelope.body_as()?;
//!             replies.reply(&envelope, &(n * 2)).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//!
//! requester.connect().await?;
//! let doubled: i64 = requester.request(&21, "math").await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub(crate) mod connection;
pub mod dispatch;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod rpc;
pub mod strategy;
pub mod subscription;
pub mod timeouts;
pub mod transport;

pub use client::{MqLinkClient, MqLinkClientBuilder, WeakClient};
pub use dispatch::{handle_message, message_handler, Cleanup, HandlerFuture, MessageHandler};
pub use error::{MqLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use models::{ConnectionConfig, Envelope, QueueDescriptor, SubscriptionInfo};
pub use rpc::ReplyCallback;
pub use strategy::{Packet, QueueClientProxy, QueueServer, TransportStrategy};
pub use subscription::SubscriptionHandle;
pub use timeouts::{MqLinkTimeouts, MqLinkTimeoutsBuilder};
pub use transport::{
    InboundMessage, MemoryBroker, MemoryTransport, SubscribeHeaders, Transport, TransportEvent,
    TransportSubscription,
};
