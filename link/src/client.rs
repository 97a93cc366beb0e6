//! Main mq-link client with builder pattern.
//!
//! Provides the primary interface for talking to a queue broker:
//! lifecycle, durable subscriptions, one-way publish and RPC.

use crate::{
    connection::SharedConnection,
    dispatch::message_handler,
    error::{MqLinkError, Result},
    event_handlers::EventHandlers,
    models::{ConnectionConfig, Envelope, QueueDescriptor, SubscriptionInfo},
    subscription::SubscriptionHandle,
    timeouts::MqLinkTimeouts,
    transport::Transport,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Main mq-link client.
///
/// Cheap to clone; all clones share one connection task. The task stops
/// when the last clone is dropped or [`shutdown`](Self::shutdown) is called.
/// Neither deactivates the transport, so call [`disconnect`](Self::disconnect)
/// first for a clean close.
///
/// Subscription handlers are owned by the connection task. A handler that
/// captures a clone of the client keeps the task alive until `shutdown()`;
/// capture a [`WeakClient`] from [`downgrade`](Self::downgrade) instead.
///
/// # Examples
///
/// ```rust,no_run
/// use mq_link::{MemoryBroker, MqLinkClient, QueueDescriptor};
///
/// # async fn example() -> mq_link::Result<()> {
/// let broker = MemoryBroker::new();
/// let client = MqLinkClient::builder()
///     .transport(broker.transport())
///     .build()?;
///
/// client.connect().await?;
/// client
///     .subscribe(QueueDescriptor::for_queue("orders"), |envelope| async move {
///         println!("order: {}", envelope.body);
///         Ok(())
///     })
///     .await?;
/// client.publish(&serde_json::json!({"sku": "A-1"}), "orders").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqLinkClient {
    connection: Arc<SharedConnection>,
    config: ConnectionConfig,
}

impl MqLinkClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> MqLinkClientBuilder {
        MqLinkClientBuilder::new()
    }

    /// Non-owning handle for use inside subscription handlers.
    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            connection: Arc::downgrade(&self.connection),
            config: self.config.clone(),
        }
    }

    /// Activate the transport and wait until it is connected and every
    /// registered subscription is live again.
    ///
    /// Returns immediately if already connected. Concurrent callers share a
    /// single activation.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Deactivate the transport and wait until the connection is closed.
    ///
    /// Returns immediately if the client is neither active nor connected.
    /// Pending `connect()` calls resolve with [`MqLinkError::Cancelled`].
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Register a handler for a queue.
    ///
    /// The registration survives disconnects and is replayed on every
    /// reconnect. Re-using a descriptor id replaces the previous registration.
    /// When disconnected, resolves after the next successful connect.
    pub async fn subscribe<F, Fut>(
        &self,
        descriptor: QueueDescriptor,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = descriptor.id.clone();
        let generation = self
            .connection
            .subscribe(descriptor, message_handler(handler))
            .await?;
        Ok(SubscriptionHandle::new(id, generation, self.connection.control_tx()))
    }

    /// Remove a registration and cancel its live subscription.
    /// Returns `false` for an unknown id.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool> {
        self.connection.unsubscribe(id).await
    }

    /// Publish `{"body": body}` to a queue.
    pub async fn publish<T: Serialize + ?Sized>(&self, body: &T, queue_name: &str) -> Result<()> {
        let wire = Envelope::new(serde_json::to_value(body)?).to_wire()?;
        self.connection.publish(queue_name, wire).await
    }

    /// Send a request to `target_queue` and route the first reply to
    /// `on_reply`.
    ///
    /// The reply destination is `reply_to` or a fresh UUID. Resolves with the
    /// reply destination as soon as the request is published, not when the
    /// reply arrives.
    pub async fn rpc<T, F>(
        &self,
        body: &T,
        target_queue: &str,
        on_reply: F,
        reply_to: Option<String>,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        F: FnOnce(Envelope) + Send + 'static,
    {
        let body = serde_json::to_value(body)?;
        self.connection
            .rpc(target_queue, body, reply_to, Box::new(on_reply))
            .await
    }

    /// Send a request and wait for the reply body.
    ///
    /// Bounded by [`MqLinkTimeouts::rpc_timeout`] when one is configured.
    pub async fn request<Req, Resp>(&self, body: &Req, target_queue: &str) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async move {
            self.rpc(
                body,
                target_queue,
                move |envelope| {
                    let _ = reply_tx.send(envelope);
                },
                None,
            )
            .await?;
            reply_rx.await.map_err(|_| MqLinkError::Cancelled)
        };

        let timeout = self.connection.timeouts().rpc_timeout;
        let envelope = if MqLinkTimeouts::is_no_timeout(timeout) {
            exchange.await?
        } else {
            tokio::time::timeout(timeout, exchange).await.map_err(|_| {
                MqLinkError::TimeoutError(format!(
                    "no reply from '{}' within {:?}",
                    target_queue, timeout
                ))
            })??
        };
        envelope.body_as()
    }

    /// Answer an RPC request. Publishes `result` to the envelope's reply
    /// destination; returns `false` if the envelope carries none.
    pub async fn reply<T: Serialize + ?Sized>(&self, envelope: &Envelope, result: &T) -> Result<bool> {
        match envelope.reply_to.as_deref() {
            Some(reply_to) => {
                self.publish(result, reply_to).await?;
                Ok(true)
            },
            None => {
                log::debug!("[mq-link] Envelope has no replyTo; nothing to answer");
                Ok(false)
            },
        }
    }

    /// Snapshot of every registered subscription, sorted by id.
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.connection.list_subscriptions().await
    }

    /// Reply destinations of RPC calls still waiting for an answer.
    pub async fn pending_rpc_calls(&self) -> Vec<String> {
        self.connection.pending_rpc_calls().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Get the broker configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the configured timeouts
    pub fn timeouts(&self) -> &MqLinkTimeouts {
        self.connection.timeouts()
    }

    /// Stop the connection task. Every live subscription is released and
    /// pending calls are dropped. The transport is left as it is.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

/// Handle to an [`MqLinkClient`] that does not keep its connection task alive.
#[derive(Clone)]
pub struct WeakClient {
    connection: Weak<SharedConnection>,
    config: ConnectionConfig,
}

impl WeakClient {
    /// The client, unless every strong handle has been dropped.
    pub fn upgrade(&self) -> Option<MqLinkClient> {
        self.connection.upgrade().map(|connection| MqLinkClient {
            connection,
            config: self.config.clone(),
        })
    }

    /// [`MqLinkClient::reply`] through a weak handle.
    pub async fn reply<T: Serialize + ?Sized>(&self, envelope: &Envelope, result: &T) -> Result<bool> {
        match self.upgrade() {
            Some(client) => client.reply(envelope, result).await,
            None => Err(MqLinkError::NotConnected("client has been dropped".to_string())),
        }
    }
}

/// Builder for configuring [`MqLinkClient`] instances.
pub struct MqLinkClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: ConnectionConfig,
    timeouts: MqLinkTimeouts,
    event_handlers: EventHandlers,
}

impl MqLinkClientBuilder {
    fn new() -> Self {
        Self {
            transport: None,
            config: ConnectionConfig::default(),
            timeouts: MqLinkTimeouts::default(),
            event_handlers: EventHandlers::default(),
        }
    }

    /// Set the wire transport (required)
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set an already shared transport
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the broker connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set timeout configuration for lifecycle and RPC operations
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mq_link::{MemoryBroker, MqLinkClient, MqLinkTimeouts};
    ///
    /// # async fn example() -> mq_link::Result<()> {
    /// let client = MqLinkClient::builder()
    ///     .transport(MemoryBroker::new().transport())
    ///     .timeouts(MqLinkTimeouts::fast())
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn timeouts(mut self, timeouts: MqLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set connection lifecycle and transport observers
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Build the client and start its connection task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<MqLinkClient> {
        let transport = self
            .transport
            .ok_or_else(|| MqLinkError::ConfigurationError("transport is required".into()))?;

        if self.config.default_prefetch_size == 0 {
            return Err(MqLinkError::ConfigurationError(
                "default_prefetch_size must be at least 1".into(),
            ));
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MqLinkError::ConfigurationError(
                "MqLinkClient must be built inside a Tokio runtime".into(),
            ));
        }

        log::debug!(
            "[mq-link] Building client for {} (prefix '{}')",
            self.config.broker_url(),
            self.config.destination_prefix
        );
        let connection = SharedConnection::start(
            transport,
            self.config.clone(),
            self.timeouts,
            self.event_handlers,
        );

        Ok(MqLinkClient {
            connection: Arc::new(connection),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn test_builder_pattern() {
        let result = MqLinkClient::builder()
            .transport(MemoryBroker::new().transport())
            .config(ConnectionConfig::new("localhost", 61614))
            .timeouts(MqLinkTimeouts::fast())
            .event_handlers(EventHandlers::new().on_connect(|| {}))
            .build();

        let client = result.unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.config().port, 61614);
        assert_eq!(client.timeouts().rpc_timeout, MqLinkTimeouts::fast().rpc_timeout);
    }

    #[tokio::test]
    async fn test_builder_missing_transport() {
        let result = MqLinkClient::builder().build();
        assert!(matches!(result, Err(MqLinkError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_prefetch() {
        let result = MqLinkClient::builder()
            .transport(MemoryBroker::new().transport())
            .config(ConnectionConfig::default().with_default_prefetch_size(0))
            .build();
        assert!(matches!(result, Err(MqLinkError::ConfigurationError(_))));
    }

    #[test]
    fn test_builder_outside_runtime() {
        let result = MqLinkClient::builder()
            .transport(MemoryBroker::new().transport())
            .build();
        assert!(matches!(result, Err(MqLinkError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_reply_without_reply_to_is_noop() {
        let client = MqLinkClient::builder()
            .transport(MemoryBroker::new().transport())
            .build()
            .unwrap();
        let envelope = Envelope::new(serde_json::json!("fire and forget"));

        assert!(!client.reply(&envelope, &1).await.unwrap());
    }

    #[tokio::test]
    async fn test_weak_client_does_not_keep_client_alive() {
        let client = MqLinkClient::builder()
            .transport(MemoryBroker::new().transport())
            .build()
            .unwrap();
        let weak = client.downgrade();
        assert!(weak.upgrade().is_some());

        drop(client);

        assert!(weak.upgrade().is_none());
        let envelope = Envelope::with_reply_to(serde_json::json!(1), "answers");
        assert!(matches!(
            weak.reply(&envelope, &2).await,
            Err(MqLinkError::NotConnected(_))
        ));
    }
}
