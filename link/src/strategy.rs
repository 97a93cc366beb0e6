//! Adapter boundary for message-pattern frameworks.
//!
//! Frameworks that route by pattern speak in packets
//! `{"pattern": <any>, "data": <any>}` carried as the envelope body.
//! [`QueueServer`] consumes a queue and dispatches packets to registered
//! handlers, answering request packets on their reply destination.
//! [`QueueClientProxy`] is the sending half.

use crate::{
    client::{MqLinkClient, WeakClient},
    error::{MqLinkError, Result},
    models::{Envelope, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Server-side lifecycle a framework drives.
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    /// Start consuming. `ready` runs once the server is accepting messages.
    async fn listen(&self, ready: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Stop consuming and release the connection.
    async fn close(&self) -> Result<()>;
}

/// A routed message as it travels in the envelope body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    pub pattern: JsonValue,
    #[serde(default)]
    pub data: JsonValue,
}

impl Packet {
    pub fn new<P: Serialize + ?Sized, D: Serialize + ?Sized>(pattern: &P, data: &D) -> Result<Self> {
        Ok(Self {
            pattern: serde_json::to_value(pattern)?,
            data: serde_json::to_value(data)?,
        })
    }

    /// Lookup key of the pattern. Object keys serialize sorted, so
    /// structurally equal patterns share a key.
    pub fn pattern_key(&self) -> String {
        self.pattern.to_string()
    }
}

type RequestHandler = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;
type EventHandler = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default, Clone)]
struct Routes {
    requests: HashMap<String, RequestHandler>,
    events: HashMap<String, EventHandler>,
}

fn pattern_key<P: Serialize + ?Sized>(pattern: &P) -> Result<String> {
    Ok(serde_json::to_value(pattern)?.to_string())
}

/// Pattern-routing consumer of one queue.
///
/// # Example
///
/// ```rust,no_run
/// use mq_link::{MemoryBroker, MqLinkClient, QueueServer, TransportStrategy};
///
/// # async fn example() -> mq_link::Result<()> {
/// let client = MqLinkClient::builder()
///     .transport(MemoryBroker::new().transport())
///     .build()?;
///
/// let server = QueueServer::new(client, "developmentQueue")
///     .on_message("message", |data| async move {
///         Ok(serde_json::json!(format!("echo: {}", data)))
///     })?
///     .on_event("event", |data| async move {
///         println!("event: {}", data);
///         Ok(())
///     })?;
///
/// server.listen(Box::new(|| println!("Started"))).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueServer {
    client: MqLinkClient,
    queue: String,
    routes: Arc<Routes>,
}

impl QueueServer {
    pub fn new(client: MqLinkClient, queue: impl Into<String>) -> Self {
        Self {
            client,
            queue: queue.into(),
            routes: Arc::new(Routes::default()),
        }
    }

    /// Register a request handler. Its result is sent to the packet's
    /// reply destination.
    pub fn on_message<P, F, Fut>(mut self, pattern: &P, handler: F) -> Result<Self>
    where
        P: Serialize + ?Sized,
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |data| handler(data).boxed());
        Arc::make_mut(&mut self.routes).requests.insert(pattern_key(pattern)?, handler);
        Ok(self)
    }

    /// Register a one-way event handler.
    pub fn on_event<P, F, Fut>(mut self, pattern: &P, handler: F) -> Result<Self>
    where
        P: Serialize + ?Sized,
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |data| handler(data).boxed());
        Arc::make_mut(&mut self.routes).events.insert(pattern_key(pattern)?, handler);
        Ok(self)
    }

    /// Registration id of the server's queue subscription.
    pub fn subscription_id(&self) -> String {
        format!("strategy:{}", self.queue)
    }

    pub fn client(&self) -> &MqLinkClient {
        &self.client
    }
}

async fn route(client: WeakClient, routes: Arc<Routes>, envelope: Envelope) -> Result<()> {
    let packet: Packet = envelope.body_as()?;
    let key = packet.pattern_key();

    if let Some(handler) = routes.requests.get(&key) {
        let response = handler(packet.data).await?;
        if !client.reply(&envelope, &response).await? {
            log::debug!("[mq-link] Request '{}' carried no replyTo; response dropped", key);
        }
        return Ok(());
    }

    if let Some(handler) = routes.events.get(&key) {
        return handler(packet.data).await;
    }

    log::warn!("[mq-link] No handler registered for pattern {}", key);
    Ok(())
}

#[async_trait]
impl TransportStrategy for QueueServer {
    async fn listen(&self, ready: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.client.connect().await?;

        let client = self.client.downgrade();
        let routes = self.routes.clone();
        let descriptor = QueueDescriptor::new(self.subscription_id(), self.queue.clone()).with_prefetch_size(1);
        self.client
            .subscribe(descriptor, move |envelope| {
                route(client.clone(), routes.clone(), envelope)
            })
            .await?;

        log::info!("[mq-link] Queue server listening on '{}'", self.queue);
        ready();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.unsubscribe(&self.subscription_id()).await?;
        self.client.disconnect().await
    }
}

/// Sending half: requests and events to one queue.
#[derive(Clone)]
pub struct QueueClientProxy {
    client: MqLinkClient,
    queue: String,
}

impl QueueClientProxy {
    pub fn new(client: MqLinkClient, queue: impl Into<String>) -> Self {
        Self {
            client,
            queue: queue.into(),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.client.disconnect().await
    }

    /// Send a request packet and wait for the server's response.
    pub async fn send<P, D, R>(&self, pattern: &P, data: &D) -> Result<R>
    where
        P: Serialize + ?Sized,
        D: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let packet = Packet::new(pattern, data)?;
        self.client.request(&packet, &self.queue).await
    }

    /// Publish an event packet. No response is expected.
    pub async fn emit<P, D>(&self, pattern: &P, data: &D) -> Result<()>
    where
        P: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        let packet = Packet::new(pattern, data)?;
        self.client.publish(&packet, &self.queue).await
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl From<&Packet> for Envelope {
    fn from(packet: &Packet) -> Self {
        Envelope::new(serde_json::json!({
            "pattern": packet.pattern,
            "data": packet.data,
        }))
    }
}

impl TryFrom<&Envelope> for Packet {
    type Error = MqLinkError;

    fn try_from(envelope: &Envelope) -> Result<Self> {
        envelope.body_as()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_key_ignores_object_key_order() {
        let a = Packet::new(&json!({"cmd": "sum", "v": 1}), &()).unwrap();
        let b: Packet = serde_json::from_str(r#"{"pattern":{"v":1,"cmd":"sum"}}"#).unwrap();
        assert_eq!(a.pattern_key(), b.pattern_key());
    }

    #[test]
    fn test_string_pattern_key_is_quoted() {
        assert_eq!(pattern_key("message").unwrap(), "\"message\"");
        assert_eq!(Packet::new("message", &1).unwrap().pattern_key(), "\"message\"");
    }

    #[test]
    fn test_packet_data_defaults_to_null() {
        let packet: Packet = serde_json::from_str(r#"{"pattern":"ping"}"#).unwrap();
        assert_eq!(packet.data, JsonValue::Null);
    }

    #[test]
    fn test_packet_envelope_conversion() {
        let packet = Packet::new("event", "Event Published").unwrap();
        let envelope = Envelope::from(&packet);
        assert_eq!(envelope.body, json!({"pattern": "event", "data": "Event Published"}));
        assert_eq!(Packet::try_from(&envelope).unwrap(), packet);

        let not_a_packet = Envelope::new(json!(42));
        assert!(Packet::try_from(&not_a_packet).is_err());
    }
}
