#![allow(dead_code)]

use futures_util::FutureExt;
use mq_link::{
    Envelope, EventHandlers, HandlerFuture, MemoryTransport, MqLinkClient, MqLinkTimeouts,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for any single wait in the suite.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `$cond` (which may contain `.await`) until it holds or `WAIT` elapses.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn client(transport: MemoryTransport) -> MqLinkClient {
    client_with(transport, MqLinkTimeouts::for_testing(5), EventHandlers::new())
}

pub fn client_with(
    transport: MemoryTransport,
    timeouts: MqLinkTimeouts,
    handlers: EventHandlers,
) -> MqLinkClient {
    MqLinkClient::builder()
        .transport(transport)
        .timeouts(timeouts)
        .event_handlers(handlers)
        .build()
        .expect("client should build inside the test runtime")
}

/// Build a client on an auto-connecting transport and connect it.
pub async fn connected_client(transport: MemoryTransport) -> MqLinkClient {
    let client = client(transport);
    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    client
}

/// Records every envelope body a handler sees.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<Value>>>);

impl Received {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, body: Value) {
        self.0.lock().unwrap().push(body);
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn handler(&self) -> impl Fn(Envelope) -> HandlerFuture + Send + Sync + 'static {
        let received = self.clone();
        move |envelope: Envelope| -> HandlerFuture {
            received.push(envelope.body);
            async { Ok(()) }.boxed()
        }
    }
}

/// Answers every request on the subscribed queue with `f(body)`.
pub fn responder(
    client: &MqLinkClient,
    f: impl Fn(Value) -> Value + Send + Sync + 'static,
) -> impl Fn(Envelope) -> HandlerFuture + Send + Sync + 'static {
    let client = client.downgrade();
    let f = Arc::new(f);
    move |envelope: Envelope| -> HandlerFuture {
        let client = client.clone();
        let f = f.clone();
        async move {
            let answer = f(envelope.body.clone());
            client.reply(&envelope, &answer).await?;
            Ok(())
        }
        .boxed()
    }
}
