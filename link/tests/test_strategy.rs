//! Pattern-routing server and client proxy on top of the queue client.

use mq_link::{
    MemoryBroker, MqLinkError, QueueClientProxy, QueueServer, TransportStrategy,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;

#[macro_use]
mod common;

use common::WAIT;

fn development_server(broker: &MemoryBroker, events: Arc<Mutex<Vec<Value>>>) -> QueueServer {
    QueueServer::new(common::client(broker.transport()), "developmentQueue")
        .on_message("message", |data| async move {
            assert_eq!(data, json!("RPC Request"));
            Ok(json!("RPC Response"))
        })
        .unwrap()
        .on_message(&json!({"cmd": "sum"}), |data| async move {
            let numbers: Vec<i64> = serde_json::from_value(data)?;
            Ok(json!(numbers.iter().sum::<i64>()))
        })
        .unwrap()
        .on_event("event", move |data| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(data);
                Ok(())
            }
        })
        .unwrap()
}

#[tokio::test]
async fn test_send_is_answered_by_matching_pattern() {
    let broker = MemoryBroker::new();
    let server = development_server(&broker, Arc::default());
    let ready = Arc::new(AtomicBool::new(false));
    let r = ready.clone();
    timeout(WAIT, server.listen(Box::new(move || r.store(true, Ordering::SeqCst))))
        .await
        .expect("listen hung")
        .unwrap();
    assert!(ready.load(Ordering::SeqCst));

    let proxy = QueueClientProxy::new(common::client(broker.transport()), "developmentQueue");
    proxy.connect().await.unwrap();

    let response: String = timeout(WAIT, proxy.send("message", "RPC Request"))
        .await
        .expect("send hung")
        .unwrap();
    assert_eq!(response, "RPC Response");

    let sum: i64 = timeout(WAIT, proxy.send(&json!({"cmd": "sum"}), &[1, 2, 3]))
        .await
        .expect("send hung")
        .unwrap();
    assert_eq!(sum, 6);
}

#[tokio::test]
async fn test_emit_reaches_event_handler_without_reply() {
    let broker = MemoryBroker::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let server = development_server(&broker, events.clone());
    server.listen(Box::new(|| {})).await.unwrap();

    let proxy = QueueClientProxy::new(common::client(broker.transport()), "developmentQueue");
    proxy.connect().await.unwrap();
    proxy.emit("event", "Event Published").await.unwrap();

    eventually!("event", events.lock().unwrap().len() == 1);
    assert_eq!(events.lock().unwrap()[0], json!("Event Published"));
    assert_eq!(
        broker.published_to("/queue/developmentQueue"),
        vec![r#"{"body":{"data":"Event Published","pattern":"event"}}"#]
    );
}

#[tokio::test]
async fn test_unknown_pattern_is_acked_and_ignored() {
    let broker = MemoryBroker::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let server = development_server(&broker, events.clone());
    server.listen(Box::new(|| {})).await.unwrap();

    let proxy = QueueClientProxy::new(common::client(broker.transport()), "developmentQueue");
    proxy.connect().await.unwrap();
    proxy.emit("nobody-listens", &1).await.unwrap();
    broker.inject("/queue/developmentQueue", r#"{"body":"not a packet"}"#);
    proxy.emit("event", "after").await.unwrap();

    eventually!("later event", events.lock().unwrap().len() == 1);
    eventually!("all acked", broker.ack_count() == 3);
}

#[tokio::test]
async fn test_close_releases_the_queue() {
    let broker = MemoryBroker::new();
    let server = development_server(&broker, Arc::default());
    server.listen(Box::new(|| {})).await.unwrap();
    assert_eq!(broker.consumer_count("/queue/developmentQueue"), 1);
    assert_eq!(server.subscription_id(), "strategy:developmentQueue");

    server.close().await.unwrap();

    assert_eq!(broker.consumer_count("/queue/developmentQueue"), 0);
    assert!(!server.client().is_connected());
    assert!(server.client().subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_dropping_server_releases_the_queue() {
    let broker = MemoryBroker::new();
    let server = development_server(&broker, Arc::default());
    server.listen(Box::new(|| {})).await.unwrap();
    assert_eq!(broker.consumer_count("/queue/developmentQueue"), 1);

    drop(server);

    eventually!(
        "consumer released",
        broker.consumer_count("/queue/developmentQueue") == 0
    );
}

#[tokio::test]
async fn test_send_without_server_is_rejected_when_disconnected() {
    let broker = MemoryBroker::new();
    let proxy = QueueClientProxy::new(common::client(broker.transport()), "developmentQueue");

    let result: mq_link::Result<Value> = proxy.send("message", "RPC Request").await;

    assert!(matches!(result, Err(MqLinkError::NotConnected(_))));
    assert_eq!(proxy.queue(), "developmentQueue");
}
