//! Connection lifecycle: single-flight connect/disconnect, observers,
//! timeouts and shutdown, all against the in-process broker. Some cases
//! hold the close open to exercise a transport that reports it late.

use mq_link::{
    DisconnectReason, EventHandlers, MemoryBroker, MqLinkError, MqLinkTimeouts, QueueDescriptor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[macro_use]
mod common;

use common::WAIT;

#[tokio::test]
async fn test_concurrent_connects_share_one_activation() {
    let broker = MemoryBroker::new();
    let transport = broker.manual_transport();
    let client = common::client(transport.clone());

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        waiters.push(tokio::spawn(async move { client.connect().await }));
    }

    eventually!("activation", transport.activation_count() == 1);
    assert!(!client.is_connected());
    assert!(transport.complete_connect());

    for waiter in waiters {
        let result = timeout(WAIT, waiter).await.expect("connect hung").unwrap();
        assert!(result.is_ok());
    }
    assert_eq!(transport.activation_count(), 1);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let client = common::connected_client(transport.clone()).await;

    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(transport.activation_count(), 1);
}

#[tokio::test]
async fn test_disconnect_when_idle_returns_immediately() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let client = common::client(transport.clone());

    timeout(WAIT, client.disconnect()).await.expect("disconnect hung").unwrap();
    assert_eq!(transport.deactivation_count(), 0);
}

#[tokio::test]
async fn test_disconnect_waits_for_close_and_allows_reconnect() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let client = common::connected_client(transport.clone()).await;

    timeout(WAIT, client.disconnect()).await.expect("disconnect hung").unwrap();
    assert!(!client.is_connected());
    assert!(!transport.is_active());
    assert_eq!(transport.deactivation_count(), 1);

    timeout(WAIT, client.connect()).await.expect("reconnect hung").unwrap();
    assert!(client.is_connected());
    assert_eq!(transport.activation_count(), 2);
}

#[tokio::test]
async fn test_connect_while_close_is_pending_reactivates() {
    let broker = MemoryBroker::new();
    let transport = broker.transport().with_deferred_close();
    let client = common::connected_client(transport.clone()).await;

    let closing = {
        let client = client.clone();
        tokio::spawn(async move { client.disconnect().await })
    };
    eventually!("deactivation", transport.deactivation_count() == 1);
    // The old session is still up until the transport reports the close.
    assert!(client.is_connected());

    let reconnecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    eventually!("reactivation", transport.activation_count() == 2);
    assert!(!reconnecting.is_finished());

    assert!(transport.complete_close());

    timeout(WAIT, closing).await.expect("disconnect hung").unwrap().unwrap();
    timeout(WAIT, reconnecting).await.expect("connect hung").unwrap().unwrap();
    assert!(client.is_connected());
    assert!(transport.is_active());
    assert_eq!(transport.activation_count(), 2);
}

#[tokio::test]
async fn test_concurrent_disconnects_share_one_deferred_close() {
    let broker = MemoryBroker::new();
    let transport = broker.transport().with_deferred_close();
    let client = common::connected_client(transport.clone()).await;

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        waiters.push(tokio::spawn(async move { client.disconnect().await }));
    }
    eventually!("deactivation", transport.deactivation_count() == 1);
    sleep(Duration::from_millis(50)).await;
    assert!(waiters.iter().all(|w| !w.is_finished()));

    assert!(transport.complete_close());
    for waiter in waiters {
        timeout(WAIT, waiter).await.expect("disconnect hung").unwrap().unwrap();
    }
    assert_eq!(transport.deactivation_count(), 1);
    assert!(!client.is_connected());

    // Idle again: a further disconnect returns at once.
    timeout(WAIT, client.disconnect()).await.expect("disconnect hung").unwrap();
    assert_eq!(transport.deactivation_count(), 1);
}

#[tokio::test]
async fn test_subscriptions_replay_after_deferred_close_and_reconnect() {
    let broker = MemoryBroker::new();
    let transport = broker.transport().with_deferred_close();
    let client = common::connected_client(transport.clone()).await;
    let received = common::Received::new();
    client
        .subscribe(QueueDescriptor::for_queue("orders"), received.handler())
        .await
        .unwrap();

    let closing = {
        let client = client.clone();
        tokio::spawn(async move { client.disconnect().await })
    };
    eventually!("deactivation", transport.deactivation_count() == 1);
    let reconnecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    eventually!("reactivation", transport.activation_count() == 2);
    transport.complete_close();

    timeout(WAIT, closing).await.expect("disconnect hung").unwrap().unwrap();
    timeout(WAIT, reconnecting).await.expect("connect hung").unwrap().unwrap();
    assert_eq!(broker.consumer_count("/queue/orders"), 1);

    client.publish(&"after restart", "orders").await.unwrap();
    eventually!("delivery", received.len() == 1);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let broker = MemoryBroker::new();
    let transport = broker.manual_transport();
    let client = common::client(transport.clone());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    eventually!("activation", transport.activation_count() == 1);

    timeout(WAIT, client.disconnect()).await.expect("disconnect hung").unwrap();
    let result = timeout(WAIT, pending).await.expect("connect hung").unwrap();

    assert!(matches!(result, Err(MqLinkError::Cancelled)));
    assert!(!transport.is_active());
}

#[tokio::test]
async fn test_connect_timeout_leaves_activation_running() {
    let broker = MemoryBroker::new();
    let transport = broker.manual_transport();
    let timeouts = MqLinkTimeouts::builder().connect_timeout_secs(1).build();
    let client = common::client_with(transport.clone(), timeouts, EventHandlers::new());

    let result = client.connect().await;
    assert!(matches!(result, Err(MqLinkError::TimeoutError(_))));
    assert!(transport.is_active());

    transport.complete_connect();
    eventually!("late connection", client.is_connected());
}

#[tokio::test]
async fn test_lifecycle_observers() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects: Arc<Mutex<Vec<DisconnectReason>>> = Arc::new(Mutex::new(Vec::new()));
    let debug_lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let handlers = {
        let connects = connects.clone();
        let disconnects = disconnects.clone();
        let debug_lines = debug_lines.clone();
        EventHandlers::new()
            .on_connect(move || {
                connects.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move |reason| disconnects.lock().unwrap().push(reason))
            .on_debug(move |line| debug_lines.lock().unwrap().push(line.to_string()))
    };

    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let client = common::client_with(transport.clone(), MqLinkTimeouts::for_testing(5), handlers);

    client.connect().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(debug_lines.lock().unwrap().iter().any(|l| l.starts_with("CONNECTED")));

    transport.drop_connection("network unreachable");
    eventually!("disconnect observed", !client.is_connected());
    eventually!("disconnect callback", disconnects.lock().unwrap().len() == 1);
    assert_eq!(disconnects.lock().unwrap()[0].message, "network unreachable");

    transport.complete_connect();
    eventually!("reconnect", connects.load(Ordering::SeqCst) == 2);

    client.disconnect().await.unwrap();
    let reasons = disconnects.lock().unwrap().clone();
    assert_eq!(reasons.len(), 2);
    assert_eq!(reasons[1].code, Some(1000));
}

#[tokio::test]
async fn test_error_events_do_not_fail_the_connection() {
    let protocol_errors = Arc::new(AtomicUsize::new(0));
    let transport_errors = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let protocol_errors = protocol_errors.clone();
        let transport_errors = transport_errors.clone();
        EventHandlers::new()
            .on_protocol_error(move |_| {
                protocol_errors.fetch_add(1, Ordering::SeqCst);
            })
            .on_transport_error(move |err| {
                assert!(err.recoverable);
                transport_errors.fetch_add(1, Ordering::SeqCst);
            })
    };

    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let client = common::client_with(transport.clone(), MqLinkTimeouts::for_testing(5), handlers);
    client.connect().await.unwrap();

    transport.emit_protocol_error("ERROR frame: bad destination");
    transport.emit_transport_error("socket reset");

    eventually!("protocol error", protocol_errors.load(Ordering::SeqCst) == 1);
    eventually!("transport error", transport_errors.load(Ordering::SeqCst) == 1);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_publish_while_disconnected_is_rejected() {
    let broker = MemoryBroker::new();
    let client = common::client(broker.transport());

    let result = client.publish(&"hello", "orders").await;

    assert!(matches!(result, Err(MqLinkError::NotConnected(_))));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_the_connection_task() {
    let broker = MemoryBroker::new();
    let client = common::connected_client(broker.transport()).await;
    let received = common::Received::new();
    client
        .subscribe(QueueDescriptor::for_queue("orders"), received.handler())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("/queue/orders"), 1);

    client.shutdown().await;

    eventually!("consumer released", broker.consumer_count("/queue/orders") == 0);
    let result = client.connect().await;
    assert!(matches!(result, Err(MqLinkError::InternalError(_))));
    assert!(client.subscriptions().await.is_empty());
}
