//! In-process broker implementing [`Transport`].
//!
//! A [`MemoryBroker`] holds the queues. Every [`MemoryTransport`] obtained from
//! it is one client session against those queues, so several clients can
//! talk to each other through one broker (e.g. a requester and a responder).
//!
//! Semantics mirror a queue broker with client acknowledgement:
//!
//! - messages published to a destination with no consumer are kept
//! - consumers of one destination are served round-robin
//! - a consumer never has more than `prefetch_size` unacknowledged messages
//! - unacknowledged messages return to the queue when their consumer
//!   unsubscribes or its session closes
//!
//! Connection state is driven by the test: by default `activate()` connects
//! immediately; with [`MemoryTransport::with_manual_connect`] the session only
//! comes up on [`MemoryTransport::complete_connect`]. Likewise
//! `deactivate()` closes at once unless [`MemoryTransport::with_deferred_close`]
//! holds the session open until [`MemoryTransport::complete_close`].

use super::{
    DeliverySender, InboundMessage, SubscribeHeaders, Transport, TransportEvent,
    TransportEventSender, TransportSubscription,
};
use crate::error::{MqLinkError, Result};
use crate::event_handlers::{ConnectionError, DisconnectReason};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct Consumer {
    id: u64,
    session: u64,
    prefetch: usize,
    deliveries: DeliverySender,
    in_flight: HashMap<u64, String>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u64, String)>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_message_id: u64,
    next_consumer_id: u64,
    next_session_id: u64,
    published: Vec<(String, String)>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    acks: AtomicUsize,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-update; the
        // queues themselves stay consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared in-process queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                acks: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a new client session that connects as soon as it is activated.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone(), true)
    }

    /// Open a new client session that stays connecting until
    /// [`MemoryTransport::complete_connect`] is called.
    pub fn manual_transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone(), false)
    }

    /// Put a raw body on a destination, bypassing any client.
    pub fn inject(&self, destination: &str, raw: impl Into<String>) {
        enqueue(&self.inner, destination, raw.into());
    }

    /// Number of live consumers on a destination.
    pub fn consumer_count(&self, destination: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(destination)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer on a destination.
    pub fn pending_count(&self, destination: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(destination)
            .map_or(0, |q| q.pending.len())
    }

    /// Total acknowledgements received, including late ones.
    pub fn ack_count(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }

    /// Every `(destination, body)` published through any session, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().published.clone()
    }

    /// Bodies published to one destination, in order.
    pub fn published_to(&self, destination: &str) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

fn enqueue(inner: &Arc<BrokerInner>, destination: &str, body: String) {
    let mut state = inner.lock();
    let id = state.next_message_id;
    state.next_message_id += 1;
    state.published.push((destination.to_string(), body.clone()));
    state
        .queues
        .entry(destination.to_string())
        .or_default()
        .pending
        .push_back((id, body));
    pump(inner, &mut state, destination);
}

/// Hand pending messages to consumers with free prefetch capacity.
fn pump(inner: &Arc<BrokerInner>, state: &mut BrokerState, destination: &str) {
    let Some(queue) = state.queues.get_mut(destination) else {
        return;
    };

    while !queue.pending.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let start = queue.next_consumer % count;
        let Some(slot) = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| queue.consumers[i].in_flight.len() < queue.consumers[i].prefetch)
        else {
            break;
        };
        queue.next_consumer = slot + 1;

        let Some((message_id, body)) = queue.pending.pop_front() else {
            break;
        };
        let consumer = &mut queue.consumers[slot];
        let ack = ack_fn(Arc::downgrade(inner), destination.to_string(), consumer.id, message_id);

        if consumer.deliveries.send(InboundMessage::new(body.clone(), ack)).is_ok() {
            consumer.in_flight.insert(message_id, body);
        } else {
            // Receiver is gone: drop the consumer and give its messages back.
            let dead = queue.consumers.remove(slot);
            queue.pending.push_front((message_id, body));
            requeue(queue, dead);
        }
    }
}

fn requeue(queue: &mut QueueState, consumer: Consumer) {
    let mut returned: Vec<_> = consumer.in_flight.into_iter().collect();
    returned.sort_by_key(|(id, _)| *id);
    for entry in returned.into_iter().rev() {
        queue.pending.push_front(entry);
    }
}

fn ack_fn(
    inner: Weak<BrokerInner>,
    destination: String,
    consumer_id: u64,
    message_id: u64,
) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.acks.fetch_add(1, Ordering::SeqCst);
        let mut state = inner.lock();
        let settled = state
            .queues
            .get_mut(&destination)
            .and_then(|q| q.consumers.iter_mut().find(|c| c.id == consumer_id))
            .map_or(false, |c| c.in_flight.remove(&message_id).is_some());
        if settled {
            pump(&inner, &mut state, &destination);
        }
    }
}

fn remove_consumer(inner: &Arc<BrokerInner>, destination: &str, consumer_id: u64) {
    let mut state = inner.lock();
    let Some(queue) = state.queues.get_mut(destination) else {
        return;
    };
    if let Some(pos) = queue.consumers.iter().position(|c| c.id == consumer_id) {
        let consumer = queue.consumers.remove(pos);
        requeue(queue, consumer);
        pump(inner, &mut state, destination);
    }
}

fn close_session(inner: &Arc<BrokerInner>, session: u64) {
    let mut state = inner.lock();
    let mut touched = Vec::new();
    for (destination, queue) in state.queues.iter_mut() {
        let (closed, kept): (Vec<_>, Vec<_>) =
            queue.consumers.drain(..).partition(|c| c.session == session);
        queue.consumers = kept;
        if !closed.is_empty() {
            for consumer in closed {
                requeue(queue, consumer);
            }
            touched.push(destination.clone());
        }
    }
    for destination in touched {
        pump(inner, &mut state, &destination);
    }
}

struct SessionState {
    active: bool,
    /// Deactivated, but the session has not closed yet.
    closing: bool,
    session: Option<u64>,
    events: Option<TransportEventSender>,
}

/// One client session against a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    auto_connect: bool,
    deferred_close: bool,
    state: Arc<Mutex<SessionState>>,
    connected: Arc<AtomicBool>,
    activations: Arc<AtomicU64>,
    deactivations: Arc<AtomicU64>,
    fail_publish: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn new(broker: MemoryBroker, auto_connect: bool) -> Self {
        Self {
            broker,
            auto_connect,
            deferred_close: false,
            state: Arc::new(Mutex::new(SessionState {
                active: false,
                closing: false,
                session: None,
                events: None,
            })),
            connected: Arc::new(AtomicBool::new(false)),
            activations: Arc::new(AtomicU64::new(0)),
            deactivations: Arc::new(AtomicU64::new(0)),
            fail_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Require [`complete_connect`](Self::complete_connect) to bring the session up.
    pub fn with_manual_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    /// Keep the session open after `deactivate()` until
    /// [`complete_close`](Self::complete_close) is called.
    pub fn with_deferred_close(mut self) -> Self {
        self.deferred_close = true;
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(state: &SessionState, event: TransportEvent) {
        if let Some(events) = &state.events {
            let _ = events.send(event);
        }
    }

    fn open_session(&self, state: &mut SessionState) {
        if state.session.is_some() {
            return;
        }
        let session = {
            let mut broker = self.broker.inner.lock();
            broker.next_session_id += 1;
            broker.next_session_id
        };
        state.session = Some(session);
        self.connected.store(true, Ordering::SeqCst);
        Self::emit(state, TransportEvent::Debug(format!("CONNECTED session={}", session)));
        Self::emit(state, TransportEvent::Connected);
    }

    fn end_session(&self, state: &mut SessionState, reason: DisconnectReason) -> bool {
        state.closing = false;
        let Some(session) = state.session.take() else {
            return false;
        };
        self.connected.store(false, Ordering::SeqCst);
        close_session(&self.broker.inner, session);
        Self::emit(state, TransportEvent::Disconnected(reason));
        true
    }

    /// Bring the session up, as the wire engine would after a successful
    /// handshake or reconnect. Ignored unless the transport is active.
    pub fn complete_connect(&self) -> bool {
        let mut state = self.lock();
        if !state.active || state.session.is_some() {
            return false;
        }
        self.open_session(&mut state);
        true
    }

    /// Finish a deferred close. If the transport was activated again in the
    /// meantime, a fresh session follows (auto-connect transports only).
    pub fn complete_close(&self) -> bool {
        let mut state = self.lock();
        if !state.closing {
            return false;
        }
        self.end_session(&mut state, DisconnectReason::requested());
        if state.active && self.auto_connect {
            self.open_session(&mut state);
        }
        true
    }

    /// Simulate losing the connection while still active.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let mut state = self.lock();
        self.end_session(&mut state, DisconnectReason::new(reason))
    }

    /// Drop the connection and immediately re-establish it.
    pub fn bounce(&self) {
        self.drop_connection("connection reset");
        self.complete_connect();
    }

    pub fn emit_protocol_error(&self, message: &str) {
        let state = self.lock();
        Self::emit(&state, TransportEvent::ProtocolError(ConnectionError::protocol(message)));
    }

    pub fn emit_transport_error(&self, message: &str) {
        let state = self.lock();
        Self::emit(&state, TransportEvent::TransportError(ConnectionError::transport(message)));
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivation_count(&self) -> u64 {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn bind(&self, events: TransportEventSender) {
        self.lock().events = Some(events);
    }

    async fn activate(&self) -> Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.active = true;
        if self.auto_connect && !state.closing {
            self.open_session(&mut state);
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.active = false;
        if self.deferred_close && state.session.is_some() {
            state.closing = true;
        } else {
            self.end_session(&mut state, DisconnectReason::requested());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        destination: &str,
        headers: &SubscribeHeaders,
        deliveries: DeliverySender,
    ) -> Result<Box<dyn TransportSubscription>> {
        let session = self
            .lock()
            .session
            .ok_or_else(|| MqLinkError::TransportError(format!("cannot subscribe to {}: no session", destination)))?;

        let inner = &self.broker.inner;
        let mut state = inner.lock();
        state.next_consumer_id += 1;
        let consumer_id = state.next_consumer_id;
        state
            .queues
            .entry(destination.to_string())
            .or_default()
            .consumers
            .push(Consumer {
                id: consumer_id,
                session,
                prefetch: headers.prefetch_size.max(1) as usize,
                deliveries,
                in_flight: HashMap::new(),
            });
        pump(inner, &mut state, destination);

        Ok(Box::new(MemorySubscription {
            broker: Arc::downgrade(inner),
            destination: destination.to_string(),
            consumer_id,
        }))
    }

    async fn publish(&self, destination: &str, body: String) -> Result<()> {
        if self.lock().session.is_none() {
            return Err(MqLinkError::TransportError(format!(
                "cannot publish to {}: no session",
                destination
            )));
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqLinkError::TransportError(format!("publish to {} rejected", destination)));
        }
        enqueue(&self.broker.inner, destination, body);
        Ok(())
    }
}

struct MemorySubscription {
    broker: Weak<BrokerInner>,
    destination: String,
    consumer_id: u64,
}

impl TransportSubscription for MemorySubscription {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn unsubscribe(self: Box<Self>) {
        if let Some(inner) = self.broker.upgrade() {
            remove_consumer(&inner, &self.destination, self.consumer_id);
        }
    }
}
