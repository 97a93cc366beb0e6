//! Shared broker connection and its background task.
//!
//! A single task owns all mutable client state. Handles:
//!
//! - Single-flight `connect()` / `disconnect()` (one activate or deactivate,
//!   however many callers wait)
//! - Re-subscription of every registered queue on each `Connected` event,
//!   before any waiter resolves
//! - Re-arming reply subscriptions of pending RPC calls after a reconnect
//! - Generation-tagged unsubscribe so stale handles cannot cancel newer
//!   registrations
//! - Forwarding transport diagnostics to the [`EventHandlers`]

use crate::{
    connection::{ControlMsg, ControlSender, COMMAND_CHANNEL_CAPACITY},
    dispatch::{Dispatcher, MessageHandler},
    error::{MqLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{ConnectionConfig, Envelope, QueueDescriptor, SubscriptionInfo},
    rpc::{
        completion_cleanup, correlation::PendingRpcCall, new_reply_destination, reply_handler,
        PendingCalls, ReplyCallback,
    },
    subscription::{registry::SubEntry, LiveSubscription, Registry},
    timeouts::MqLinkTimeouts,
    transport::{Transport, TransportEvent},
};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background connection task.
enum ConnCmd {
    Connect {
        result_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        result_tx: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        descriptor: QueueDescriptor,
        handler: MessageHandler,
        result_tx: oneshot::Sender<Result<u64>>,
    },
    Unsubscribe {
        id: String,
        result_tx: oneshot::Sender<bool>,
    },
    Publish {
        queue_name: String,
        body: String,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Rpc {
        target_queue: String,
        body: JsonValue,
        reply_to: Option<String>,
        callback: ReplyCallback,
        result_tx: oneshot::Sender<Result<String>>,
    },
    ListSubscriptions {
        result_tx: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    ListPendingRpc {
        result_tx: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

// ── SharedConnection (public handle) ────────────────────────────────────────

pub(crate) struct SharedConnection {
    cmd_tx: mpsc::Sender<ConnCmd>,
    control_tx: ControlSender,
    connected: Arc<AtomicBool>,
    timeouts: MqLinkTimeouts,
    _task: JoinHandle<()>,
}

impl SharedConnection {
    /// Bind the transport and spawn the connection task. Must be called
    /// inside a Tokio runtime.
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        timeouts: MqLinkTimeouts,
        event_handlers: EventHandlers,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnCmd>(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        transport.bind(event_tx);

        let task = ConnectionTask {
            transport,
            config,
            rpc_timeout: timeouts.rpc_timeout,
            event_handlers,
            connected: connected.clone(),
            control_tx: control_tx.clone(),
            active: false,
            registry: Registry::new(),
            pending: PendingCalls::new(),
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
        };
        let handle = tokio::spawn(task.run(cmd_rx, event_rx, control_rx));

        Self {
            cmd_tx,
            control_tx,
            connected,
            timeouts,
            _task: handle,
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ConnCmd) -> Result<T> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx.send(build(result_tx)).await.map_err(|_| {
            MqLinkError::InternalError("Connection task is not running".to_string())
        })?;
        result_rx.await.map_err(|_| {
            MqLinkError::InternalError("Connection task stopped before replying".to_string())
        })
    }

    async fn with_timeout<T>(
        timeout: std::time::Duration,
        what: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if MqLinkTimeouts::is_no_timeout(timeout) {
            return fut.await;
        }
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            MqLinkError::TimeoutError(format!("{} did not complete within {:?}", what, timeout))
        })?
    }

    pub(crate) async fn connect(&self) -> Result<()> {
        let fut = async { self.call(|result_tx| ConnCmd::Connect { result_tx }).await? };
        Self::with_timeout(self.timeouts.connect_timeout, "connect", fut).await
    }

    pub(crate) async fn disconnect(&self) -> Result<()> {
        let fut = async { self.call(|result_tx| ConnCmd::Disconnect { result_tx }).await? };
        Self::with_timeout(self.timeouts.disconnect_timeout, "disconnect", fut).await
    }

    /// Register a subscription. Returns its generation once it is live.
    pub(crate) async fn subscribe(
        &self,
        descriptor: QueueDescriptor,
        handler: MessageHandler,
    ) -> Result<u64> {
        self.call(|result_tx| ConnCmd::Subscribe {
            descriptor,
            handler,
            result_tx,
        })
        .await?
    }

    pub(crate) async fn unsubscribe(&self, id: &str) -> Result<bool> {
        self.call(|result_tx| ConnCmd::Unsubscribe {
            id: id.to_string(),
            result_tx,
        })
        .await
    }

    pub(crate) async fn publish(&self, queue_name: &str, body: String) -> Result<()> {
        self.call(|result_tx| ConnCmd::Publish {
            queue_name: queue_name.to_string(),
            body,
            result_tx,
        })
        .await?
    }

    /// Start an RPC call. Resolves with the reply destination once the
    /// request is published.
    pub(crate) async fn rpc(
        &self,
        target_queue: &str,
        body: JsonValue,
        reply_to: Option<String>,
        callback: ReplyCallback,
    ) -> Result<String> {
        self.call(|result_tx| ConnCmd::Rpc {
            target_queue: target_queue.to_string(),
            body,
            reply_to,
            callback,
            result_tx,
        })
        .await?
    }

    pub(crate) async fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.call(|result_tx| ConnCmd::ListSubscriptions { result_tx })
            .await
            .unwrap_or_default()
    }

    pub(crate) async fn pending_rpc_calls(&self) -> Vec<String> {
        self.call(|result_tx| ConnCmd::ListPendingRpc { result_tx })
            .await
            .unwrap_or_default()
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown).await;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn control_tx(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub(crate) fn timeouts(&self) -> &MqLinkTimeouts {
        &self.timeouts
    }
}

impl Drop for SharedConnection {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(ConnCmd::Shutdown);
    }
}

// ── Background connection task ──────────────────────────────────────────────

fn subscription_dispatcher(entry: &SubEntry, event_handlers: &EventHandlers) -> Dispatcher {
    Dispatcher {
        label: entry.descriptor.id.clone(),
        handler: entry.handler.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        stats: Some(entry.stats.clone()),
        cleanup: None,
        event_handlers: event_handlers.clone(),
    }
}

fn rpc_dispatcher(reply_to: &str, call: &PendingRpcCall, event_handlers: &EventHandlers) -> Dispatcher {
    Dispatcher {
        label: format!("rpc:{}", reply_to),
        handler: call.handler.clone(),
        cancelled: Arc::new(AtomicBool::new(false)),
        stats: None,
        cleanup: Some(call.cleanup.clone()),
        event_handlers: event_handlers.clone(),
    }
}

struct ConnectionTask {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    rpc_timeout: std::time::Duration,
    event_handlers: EventHandlers,
    connected: Arc<AtomicBool>,
    control_tx: ControlSender,
    /// Activation requested and not withdrawn.
    active: bool,
    registry: Registry,
    pending: PendingCalls,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ConnCmd>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(event) = event_rx.recv() => {
                    self.on_transport_event(event).await;
                }

                Some(msg) = control_rx.recv() => {
                    self.on_control(msg);
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnCmd::Shutdown) | None => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
            }
        }

        self.close();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // ── Transport events ────────────────────────────────────────────────

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected(reason) => self.on_disconnected(reason),
            TransportEvent::ProtocolError(err) => {
                log::warn!("[mq-link] Broker protocol error: {}", err);
                self.event_handlers.emit_protocol_error(err);
            },
            TransportEvent::TransportError(err) => {
                log::warn!("[mq-link] Transport error: {}", err);
                self.event_handlers.emit_transport_error(err);
            },
            TransportEvent::Debug(msg) => {
                log::debug!("[mq-link] transport: {}", msg);
                self.event_handlers.emit_debug(&msg);
            },
        }
    }

    async fn on_connected(&mut self) {
        self.connected.store(true, Ordering::SeqCst);
        log::info!("[mq-link] Connected to {}", self.config.broker_url());

        self.replay_subscriptions().await;
        self.rearm_pending_calls().await;

        self.event_handlers.emit_connect();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.registry.resolve_deferred();
    }

    /// Give every registered entry exactly one fresh live subscription.
    async fn replay_subscriptions(&mut self) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }
        log::info!("[mq-link] Re-subscribing {} registered queue(s)", ids.len());

        for id in ids {
            let Some(entry) = self.registry.get_mut(&id) else {
                continue;
            };
            if let Some(stale) = entry.live.take() {
                stale.cancel();
            }

            let dispatcher = subscription_dispatcher(entry, &self.event_handlers);
            match LiveSubscription::open(&*self.transport, &entry.destination, entry.prefetch, dispatcher)
                .await
            {
                Ok(live) => {
                    log::debug!(
                        "[mq-link] Re-subscribed '{}' to {} (queue '{}')",
                        id,
                        entry.destination,
                        entry.descriptor.queue_name
                    );
                    entry.live = Some(live);
                },
                Err(e) => {
                    log::warn!("[mq-link] Failed to re-subscribe '{}': {}", id, e);
                    self.event_handlers.emit_transport_error(ConnectionError::transport(format!(
                        "Failed to re-subscribe {}: {}",
                        id, e
                    )));
                },
            }
        }
    }

    /// Reply destinations are ordinary queues; resubscribe them so replies
    /// sent while disconnected are still picked up.
    async fn rearm_pending_calls(&mut self) {
        let reply_destinations = self.pending.reply_destinations();
        if reply_destinations.is_empty() {
            return;
        }
        log::info!(
            "[mq-link] Re-arming {} pending RPC reply subscription(s)",
            reply_destinations.len()
        );

        for reply_to in reply_destinations {
            let Some(call) = self.pending.get_mut(&reply_to) else {
                continue;
            };
            if let Some(stale) = call.live.take() {
                stale.cancel();
            }

            let dispatcher = rpc_dispatcher(&reply_to, call, &self.event_handlers);
            match LiveSubscription::open(&*self.transport, &call.destination, 1, dispatcher).await {
                Ok(live) => call.live = Some(live),
                Err(e) => {
                    log::warn!("[mq-link] Failed to re-arm reply queue '{}': {}", reply_to, e);
                    self.event_handlers.emit_transport_error(ConnectionError::transport(format!(
                        "Failed to re-arm reply queue {}: {}",
                        reply_to, e
                    )));
                },
            }
        }
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::SeqCst);
        let dropped = self.registry.drop_live();
        self.pending.drop_live();
        if reason.is_requested() {
            log::info!("[mq-link] Disconnected: {} ({} live subscription(s) dropped)", reason, dropped);
        } else {
            log::warn!(
                "[mq-link] Connection lost: {} ({} live subscription(s) dropped)",
                reason,
                dropped
            );
        }

        self.event_handlers.emit_disconnect(reason);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    // ── Control messages ────────────────────────────────────────────────

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Unsubscribe { id, generation } => {
                if self.registry.remove(&id, generation) {
                    log::info!("[mq-link] Unsubscribed '{}'", id);
                } else {
                    log::debug!(
                        "[mq-link] Ignoring stale unsubscribe for '{}' (gen={:?})",
                        id,
                        generation
                    );
                }
            },
            ControlMsg::CompleteRpc { reply_to, call_id } => {
                if self.pending.complete(&reply_to, call_id) {
                    log::debug!("[mq-link] RPC on '{}' completed", reply_to);
                }
            },
            ControlMsg::ExpireRpc { reply_to, call_id } => {
                if self.pending.complete(&reply_to, call_id) {
                    log::warn!(
                        "[mq-link] RPC on '{}' expired after {:?} without a reply",
                        reply_to,
                        self.rpc_timeout
                    );
                }
            },
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: ConnCmd) {
        match cmd {
            ConnCmd::Connect { result_tx } => self.handle_connect(result_tx).await,
            ConnCmd::Disconnect { result_tx } => self.handle_disconnect(result_tx).await,
            ConnCmd::Subscribe {
                descriptor,
                handler,
                result_tx,
            } => self.handle_subscribe(descriptor, handler, result_tx).await,
            ConnCmd::Unsubscribe { id, result_tx } => {
                let removed = self.registry.remove(&id, None);
                if removed {
                    log::info!("[mq-link] Unsubscribed '{}'", id);
                }
                let _ = result_tx.send(removed);
            },
            ConnCmd::Publish {
                queue_name,
                body,
                result_tx,
            } => {
                let result = self.publish(&queue_name, body).await;
                let _ = result_tx.send(result);
            },
            ConnCmd::Rpc {
                target_queue,
                body,
                reply_to,
                callback,
                result_tx,
            } => {
                let result = self.start_rpc(&target_queue, body, reply_to, callback).await;
                let _ = result_tx.send(result);
            },
            ConnCmd::ListSubscriptions { result_tx } => {
                let _ = result_tx.send(self.registry.snapshot());
            },
            ConnCmd::ListPendingRpc { result_tx } => {
                let _ = result_tx.send(self.pending.reply_destinations());
            },
            // Handled by the run loop.
            ConnCmd::Shutdown => {},
        }
    }

    async fn handle_connect(&mut self, result_tx: oneshot::Sender<Result<()>>) {
        if self.active && self.is_connected() {
            let _ = result_tx.send(Ok(()));
            return;
        }

        self.connect_waiters.push(result_tx);
        if self.active {
            log::debug!("[mq-link] Connect already in progress; waiting");
            return;
        }

        // A session still closing after deactivate() does not count as
        // connected; the waiter resolves on the next Connected event.
        self.active = true;
        log::info!("[mq-link] Activating transport for {}", self.config.broker_url());
        if let Err(e) = self.transport.activate().await {
            log::warn!("[mq-link] Transport activation failed: {}", e);
            self.active = false;
            let message = e.to_string();
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(MqLinkError::TransportError(message.clone())));
            }
        }
    }

    async fn handle_disconnect(&mut self, result_tx: oneshot::Sender<Result<()>>) {
        if !self.active && !self.is_connected() {
            let _ = result_tx.send(Ok(()));
            return;
        }

        if !self.active {
            // Deactivation already issued; wait for the same Disconnected event.
            self.disconnect_waiters.push(result_tx);
            return;
        }

        self.active = false;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(MqLinkError::Cancelled));
        }

        log::info!("[mq-link] Deactivating transport");
        match self.transport.deactivate().await {
            Ok(()) if self.is_connected() => self.disconnect_waiters.push(result_tx),
            Ok(()) => {
                let _ = result_tx.send(Ok(()));
            },
            Err(e) => {
                log::warn!("[mq-link] Transport deactivation failed: {}", e);
                let _ = result_tx.send(Err(e));
            },
        }
    }

    async fn handle_subscribe(
        &mut self,
        descriptor: QueueDescriptor,
        handler: MessageHandler,
        result_tx: oneshot::Sender<Result<u64>>,
    ) {
        let id = descriptor.id.clone();
        let prefetch = descriptor.effective_prefetch(self.config.default_prefetch_size);
        let destination = self.config.destination_for(&descriptor.queue_name);
        let generation = self.registry.register(descriptor, destination, prefetch, handler);

        if !self.is_connected() {
            log::debug!("[mq-link] Subscription '{}' deferred until connected", id);
            self.registry.defer(id, result_tx);
            return;
        }

        let Some(entry) = self.registry.get_mut(&id) else {
            let _ = result_tx.send(Err(MqLinkError::InternalError(format!(
                "subscription '{}' vanished during registration",
                id
            ))));
            return;
        };

        let dispatcher = subscription_dispatcher(entry, &self.event_handlers);
        let opened =
            LiveSubscription::open(&*self.transport, &entry.destination, entry.prefetch, dispatcher)
                .await;
        match opened {
            Ok(live) => {
                log::info!(
                    "[mq-link] Subscribed '{}' to {} (prefetch {})",
                    id,
                    entry.destination,
                    entry.prefetch
                );
                entry.live = Some(live);
                let _ = result_tx.send(Ok(generation));
            },
            Err(e) => {
                log::warn!("[mq-link] Failed to subscribe '{}': {}", id, e);
                self.registry.remove(&id, Some(generation));
                let _ = result_tx.send(Err(e));
            },
        }
    }

    async fn publish(&self, queue_name: &str, body: String) -> Result<()> {
        if !self.is_connected() {
            return Err(MqLinkError::NotConnected(format!("cannot publish to '{}'", queue_name)));
        }
        let destination = self.config.destination_for(queue_name);
        self.event_handlers.emit_send(&body);
        log::debug!("[mq-link] Publishing {} bytes to {}", body.len(), destination);
        self.transport.publish(&destination, body).await
    }

    async fn start_rpc(
        &mut self,
        target_queue: &str,
        body: JsonValue,
        reply_to: Option<String>,
        callback: ReplyCallback,
    ) -> Result<String> {
        if !self.is_connected() {
            return Err(MqLinkError::NotConnected(format!("cannot call '{}'", target_queue)));
        }

        let reply_to = match reply_to {
            Some(reply_to) if self.pending.contains(&reply_to) => {
                return Err(MqLinkError::DuplicateReplyDestination(reply_to));
            },
            Some(reply_to) => reply_to,
            None => new_reply_destination(),
        };
        let request = Envelope::with_reply_to(body, reply_to.clone()).to_wire()?;

        let call_id = self.pending.next_call_id();
        let call = PendingRpcCall {
            call_id,
            destination: self.config.destination_for(&reply_to),
            handler: reply_handler(reply_to.clone(), callback),
            cleanup: completion_cleanup(self.control_tx.clone(), reply_to.clone(), call_id),
            live: None,
        };

        // The reply queue must be live before the request can be answered.
        let dispatcher = rpc_dispatcher(&reply_to, &call, &self.event_handlers);
        let live = LiveSubscription::open(&*self.transport, &call.destination, 1, dispatcher).await?;
        self.pending.insert(reply_to.clone(), PendingRpcCall {
            live: Some(live),
            ..call
        });

        if let Err(e) = self.publish(target_queue, request).await {
            log::warn!("[mq-link] RPC request to '{}' failed: {}", target_queue, e);
            self.pending.complete(&reply_to, call_id);
            return Err(e);
        }
        log::debug!("[mq-link] RPC sent to '{}' (reply to '{}')", target_queue, reply_to);

        if !MqLinkTimeouts::is_no_timeout(self.rpc_timeout) {
            let control = self.control_tx.clone();
            let expire_reply_to = reply_to.clone();
            let timeout = self.rpc_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = control.send(ControlMsg::ExpireRpc {
                    reply_to: expire_reply_to,
                    call_id,
                });
            });
        }

        Ok(reply_to)
    }

    fn close(&mut self) {
        log::info!(
            "[mq-link] Connection task shutting down ({} subscription(s), {} pending RPC call(s))",
            self.registry.len(),
            self.pending.len()
        );
        self.registry.close();
        self.pending.close();
        for waiter in self
            .connect_waiters
            .drain(..)
            .chain(self.disconnect_waiters.drain(..))
        {
            let _ = waiter.send(Err(MqLinkError::Cancelled));
        }
    }
}
