//! Message envelope handling and per-subscription dispatch.
//!
//! [`handle_message`] is the single path every delivery takes:
//! parse the envelope, run the handler, acknowledge, run cleanup. The ack
//! and the cleanup happen exactly once and in that order whatever the
//! handler does, including panicking.

use crate::error::{MqLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::models::Envelope;
use crate::subscription::SubscriptionStats;
use crate::transport::InboundMessage;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Boxed future returned by a [`MessageHandler`].
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Type-erased async message handler.
pub type MessageHandler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// One-shot cleanup run after the ack.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Erase an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| f(envelope).boxed())
}

/// Process one inbound message.
///
/// Malformed bodies fail with `DeserializationError` without reaching the
/// handler. Handler errors and panics surface as `HandlerError`. On
/// success the parsed envelope is returned.
pub async fn handle_message(
    mut message: InboundMessage,
    handler: &MessageHandler,
    cleanup: Option<Cleanup>,
) -> Result<Envelope> {
    let outcome = match Envelope::parse(message.body()) {
        Ok(envelope) => run_handler(handler, envelope.clone()).await.map(|()| envelope),
        Err(e) => Err(e),
    };

    message.ack();
    if let Some(cleanup) = cleanup {
        cleanup();
    }

    outcome
}

async fn run_handler(handler: &MessageHandler, envelope: Envelope) -> Result<()> {
    // The handler may panic while building its future, not just while polling it.
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
        Ok(future) => future,
        Err(panic) => return Err(MqLinkError::HandlerError(panic_message(panic.as_ref()))),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ MqLinkError::HandlerError(_))) => Err(e),
        Ok(Err(e)) => Err(MqLinkError::HandlerError(e.to_string())),
        Err(panic) => Err(MqLinkError::HandlerError(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Builds the cleanup for each delivery of a subscription.
pub(crate) type CleanupFactory = Arc<dyn Fn() -> Cleanup + Send + Sync>;

pub(crate) struct Dispatcher {
    pub label: String,
    pub handler: MessageHandler,
    pub cancelled: Arc<AtomicBool>,
    pub stats: Option<Arc<SubscriptionStats>>,
    pub cleanup: Option<CleanupFactory>,
    pub event_handlers: EventHandlers,
}

impl Dispatcher {
    /// Consume deliveries sequentially until the transport drops the sender.
    ///
    /// Once `cancelled` is set, remaining deliveries are left unacknowledged so
    /// the broker redelivers them to the next consumer.
    pub(crate) fn spawn(self, mut deliveries: mpsc::UnboundedReceiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = deliveries.recv().await {
                if self.cancelled.load(Ordering::SeqCst) {
                    log::debug!(
                        "[mq-link] Skipping delivery on cancelled subscription '{}'",
                        self.label
                    );
                    continue;
                }

                self.event_handlers.emit_receive(message.body());
                if let Some(stats) = &self.stats {
                    stats.record_message();
                }

                let cleanup = self.cleanup.as_ref().map(|factory| factory());
                match handle_message(message, &self.handler, cleanup).await {
                    Ok(_) => log::debug!("[mq-link] Delivered message on '{}'", self.label),
                    Err(e) => log::warn!("[mq-link] Message on '{}' failed: {}", self.label, e),
                }
            }
            log::debug!("[mq-link] Dispatcher for '{}' finished", self.label);
        })
    }
}
