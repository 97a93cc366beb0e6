//! Durable subscription registry.
//!
//! Entries are keyed by the caller's subscription id and survive
//! disconnects. Each registration gets a fresh generation so that a cancel
//! issued by an older handle cannot remove a newer registration.

use crate::{
    dispatch::{Dispatcher, MessageHandler},
    error::{MqLinkError, Result},
    models::{QueueDescriptor, SubscriptionInfo},
    transport::{SubscribeHeaders, Transport, TransportSubscription},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Current time in millis since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Delivery counters shared with the dispatcher task.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionStats {
    received: AtomicU64,
    last_message_at_ms: AtomicU64,
}

impl SubscriptionStats {
    pub(crate) fn record_message(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn last_message_at_ms(&self) -> Option<u64> {
        match self.last_message_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

/// A transport subscription plus the dispatcher task draining it.
pub(crate) struct LiveSubscription {
    handle: Box<dyn TransportSubscription>,
    cancelled: Arc<AtomicBool>,
    _dispatcher: JoinHandle<()>,
}

impl LiveSubscription {
    pub(crate) async fn open(
        transport: &dyn Transport,
        destination: &str,
        prefetch: u32,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let handle = transport
            .subscribe(destination, &SubscribeHeaders::new(prefetch), delivery_tx)
            .await?;
        let cancelled = dispatcher.cancelled.clone();
        let task = dispatcher.spawn(delivery_rx);
        Ok(Self {
            handle,
            cancelled,
            _dispatcher: task,
        })
    }

    /// Stop dispatching and release the transport subscription.
    /// A handler run already in progress is left to finish.
    pub(crate) fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.unsubscribe();
    }
}

pub(crate) struct SubEntry {
    pub descriptor: QueueDescriptor,
    pub destination: String,
    pub prefetch: u32,
    pub handler: MessageHandler,
    pub live: Option<LiveSubscription>,
    pub generation: u64,
    pub created_at_ms: u64,
    pub stats: Arc<SubscriptionStats>,
}

/// A `subscribe()` issued while disconnected, answered after the next replay.
struct DeferredSubscribe {
    id: String,
    result_tx: oneshot::Sender<Result<u64>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, SubEntry>,
    deferred: Vec<DeferredSubscribe>,
    next_generation: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_generation: 1,
            ..Self::default()
        }
    }

    /// Register (or overwrite) an entry and return its generation.
    /// An overwritten entry's live subscription is cancelled first.
    pub(crate) fn register(
        &mut self,
        descriptor: QueueDescriptor,
        destination: String,
        prefetch: u32,
        handler: MessageHandler,
    ) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let id = descriptor.id.clone();
        if let Some(previous) = self.entries.remove(&id) {
            log::debug!(
                "[mq-link] Replacing subscription '{}' (gen {} -> {})",
                id,
                previous.generation,
                generation
            );
            if let Some(live) = previous.live {
                live.cancel();
            }
        }

        self.entries.insert(
            id,
            SubEntry {
                descriptor,
                destination,
                prefetch,
                handler,
                live: None,
                generation,
                created_at_ms: now_ms(),
                stats: Arc::new(SubscriptionStats::default()),
            },
        );
        generation
    }

    /// Remove an entry. With `Some(generation)` only that registration is
    /// removed. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, id: &str, generation: Option<u64>) -> bool {
        let matches = match generation {
            Some(gen) => self.entries.get(id).map_or(false, |e| e.generation == gen),
            None => self.entries.contains_key(id),
        };
        if !matches {
            return false;
        }

        if let Some(entry) = self.entries.remove(id) {
            if let Some(live) = entry.live {
                live.cancel();
            }
        }

        let (cancelled, kept): (Vec<_>, Vec<_>) =
            self.deferred.drain(..).partition(|d| d.id == id);
        self.deferred = kept;
        for waiter in cancelled {
            let _ = waiter.result_tx.send(Err(MqLinkError::Cancelled));
        }
        true
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut SubEntry> {
        self.entries.get_mut(id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn defer(&mut self, id: String, result_tx: oneshot::Sender<Result<u64>>) {
        self.deferred.push(DeferredSubscribe { id, result_tx });
    }

    /// Answer every deferred subscribe with the id's current generation, or
    /// `Cancelled` if it is no longer registered.
    pub(crate) fn resolve_deferred(&mut self) {
        for waiter in self.deferred.drain(..) {
            let result = match self.entries.get(&waiter.id) {
                Some(entry) => Ok(entry.generation),
                None => Err(MqLinkError::Cancelled),
            };
            let _ = waiter.result_tx.send(result);
        }
    }

    /// Forget every live subscription; the session that owned them is gone.
    pub(crate) fn drop_live(&mut self) -> usize {
        let mut dropped = 0;
        for entry in self.entries.values_mut() {
            if let Some(live) = entry.live.take() {
                live.cancel();
                dropped += 1;
            }
        }
        dropped
    }

    /// Cancel everything and fail deferred subscribes. Used on shutdown.
    pub(crate) fn close(&mut self) {
        self.drop_live();
        self.entries.clear();
        for waiter in self.deferred.drain(..) {
            let _ = waiter.result_tx.send(Err(MqLinkError::Cancelled));
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: id.clone(),
                destination: entry.destination.clone(),
                prefetch_size: entry.prefetch,
                live: entry.live.is_some(),
                created_at_ms: entry.created_at_ms,
                messages_received: entry.stats.messages_received(),
                last_message_at_ms: entry.stats.last_message_at_ms(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
