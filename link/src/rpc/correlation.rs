//! RPC correlation engine.
//!
//! Every call owns a reply destination (a random UUID unless the caller
//! supplies one). The reply subscription is opened before the request is
//! published, the first reply is handed to the caller's callback exactly
//! once, and the call is then torn down. Anything arriving later on the same
//! destination is an orphan: acknowledged, logged, and dropped.

use crate::{
    connection::{ControlMsg, ControlSender},
    dispatch::{Cleanup, CleanupFactory, HandlerFuture, MessageHandler},
    models::Envelope,
    subscription::LiveSubscription,
};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Receives the first reply to an RPC call.
pub type ReplyCallback = Box<dyn FnOnce(Envelope) + Send>;

/// Fresh reply destination name.
pub(crate) fn new_reply_destination() -> String {
    Uuid::new_v4().to_string()
}

/// Handler for a reply subscription: the first envelope goes to `callback`,
/// later ones are orphans.
pub(crate) fn reply_handler(reply_to: String, callback: ReplyCallback) -> MessageHandler {
    let slot = Arc::new(Mutex::new(Some(callback)));
    Arc::new(move |envelope: Envelope| -> HandlerFuture {
        let callback = slot.lock().ok().and_then(|mut guard| guard.take());
        match callback {
            Some(callback) => {
                log::debug!("[mq-link] Reply received on '{}'", reply_to);
                callback(envelope);
            },
            None => {
                log::warn!(
                    "[mq-link] Orphaned reply on '{}' (call already completed)",
                    reply_to
                );
            },
        }
        async { Ok(()) }.boxed()
    })
}

/// Cleanup run after each reply is acknowledged: asks the connection task to
/// retire the call.
pub(crate) fn completion_cleanup(control: ControlSender, reply_to: String, call_id: u64) -> CleanupFactory {
    Arc::new(move || -> Cleanup {
        let control = control.clone();
        let reply_to = reply_to.clone();
        Box::new(move || {
            let _ = control.send(ControlMsg::CompleteRpc { reply_to, call_id });
        })
    })
}

pub(crate) struct PendingRpcCall {
    pub call_id: u64,
    pub destination: String,
    pub handler: MessageHandler,
    pub cleanup: CleanupFactory,
    pub live: Option<LiveSubscription>,
}

/// Pending calls keyed by reply destination. One call per destination.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: HashMap<String, PendingRpcCall>,
    next_call_id: u64,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_call_id(&mut self) -> u64 {
        self.next_call_id += 1;
        self.next_call_id
    }

    pub(crate) fn contains(&self, reply_to: &str) -> bool {
        self.calls.contains_key(reply_to)
    }

    pub(crate) fn insert(&mut self, reply_to: String, call: PendingRpcCall) {
        self.calls.insert(reply_to, call);
    }

    /// Retire a call if `call_id` still owns `reply_to`. Cancels its reply
    /// subscription. Returns whether a call was removed.
    pub(crate) fn complete(&mut self, reply_to: &str, call_id: u64) -> bool {
        if !self.calls.get(reply_to).map_or(false, |c| c.call_id == call_id) {
            return false;
        }
        if let Some(call) = self.calls.remove(reply_to) {
            if let Some(live) = call.live {
                live.cancel();
            }
        }
        true
    }

    pub(crate) fn get_mut(&mut self, reply_to: &str) -> Option<&mut PendingRpcCall> {
        self.calls.get_mut(reply_to)
    }

    pub(crate) fn reply_destinations(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.calls.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn drop_live(&mut self) {
        for call in self.calls.values_mut() {
            if let Some(live) = call.live.take() {
                live.cancel();
            }
        }
    }

    pub(crate) fn close(&mut self) {
        self.drop_live();
        self.calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handle_message;
    use crate::transport::InboundMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn pending(call_id: u64) -> PendingRpcCall {
        let (control, _rx) = mpsc::unbounded_channel();
        PendingRpcCall {
            call_id,
            destination: "/queue/r".to_string(),
            handler: reply_handler("r".to_string(), Box::new(|_| {})),
            cleanup: completion_cleanup(control, "r".to_string(), call_id),
            live: None,
        }
    }

    #[test]
    fn test_reply_destinations_are_unique_uuids() {
        let a = new_reply_destination();
        let b = new_reply_destination();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[tokio::test]
    async fn test_first_reply_wins() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handler = reply_handler(
            "r".to_string(),
            Box::new(move |envelope| {
                let _ = seen_tx.send(envelope.body);
            }),
        );

        for n in [1, 2, 3] {
            let body = json!({ "body": n }).to_string();
            handle_message(InboundMessage::new(body, || {}), &handler, None)
                .await
                .unwrap();
        }

        assert_eq!(seen_rx.recv().await, Some(json!(1)));
        assert!(seen_rx.recv().await.is_none(), "callback must run only once");
    }

    #[tokio::test]
    async fn test_completion_cleanup_notifies_connection_task() {
        let (control, mut rx) = mpsc::unbounded_channel();
        let factory = completion_cleanup(control, "reply-1".to_string(), 7);
        factory()();

        match rx.recv().await {
            Some(ControlMsg::CompleteRpc { reply_to, call_id }) => {
                assert_eq!(reply_to, "reply-1");
                assert_eq!(call_id, 7);
            },
            _ => panic!("expected CompleteRpc"),
        }
    }

    #[test]
    fn test_complete_checks_call_id() {
        let mut calls = PendingCalls::new();
        let id = calls.next_call_id();
        calls.insert("r".to_string(), pending(id));

        assert!(!calls.complete("r", id + 1), "a different call must not retire this one");
        assert!(calls.contains("r"));
        assert!(calls.complete("r", id));
        assert!(!calls.complete("r", id), "second completion is a no-op");
        assert_eq!(calls.len(), 0);
    }
}
