//! Broker connection management.
//!
//! [`shared`] owns the connection task: a single background actor holding the
//! lifecycle state, the subscription registry, and the pending RPC calls.
//! The public client talks to it through commands; handles and dispatchers
//! use the unbounded [`ControlSender`] because they may fire from sync code.

pub(crate) mod shared;

pub(crate) use shared::SharedConnection;

use tokio::sync::mpsc;

/// Capacity of the command channel between the client and the connection task.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget requests from handles, dispatchers and timers.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// Remove a registration; `generation: None` removes whatever is registered.
    Unsubscribe { id: String, generation: Option<u64> },
    /// A reply was processed; retire the call.
    CompleteRpc { reply_to: String, call_id: u64 },
    /// The RPC timeout elapsed; retire the call without a reply.
    ExpireRpc { reply_to: String, call_id: u64 },
}

pub(crate) type ControlSender = mpsc::UnboundedSender<ControlMsg>;
