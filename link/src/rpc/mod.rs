//! Request/response correlation over temporary reply queues.

pub(crate) mod correlation;

pub use correlation::ReplyCallback;
pub(crate) use correlation::{completion_cleanup, new_reply_destination, reply_handler, PendingCalls};
