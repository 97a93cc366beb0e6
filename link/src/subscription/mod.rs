//! Subscription registry and caller-facing handles.
//!
//! - [`registry`]: durable map of desired subscriptions, replayed on every
//!   (re)connect, plus the live transport subscriptions backing them
//! - [`handle`]: [`SubscriptionHandle`] returned by `subscribe()`

pub mod handle;
pub(crate) mod registry;

pub use handle::SubscriptionHandle;
pub(crate) use registry::{LiveSubscription, Registry, SubscriptionStats};
