//! Data models for the mq-link client library.
//!
//! Defines broker configuration, queue descriptors, the JSON message
//! envelope, and subscription snapshots.

pub mod connection_options;
pub mod envelope;
pub mod queue_descriptor;
pub mod subscription_info;


pub use connection_options::ConnectionConfig;
pub use envelope::Envelope;
pub use queue_descriptor::QueueDescriptor;
pub use subscription_info::SubscriptionInfo;
