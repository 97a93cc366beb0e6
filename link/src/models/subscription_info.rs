//! Subscription metadata exposed to callers.
//!
//! [`SubscriptionInfo`] provides a read-only snapshot of a registered
//! subscription's state. Useful for debugging, tests, and dashboards.

use serde::{Deserialize, Serialize};

/// Read-only snapshot of a registered subscription.
///
/// Returned by [`MqLinkClient::subscriptions()`](crate::MqLinkClient::subscriptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Subscription ID chosen by the caller.
    pub id: String,
    /// Full broker destination (prefix + queue name).
    pub destination: String,
    /// Effective prefetch limit.
    pub prefetch_size: u32,
    /// Whether a transport subscription currently backs this entry.
    pub live: bool,
    /// Timestamp (millis since Unix epoch) when the subscription was registered.
    pub created_at_ms: u64,
    /// Number of messages delivered to the handler so far.
    pub messages_received: u64,
    /// Timestamp (millis since Unix epoch) of the last delivered message,
    /// or `None` if nothing has arrived yet.
    pub last_message_at_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_info_serialize_roundtrip() {
        let info = SubscriptionInfo {
            id: "orders".to_string(),
            destination: "/queue/orders".to_string(),
            prefetch_size: 1,
            live: true,
            created_at_ms: 1700000000000,
            messages_received: 3,
            last_message_at_ms: Some(1700000000500),
        };
        let json = serde_json::to_string(&info).unwrap();
        let deserialized: SubscriptionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, "orders");
        assert_eq!(deserialized.destination, "/queue/orders");
        assert_eq!(deserialized.messages_received, 3);
        assert!(deserialized.live);
    }

    #[test]
    fn test_subscription_info_without_messages() {
        let info = SubscriptionInfo {
            id: "idle".to_string(),
            destination: "/queue/idle".to_string(),
            prefetch_size: 5,
            live: false,
            created_at_ms: 1700000000000,
            messages_received: 0,
            last_message_at_ms: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"live\":false"));
        let deserialized: SubscriptionInfo = serde_json::from_str(&json).unwrap();
        assert!(deserialized.last_message_at_ms.is_none());
    }
}
