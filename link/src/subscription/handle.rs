use crate::connection::{ControlMsg, ControlSender};

/// Caller's grip on one registration of a subscription.
///
/// The registration is durable: dropping the handle does **not**
/// unsubscribe. Call [`cancel`](Self::cancel) or
/// [`MqLinkClient::unsubscribe`](crate::MqLinkClient::unsubscribe).
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    generation: u64,
    control: ControlSender,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, generation: u64, control: ControlSender) -> Self {
        Self {
            id,
            generation,
            control,
        }
    }

    /// Subscription ID (the descriptor id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registration generation this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unsubscribe this registration.
    ///
    /// No-op if the id has since been re-registered: only the generation
    /// this handle was issued for is removed.
    pub fn cancel(&self) {
        let _ = self.control.send(ControlMsg::Unsubscribe {
            id: self.id.clone(),
            generation: Some(self.generation),
        });
    }
}
