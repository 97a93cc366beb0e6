use serde::{Deserialize, Serialize};

/// A queue the client wants to consume from.
///
/// Immutable once registered. Re-registering the same `id` replaces the
/// previous descriptor and handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Caller-chosen subscription identifier (registry key)
    pub id: String,
    /// Queue name without the destination prefix
    pub queue_name: String,
    /// Max unacknowledged messages in flight. Falls back to
    /// `ConnectionConfig::default_prefetch_size` when `None`.
    #[serde(default)]
    pub prefetch_size: Option<u32>,
}

impl QueueDescriptor {
    /// Create a descriptor with the configured default prefetch.
    pub fn new(id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            prefetch_size: None,
        }
    }

    /// Shorthand for a descriptor whose id is the queue name itself.
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self::new(queue_name.clone(), queue_name)
    }

    /// Override the prefetch limit for this queue.
    pub fn with_prefetch_size(mut self, prefetch: u32) -> Self {
        self.prefetch_size = Some(prefetch);
        self
    }

    pub(crate) fn effective_prefetch(&self, default_prefetch: u32) -> u32 {
        self.prefetch_size.unwrap_or(default_prefetch).max(1)
    }
}
