//! Live channel transport.
//!
//! Tracks the inboxes of live instances and fans messages out to them.

use std::sync::Arc;

use dashmap::DashMap;
use tally_engine::{BroadcastMessage, InstanceId};
use tokio::sync::mpsc;

use super::{Broadcaster, Inbox, TransportKind};

/// Sender half of an instance inbox.
pub type InboxSender = mpsc::UnboundedSender<BroadcastMessage>;

/// Registry of live instance inboxes.
///
/// Thread-safe and shared across instances via `Arc`.
#[derive(Debug, Default)]
pub struct ChannelHub {
    inboxes: DashMap<InstanceId, InboxSender>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
        }
    }

    /// Create a hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an inbox, replacing any earlier one for the same instance.
    pub fn register(&self, instance: impl Into<InstanceId>, sender: InboxSender) {
        let instance = instance.into();
        self.inboxes.insert(instance.clone(), sender);
        tracing::debug!(instance = %instance, "Instance registered with channel hub");
    }

    pub fn unregister(&self, instance: &str) {
        if self.inboxes.remove(instance).is_some() {
            tracing::debug!(
                instance = %instance,
                remaining = self.inboxes.len(),
                "Instance unregistered from channel hub"
            );
        }
    }

    /// Send a message to every instance except the sender.
    ///
    /// Returns the number of instances that received the message. Inboxes
    /// whose receiver is gone are pruned.
    pub fn broadcast_except(&self, sender: &str, message: &BroadcastMessage) -> usize {
        let mut sent_count = 0;
        let mut closed = Vec::new();

        for entry in self.inboxes.iter() {
            if entry.key() == sender {
                continue;
            }
            if entry.value().send(message.clone()).is_ok() {
                sent_count += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for instance in closed {
            self.inboxes.remove(&instance);
        }

        tracing::trace!(
            sender = %sender,
            recipients = sent_count,
            "Broadcast message to instances"
        );

        sent_count
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.inboxes.len()
    }
}

impl Broadcaster for ChannelHub {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn publish(&self, from: &str, message: &BroadcastMessage) -> usize {
        self.broadcast_except(from, message)
    }

    fn subscribe(&self, instance: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(instance, tx);
        rx
    }

    fn unsubscribe(&self, instance: &str) {
        self.unregister(instance);
    }
}
