//! Cross-instance broadcast.
//!
//! Delivery is best-effort, at-most-once and unordered. Receivers merge what
//! they get; losing a message only delays convergence until the next one.

mod channel;
mod storage;

pub use channel::ChannelHub;
pub use storage::StorageBroadcaster;

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tally_engine::BroadcastMessage;
use tokio::sync::mpsc;

use crate::{config::TransportPreference, storage::DurableStorage};

/// Receiving end of an instance's broadcast subscription.
pub type Inbox = mpsc::UnboundedReceiver<BroadcastMessage>;

/// Which transport carries broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Channel,
    Storage,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Channel => f.write_str("channel"),
            TransportKind::Storage => f.write_str("storage"),
        }
    }
}

/// Fan-out of messages to sibling instances.
pub trait Broadcaster: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Deliver to every subscribed instance except `from`.
    ///
    /// Returns how many deliveries were handed off.
    fn publish(&self, from: &str, message: &BroadcastMessage) -> usize;

    /// Start receiving messages for `instance`.
    fn subscribe(&self, instance: &str) -> Inbox;

    fn unsubscribe(&self, instance: &str);
}

/// Pick a transport by capability.
///
/// A live channel needs a hub shared by the instances; when there is none,
/// messages go through durable storage.
pub fn select(
    preference: TransportPreference,
    hub: Option<Arc<ChannelHub>>,
    storage: Arc<dyn DurableStorage>,
) -> Arc<dyn Broadcaster> {
    match (preference, hub) {
        (TransportPreference::Storage, _) => Arc::new(StorageBroadcaster::new(storage)),
        (_, Some(hub)) => hub,
        (TransportPreference::Channel, None) => {
            tracing::warn!("Channel transport requested but no hub is available, using storage");
            Arc::new(StorageBroadcaster::new(storage))
        }
        (TransportPreference::Auto, None) => Arc::new(StorageBroadcaster::new(storage)),
    }
}
