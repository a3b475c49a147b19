//! Storage fallback transport.
//!
//! Messages are written under the broadcast key of durable storage. One
//! forwarding task per subscriber turns foreign writes of that key into
//! inbox messages.

use std::sync::Arc;

use dashmap::DashMap;
use tally_engine::{BroadcastMessage, InstanceId};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};

use super::{Broadcaster, Inbox, TransportKind};
use crate::storage::{keys, DurableStorage};

pub struct StorageBroadcaster {
    storage: Arc<dyn DurableStorage>,
    forwarders: DashMap<InstanceId, JoinHandle<()>>,
}

impl StorageBroadcaster {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            forwarders: DashMap::new(),
        }
    }
}

impl Broadcaster for StorageBroadcaster {
    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }

    fn publish(&self, from: &str, message: &BroadcastMessage) -> usize {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(instance = %from, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        match self.storage.set(from, keys::BROADCAST, bytes) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::warn!(instance = %from, error = %e, "Failed to write broadcast");
                0
            }
        }
    }

    fn subscribe(&self, instance: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let storage = self.storage.clone();
        let mut events = storage.subscribe();
        let me = instance.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(instance = %me, skipped, "Broadcast forwarder lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if event.key != keys::BROADCAST || event.origin == me {
                    continue;
                }

                let message = match storage.get(keys::BROADCAST) {
                    Ok(Some(bytes)) => match BroadcastMessage::from_bytes(&bytes) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(instance = %me, error = %e, "Ignoring unreadable broadcast");
                            continue;
                        }
                    },
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(instance = %me, error = %e, "Failed to read broadcast");
                        continue;
                    }
                };

                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.forwarders.insert(instance.to_string(), forwarder) {
            previous.abort();
        }
        rx
    }

    fn unsubscribe(&self, instance: &str) {
        if let Some((_, forwarder)) = self.forwarders.remove(instance) {
            forwarder.abort();
        }
    }
}
