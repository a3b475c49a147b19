//! In-memory storage shared by instances in one process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{DurableStorage, StorageEvent, EVENT_CAPACITY};
use crate::error::StorageError;

/// Process-local durable storage.
///
/// Survives instance restarts within the process, not process restarts.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// Create a storage wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, origin: &str, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        if let Some(existing) = self.entries.get(key) {
            if *existing == bytes {
                return Ok(false);
            }
        }
        self.entries.insert(key.to_string(), bytes);

        tracing::trace!(key = %key, origin = %origin, "Storage key written");

        // Nobody listening is fine
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            origin: origin.to_string(),
        });
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
