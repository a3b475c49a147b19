//! Durable local storage shared by instances on one machine.
//!
//! Writes are idempotent last-write-wins per key. Every effective write is
//! announced to subscribers with the key and the writing instance, which is
//! how instances notice each other's persisted state.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::StorageError;
use tally_engine::InstanceId;
use tokio::sync::broadcast;

/// Storage keys used by the sync runtime.
pub mod keys {
    /// Persisted settings document
    pub const DOCUMENT: &str = "settings.document";
    /// Offline backup of pending changes
    pub const PENDING: &str = "settings.pending";
    /// Cross-instance messages of the storage transport
    pub const BROADCAST: &str = "settings.broadcast";
}

/// Capacity of the change notification channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// A key was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// Instance that wrote it
    pub origin: InstanceId,
}

/// Durable key/value storage.
pub trait DurableStorage: Send + Sync + 'static {
    /// Read a key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a key on behalf of `origin`.
    ///
    /// Returns false (and notifies nobody) when the stored bytes are already
    /// identical.
    fn set(&self, origin: &str, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
