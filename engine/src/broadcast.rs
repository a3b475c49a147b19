//! Messages exchanged between instances sharing one durable store.

use crate::{error::Result, Error, SettingsDocument};
use serde::{Deserialize, Serialize};

/// A cross-instance message.
///
/// Ephemeral: never persisted as state and never acknowledged. Receivers
/// merge the payload; they never overwrite with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastMessage {
    /// The sender's full merged document
    SnapshotUpdate { payload: SettingsDocument },
}

impl BroadcastMessage {
    pub fn snapshot_update(payload: SettingsDocument) -> Self {
        Self::SnapshotUpdate { payload }
    }

    /// Borrow the carried document.
    pub fn document(&self) -> &SettingsDocument {
        match self {
            Self::SnapshotUpdate { payload } => payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::CorruptState(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::CorruptState(e.to_string()))
    }
}
