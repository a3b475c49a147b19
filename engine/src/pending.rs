//! Pending change set and its durable offline backup.

use crate::{error::Result, Error, FieldName, FieldSnapshot, StampedValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Local writes not yet acknowledged by the remote authority.
///
/// Holds only the latest value per field; recording a field again replaces
/// the earlier value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingChangeSet {
    changes: BTreeMap<FieldName, Value>,
}

impl PendingChangeSet {
    /// Create an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest value of a field.
    pub fn record(&mut self, field: impl Into<FieldName>, value: Value) {
        self.changes.insert(field.into(), value);
    }

    /// Get the pending value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.changes.get(field)
    }

    /// Check whether a field is pending.
    pub fn contains(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    /// Iterate over pending `(field, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.changes.iter()
    }

    /// Number of pending fields.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Take every pending change, leaving the set empty.
    pub fn take(&mut self) -> BTreeMap<FieldName, Value> {
        std::mem::take(&mut self.changes)
    }

    /// Put changes back after a failed exchange.
    ///
    /// Fields recorded since the changes were taken are newer and are kept.
    pub fn restore(&mut self, changes: impl IntoIterator<Item = (FieldName, Value)>) {
        for (field, value) in changes {
            self.changes.entry(field).or_insert(value);
        }
    }

    /// Drop fields superseded by a newer value from elsewhere.
    pub fn discard<'a>(&mut self, fields: impl IntoIterator<Item = &'a FieldName>) {
        for field in fields {
            self.changes.remove(field);
        }
    }
}

/// Durable copy of pending changes, kept with their local timestamps.
///
/// Several instances may write the same backup record, so entries merge per
/// field (greater timestamp kept) instead of replacing each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineBackup {
    entries: FieldSnapshot,
}

impl OfflineBackup {
    /// Create an empty backup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add stamped changes, keeping the newer entry per field.
    ///
    /// Returns true if anything changed.
    pub fn absorb(&mut self, changes: &FieldSnapshot) -> bool {
        let mut changed = false;
        for (field, incoming) in changes {
            let newer = self
                .entries
                .get(field)
                .map_or(true, |existing| incoming.timestamp > existing.timestamp);
            if newer {
                self.entries.insert(field.clone(), incoming.clone());
                changed = true;
            }
        }
        changed
    }

    /// Remove entries covered by an acknowledgement.
    ///
    /// An entry is released when the acknowledged change for its field is at
    /// least as new. Returns true if anything changed.
    pub fn release(&mut self, acknowledged: &FieldSnapshot) -> bool {
        let before = self.entries.len();
        self.entries.retain(|field, entry| {
            acknowledged
                .get(field)
                .map_or(true, |ack| ack.timestamp < entry.timestamp)
        });
        self.entries.len() != before
    }

    /// Borrow the entries.
    pub fn entries(&self) -> &FieldSnapshot {
        &self.entries
    }

    /// Get one entry.
    pub fn get(&self, field: &str) -> Option<&StampedValue> {
        self.entries.get(field)
    }

    /// Number of backed-up fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the backup is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::CorruptState(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::CorruptState(e.to_string()))
    }
}
