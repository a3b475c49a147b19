//! The settings document and its per-field timestamps.

use crate::{FieldName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A field value together with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StampedValue {
    pub value: Value,
    pub timestamp: Timestamp,
    /// Taken from the remote authority rather than written locally.
    /// Outranks a local value with the same timestamp.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub confirmed: bool,
}

impl StampedValue {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self {
            value,
            timestamp,
            confirmed: false,
        }
    }

    /// Mark the value as held by the remote authority.
    pub fn into_confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

/// Field name to stamped value. This is the wire shape remote snapshots use.
pub type FieldSnapshot = BTreeMap<FieldName, StampedValue>;

/// Field values plus a parallel map of last-modified timestamps.
///
/// The only way to put a value in is [`SettingsDocument::set`], which writes
/// both maps, so every field with a value always has a timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    values: BTreeMap<FieldName, Value>,
    timestamps: BTreeMap<FieldName, Timestamp>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    confirmed: BTreeSet<FieldName>,
}

impl SettingsDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a stamped snapshot.
    pub fn from_snapshot(snapshot: FieldSnapshot) -> Self {
        let mut document = Self::new();
        for (name, stamped) in snapshot {
            document.set_stamped(name, stamped);
        }
        document
    }

    /// Get a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Get a field's last-modified timestamp.
    pub fn timestamp(&self, name: &str) -> Option<Timestamp> {
        self.timestamps.get(name).copied()
    }

    /// Get a field value with its timestamp.
    pub fn stamped(&self, name: &str) -> Option<StampedValue> {
        let value = self.values.get(name)?;
        let timestamp = self.timestamps.get(name).copied().unwrap_or(0);
        Some(StampedValue {
            value: value.clone(),
            timestamp,
            confirmed: self.confirmed.contains(name),
        })
    }

    /// Write a local field value and its timestamp.
    pub fn set(&mut self, name: impl Into<FieldName>, value: Value, timestamp: Timestamp) {
        self.set_stamped(name, StampedValue::new(value, timestamp));
    }

    /// Write a stamped value, keeping its confirmation.
    pub fn set_stamped(&mut self, name: impl Into<FieldName>, stamped: StampedValue) {
        let name = name.into();
        if stamped.confirmed {
            self.confirmed.insert(name.clone());
        } else {
            self.confirmed.remove(&name);
        }
        self.timestamps.insert(name.clone(), stamped.timestamp);
        self.values.insert(name, stamped.value);
    }

    /// Whether a field holds the remote authority's value.
    pub fn is_confirmed(&self, name: &str) -> bool {
        self.confirmed.contains(name)
    }

    /// Remove a field entirely.
    pub fn remove(&mut self, name: &str) -> Option<StampedValue> {
        let confirmed = self.confirmed.remove(name);
        let timestamp = self.timestamps.remove(name).unwrap_or(0);
        self.values.remove(name).map(|value| StampedValue {
            value,
            timestamp,
            confirmed,
        })
    }

    /// Check whether a field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate over field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &FieldName> {
        self.values.keys()
    }

    /// Iterate over `(name, value)` pairs in order.
    pub fn values(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.values.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Highest timestamp of any field.
    pub fn max_timestamp(&self) -> Timestamp {
        self.timestamps.values().copied().max().unwrap_or(0)
    }

    /// Convert to the stamped wire shape.
    pub fn to_snapshot(&self) -> FieldSnapshot {
        self.values
            .keys()
            .filter_map(|name| Some((name.clone(), self.stamped(name)?)))
            .collect()
    }

    /// Compare values only, ignoring timestamps.
    pub fn same_values(&self, other: &SettingsDocument) -> bool {
        self.values == other.values
    }
}
