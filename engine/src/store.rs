//! Local store - the canonical settings replica of one instance.
//!
//! The store owns the schema, the document and the stamper. Every value that
//! enters the document, local or remote, passes schema validation first.

use crate::{
    error::Result,
    merge::{self, MergeReport, TieBreak},
    Error, FieldName, FieldSnapshot, Schema, SettingsDocument, Stamper, Timestamp,
};
use serde_json::Value;

/// A field that had to be repaired when restoring a persisted document.
#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub field: FieldName,
    pub error: Error,
}

/// The settings replica of one instance.
#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Field registry
    schema: Schema,
    /// Current document
    document: SettingsDocument,
    /// Timestamp source for local writes
    stamper: Stamper,
}

impl LocalStore {
    /// Create a store holding the schema defaults.
    ///
    /// Defaults are stamped `0` so that any real write, local or remote,
    /// supersedes them.
    pub fn new(schema: Schema) -> Self {
        let mut document = SettingsDocument::new();
        for (name, default) in schema.defaults() {
            document.set(name.clone(), default.clone(), 0);
        }

        Self {
            schema,
            document,
            stamper: Stamper::new(),
        }
    }

    /// Rebuild a store from a persisted document.
    ///
    /// Unknown fields are dropped, invalid values fall back to their default,
    /// and fields missing from the document get their default. Each repair
    /// is returned so the caller can log it.
    pub fn restore(schema: Schema, persisted: SettingsDocument) -> (Self, Vec<Repair>) {
        let mut store = Self::new(schema);
        let mut repairs = Vec::new();

        for (name, stamped) in persisted.to_snapshot() {
            match store.schema.validate(&name, &stamped.value) {
                Ok(()) => {
                    store.stamper.observe(stamped.timestamp);
                    store.document.set_stamped(name, stamped);
                }
                Err(error) => repairs.push(Repair { field: name, error }),
            }
        }

        (store, repairs)
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Borrow the current document.
    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    /// Clone the current document.
    pub fn snapshot(&self) -> SettingsDocument {
        self.document.clone()
    }

    /// Get a field value.
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.document.get(name)
    }

    /// Validate a value for a field without writing it.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        self.schema.validate(name, value)
    }

    /// Record a local mutation made at wall-clock time `now`.
    ///
    /// Returns the timestamp the field was stamped with.
    pub fn record(&mut self, name: &str, value: Value, now: Timestamp) -> Result<Timestamp> {
        self.schema.validate(name, &value)?;
        let timestamp = self.stamper.stamp(now);
        self.document.set(name, value, timestamp);
        Ok(timestamp)
    }

    /// Write a value with a timestamp assigned elsewhere.
    pub fn set_field(&mut self, name: &str, value: Value, timestamp: Timestamp) -> Result<()> {
        self.schema.validate(name, &value)?;
        self.stamper.observe(timestamp);
        self.document.set(name, value, timestamp);
        Ok(())
    }

    /// Merge a stamped snapshot using field-level last-write-wins.
    pub fn merge(&mut self, remote: &FieldSnapshot, tie_break: TieBreak) -> MergeReport {
        let schema = &self.schema;
        let report = merge::merge_into(&mut self.document, remote, tie_break, |name, value| {
            schema.is_valid(name, value)
        });

        for field in &report.adopted {
            if let Some(timestamp) = self.document.timestamp(field) {
                self.stamper.observe(timestamp);
            }
        }

        report
    }

    /// Replace every field with its default, freshly stamped.
    ///
    /// Returns the fields that were reset.
    pub fn reset(&mut self, now: Timestamp) -> Vec<FieldName> {
        let timestamp = self.stamper.stamp(now);
        let mut document = SettingsDocument::new();
        for (name, default) in self.schema.defaults() {
            document.set(name.clone(), default.clone(), timestamp);
        }
        self.document = document;
        self.document.field_names().cloned().collect()
    }

    /// Highest timestamp issued or observed by this store.
    pub fn last_stamp(&self) -> Timestamp {
        self.stamper.last()
    }
}
