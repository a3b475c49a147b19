//! Durable form of the settings document.
//!
//! Persisted documents are the bridge between a [`LocalStore`] and durable
//! storage. Serialization goes through `BTreeMap`s, so the bytes for a given
//! document are always the same.

use crate::{error::Result, store::Repair, Error, LocalStore, Schema, SchemaVersion, SettingsDocument};
use serde::{Deserialize, Serialize};

/// Version of the persisted format.
pub const FORMAT_VERSION: u32 = 1;

/// A settings document as written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    /// Persisted format version
    pub format_version: u32,
    /// Schema version the document was written with
    pub schema_version: SchemaVersion,
    /// The document itself
    pub document: SettingsDocument,
}

impl PersistedDocument {
    /// Capture the current state of a store.
    pub fn from_store(store: &LocalStore) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            schema_version: store.schema().version,
            document: store.snapshot(),
        }
    }

    /// Check that this document can be loaded with `schema`.
    ///
    /// Documents from a newer format or schema cannot be interpreted; older
    /// schema versions are loaded and repaired field by field.
    pub fn check(&self, schema: &Schema) -> Result<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(Error::CorruptState(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        if self.schema_version > schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }
        Ok(())
    }

    /// Rebuild a store from this document.
    pub fn into_store(self, schema: Schema) -> Result<(LocalStore, Vec<Repair>)> {
        self.check(&schema)?;
        Ok(LocalStore::restore(schema, self.document))
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
