//! # Tally Engine
//!
//! The deterministic core of Tally's settings synchronization.
//!
//! This crate keeps one logical "user settings" document consistent across
//! several local replicas and an intermittently reachable remote authority.
//! It holds all of the merge and protocol logic and none of the IO: callers
//! pass `now` in, run exchanges themselves, and report back the outcome.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, network, timers or clocks
//! - **Deterministic**: same inputs, same document
//! - **Field-level**: conflicts resolve per field, never per document
//!
//! ## Core Concepts
//!
//! ### Settings document
//!
//! A [`SettingsDocument`] maps each field to a value and a last-modified
//! timestamp. The [`LocalStore`] owns a document, validates every write
//! against the field [`Schema`] and stamps local writes with a monotonic
//! [`Stamper`].
//!
//! ### Merge
//!
//! [`merge`] implements field-level last-write-wins. Exact ties are broken
//! by a fixed [`TieBreak`] rule, so merges are idempotent and, for sibling
//! replicas, commutative.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] drives exchanges with the remote authority using the
//! [`PendingChangeSet`] and [`OfflineBackup`], while the
//! [`ConnectivityMonitor`] decides when exchanges are worth attempting.
//!
//! ## Quick Start
//!
//! ```rust
//! use tally_engine::{
//!     LocalStore, OfflineBackup, PendingChangeSet, ReconcileResponse, Reconciler, Schema,
//!     Trigger,
//! };
//! use serde_json::json;
//!
//! let mut store = LocalStore::new(Schema::finance());
//! let mut pending = PendingChangeSet::new();
//! let mut backup = OfflineBackup::new();
//! let mut reconciler = Reconciler::new(3, true);
//!
//! // 1. Record a local change
//! store.record("theme", json!("dark"), 1_706_745_600_000).unwrap();
//! pending.record("theme", json!("dark"));
//!
//! // 2. Build the request for the remote authority
//! let submission = reconciler
//!     .begin(Trigger::Debounce, &mut pending, &mut backup, &mut store)
//!     .unwrap();
//! assert_eq!(submission.request.changes["theme"], json!("dark"));
//!
//! // 3. Report the response
//! let response = ReconcileResponse::Accepted;
//! if response == ReconcileResponse::Accepted {
//!     reconciler.accepted(1_706_745_600_050);
//! }
//! assert_eq!(reconciler.cursor().last_reconciled, 1_706_745_600_050);
//! ```
//!
//! ## Persistence
//!
//! [`PersistedDocument`] and [`OfflineBackup`] serialize to JSON with
//! deterministic ordering. Unreadable bytes surface as
//! [`Error::CorruptState`].

pub mod broadcast;
pub mod clock;
pub mod connectivity;
pub mod document;
pub mod error;
pub mod merge;
pub mod pending;
pub mod reconcile;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use broadcast::BroadcastMessage;
pub use clock::Stamper;
pub use connectivity::{ConnectivityMonitor, LinkState, OfflineCause, Transition};
pub use document::{FieldSnapshot, SettingsDocument, StampedValue};
pub use error::Error;
pub use merge::{FieldConflict, MergeReport, Resolution, TieBreak};
pub use pending::{OfflineBackup, PendingChangeSet};
pub use reconcile::{
    ConflictOutcome, ReconcileRequest, ReconcileResponse, Reconciler, Submission, SyncCursor,
    Trigger, DEFAULT_MAX_CONFLICT_ROUNDS,
};
pub use schema::{Constraint, FieldDef, FieldType, Schema};
pub use snapshot::{PersistedDocument, FORMAT_VERSION};
pub use store::{LocalStore, Repair};

/// Type aliases for clarity
pub type FieldName = String;
pub type InstanceId = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
