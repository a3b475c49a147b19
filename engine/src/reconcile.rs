//! Reconciliation protocol state.
//!
//! The reconciler decides what to send to the remote authority and how to
//! fold the answer back into the local replica. It performs no IO: the caller
//! runs the exchange and reports the outcome.
//!
//! # Protocol
//!
//! 1. At most one exchange is in flight; further triggers are no-ops
//! 2. Pending changes (plus any offline backup) are snapshotted and the live
//!    buffer is cleared optimistically
//! 3. `accepted` advances the cursor
//! 4. `conflict` merges the remote snapshot field by field and re-submits
//!    only the fields where the local value still prevails
//! 5. A transport failure restores the snapshot into the buffer

use crate::{
    merge::{MergeReport, TieBreak},
    FieldName, FieldSnapshot, LocalStore, OfflineBackup, PendingChangeSet, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default bound on consecutive conflict re-submissions.
pub const DEFAULT_MAX_CONFLICT_ROUNDS: u32 = 3;

/// Where this replica stands relative to the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Time of the last successful reconciliation (0 = never)
    pub last_reconciled: Timestamp,
    /// Whether the link was online at the last update
    pub online: bool,
}

/// What caused a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// Quiet period after local edits
    Debounce,
    /// Link came back online
    Reconnect,
    /// Periodic low-priority exchange
    Keepalive,
    /// Local values still prevailed after a conflict
    Resubmit,
    /// Pending or backed-up changes found at startup
    Startup,
    /// Explicit request from the application
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trigger::Debounce => "debounce",
            Trigger::Reconnect => "reconnect",
            Trigger::Keepalive => "keepalive",
            Trigger::Resubmit => "resubmit",
            Trigger::Startup => "startup",
            Trigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Request body sent to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// Latest value per changed field
    pub changes: BTreeMap<FieldName, Value>,
    /// Remote high-water mark this replica has caught up to
    pub cursor: Timestamp,
}

/// Answer of the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReconcileResponse {
    /// Changes applied as sent
    Accepted,
    /// The authority moved since the cursor; nothing was applied
    Conflict { snapshot: FieldSnapshot },
}

/// A started exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Body to send to the remote authority
    pub request: ReconcileRequest,
    /// What folding the offline backup did to the local document
    pub restored: MergeReport,
    /// Backup entries the document has moved past; already released from
    /// the backup
    pub superseded: FieldSnapshot,
}

/// Result of folding a conflict response into the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    /// What the merge did to the local document
    pub report: MergeReport,
    /// Submitted fields whose local value still prevails
    pub resubmit: FieldSnapshot,
    /// Submitted fields that are settled (lost to the remote, or converged)
    pub acknowledged: FieldSnapshot,
    /// Nothing left to send; the cursor advanced
    pub converged: bool,
    /// Re-submission rounds ran out; changes wait for the next trigger
    pub exhausted: bool,
}

impl ConflictOutcome {
    /// Whether the caller should re-submit immediately.
    pub fn retry_now(&self) -> bool {
        !self.converged && !self.exhausted
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    trigger: Trigger,
    submitted: FieldSnapshot,
}

/// Drives the reconciliation protocol for one replica.
#[derive(Debug, Clone)]
pub struct Reconciler {
    cursor: SyncCursor,
    /// Highest remote timestamp seen in conflict snapshots or fetches
    observed_remote: Timestamp,
    in_flight: Option<InFlight>,
    conflict_rounds: u32,
    max_conflict_rounds: u32,
}

impl Reconciler {
    /// Create a reconciler that has never reconciled.
    pub fn new(max_conflict_rounds: u32, online: bool) -> Self {
        Self {
            cursor: SyncCursor {
                last_reconciled: 0,
                online,
            },
            observed_remote: 0,
            in_flight: None,
            conflict_rounds: 0,
            max_conflict_rounds,
        }
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Cursor value sent with the next request.
    pub fn request_cursor(&self) -> Timestamp {
        self.cursor.last_reconciled.max(self.observed_remote)
    }

    pub fn set_online(&mut self, online: bool) {
        self.cursor.online = online;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Trigger of the exchange in flight.
    pub fn in_flight_trigger(&self) -> Option<Trigger> {
        self.in_flight.as_ref().map(|f| f.trigger)
    }

    /// Changes carried by the exchange in flight.
    pub fn submitted(&self) -> Option<&FieldSnapshot> {
        self.in_flight.as_ref().map(|f| &f.submitted)
    }

    /// Record the remote timestamps of a fetched snapshot.
    pub fn observe_remote(&mut self, snapshot: &FieldSnapshot) {
        if let Some(max) = snapshot.values().map(|s| s.timestamp).max() {
            self.observed_remote = self.observed_remote.max(max);
        }
    }

    /// Start an exchange.
    ///
    /// Returns `None` if one is already in flight. Otherwise folds the offline
    /// backup into the store, snapshots every pending change with its local
    /// timestamp, clears the live buffer, and returns the request to send. A
    /// request with no changes is valid (keepalive).
    ///
    /// Backup entries the store holds exactly are submitted; the rest were
    /// superseded and are released.
    pub fn begin(
        &mut self,
        trigger: Trigger,
        pending: &mut PendingChangeSet,
        backup: &mut OfflineBackup,
        store: &mut LocalStore,
    ) -> Option<Submission> {
        if self.in_flight.is_some() {
            return None;
        }

        // Backed-up changes may come from a previous run or a sibling. Newer
        // ones take effect locally.
        let restored = store.merge(backup.entries(), TieBreak::GreaterValue);
        pending.discard(&restored.adopted);

        let (mut submitted, superseded): (FieldSnapshot, FieldSnapshot) = backup
            .entries()
            .clone()
            .into_iter()
            .partition(|(field, entry)| store.document().stamped(field).as_ref() == Some(entry));
        backup.release(&superseded);

        for (field, _) in pending.take() {
            if let Some(stamped) = store.document().stamped(&field) {
                submitted.insert(field, stamped);
            }
        }

        let request = ReconcileRequest {
            changes: submitted
                .iter()
                .map(|(field, stamped)| (field.clone(), stamped.value.clone()))
                .collect(),
            cursor: self.request_cursor(),
        };

        self.in_flight = Some(InFlight { trigger, submitted });
        Some(Submission {
            request,
            restored,
            superseded,
        })
    }

    /// The authority accepted the exchange.
    ///
    /// Returns the acknowledged changes.
    pub fn accepted(&mut self, now: Timestamp) -> FieldSnapshot {
        let submitted = self.take_submitted();
        self.cursor.last_reconciled = self.cursor.last_reconciled.max(now);
        self.conflict_rounds = 0;
        submitted
    }

    /// The authority answered with a conflict snapshot.
    pub fn conflict(
        &mut self,
        now: Timestamp,
        remote: &FieldSnapshot,
        pending: &mut PendingChangeSet,
        store: &mut LocalStore,
    ) -> ConflictOutcome {
        let submitted = self.take_submitted();
        self.observe_remote(remote);

        let report = store.merge(remote, TieBreak::RemoteWins);
        pending.discard(&report.adopted);

        let (resubmit, lost): (FieldSnapshot, FieldSnapshot) = submitted
            .into_iter()
            .partition(|(field, stamped)| store.document().stamped(field).as_ref() == Some(stamped));

        if resubmit.is_empty() {
            self.cursor.last_reconciled = self.cursor.last_reconciled.max(now);
            self.conflict_rounds = 0;
            return ConflictOutcome {
                report,
                resubmit,
                acknowledged: lost,
                converged: true,
                exhausted: false,
            };
        }

        self.conflict_rounds += 1;
        let exhausted = self.conflict_rounds > self.max_conflict_rounds;
        if exhausted {
            self.conflict_rounds = 0;
        }

        pending.restore(
            resubmit
                .iter()
                .map(|(field, stamped)| (field.clone(), stamped.value.clone())),
        );

        ConflictOutcome {
            report,
            resubmit,
            acknowledged: lost,
            converged: false,
            exhausted,
        }
    }

    /// The exchange failed in transport or timed out.
    ///
    /// Restores the submitted changes into the buffer, except fields whose
    /// store value has since been replaced. Returns the restored changes.
    pub fn failed(
        &mut self,
        pending: &mut PendingChangeSet,
        store: &LocalStore,
    ) -> FieldSnapshot {
        let submitted = self.take_submitted();
        self.cursor.online = false;
        self.conflict_rounds = 0;

        let restored: FieldSnapshot = submitted
            .into_iter()
            .filter(|(field, stamped)| store.document().stamped(field).as_ref() == Some(stamped))
            .collect();

        pending.restore(
            restored
                .iter()
                .map(|(field, stamped)| (field.clone(), stamped.value.clone())),
        );
        restored
    }

    fn take_submitted(&mut self) -> FieldSnapshot {
        self.in_flight
            .take()
            .map(|f| f.submitted)
            .unwrap_or_default()
    }
}
