//! Field-level last-write-wins merge.
//!
//! Resolution happens per field, never per document, so two replicas editing
//! different fields at the same time both keep their edit.
//!
//! # Rules
//!
//! 1. A field present on only one side takes that side's value
//! 2. Otherwise the strictly greater timestamp wins
//! 3. Exact ties are broken by a fixed [`TieBreak`] so every replica that
//!    performs the same merge reaches the same result
//!
//! Values adopted from the remote authority are marked confirmed. Between
//! siblings a confirmed value outranks an unconfirmed one with the same
//! timestamp, so a tie the authority already decided is decided the same
//! way on every instance.

use crate::{FieldName, FieldSnapshot, SettingsDocument, StampedValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// How equal timestamps are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    /// The remote side wins ties (default, used against the remote
    /// authority). Adopted values are marked confirmed.
    #[default]
    RemoteWins,
    /// A confirmed value wins, then the greater canonical JSON encoding.
    /// Order independent, so merges between siblings form a join.
    GreaterValue,
}

/// Which side of a merge a field was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

/// Both sides held different values for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: FieldName,
    pub local: StampedValue,
    pub remote: StampedValue,
    pub resolution: Resolution,
}

/// Outcome of merging a remote snapshot into a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Fields whose value or timestamp was taken from the remote side
    pub adopted: Vec<FieldName>,
    /// Fields where both sides disagreed, with the resolution
    pub conflicts: Vec<FieldConflict>,
    /// Remote fields refused by validation
    pub rejected: Vec<FieldName>,
}

impl MergeReport {
    /// Whether the merge modified the document.
    pub fn changed(&self) -> bool {
        !self.adopted.is_empty()
    }

    /// Whether a field was taken from the remote side.
    pub fn adopted(&self, field: &str) -> bool {
        self.adopted.iter().any(|f| f == field)
    }
}

/// Decide which side wins a single field.
pub fn resolve(
    local: Option<&StampedValue>,
    remote: Option<&StampedValue>,
    tie_break: TieBreak,
) -> Resolution {
    match (local, remote) {
        (_, None) => Resolution::LocalWins,
        (None, Some(_)) => Resolution::RemoteWins,
        (Some(local), Some(remote)) => match local.timestamp.cmp(&remote.timestamp) {
            Ordering::Greater => Resolution::LocalWins,
            Ordering::Less => Resolution::RemoteWins,
            Ordering::Equal => match tie_break {
                TieBreak::RemoteWins => Resolution::RemoteWins,
                TieBreak::GreaterValue => {
                    let remote_rank = (remote.confirmed, canonical(&remote.value));
                    if remote_rank > (local.confirmed, canonical(&local.value)) {
                        Resolution::RemoteWins
                    } else {
                        Resolution::LocalWins
                    }
                }
            },
        },
    }
}

// serde_json's default map is ordered, so this encoding is canonical.
fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// The value as it would be stored after winning under `tie_break`.
fn incoming_value(incoming: &StampedValue, tie_break: TieBreak) -> StampedValue {
    match tie_break {
        TieBreak::RemoteWins => incoming.clone().into_confirmed(),
        TieBreak::GreaterValue => incoming.clone(),
    }
}

/// Merge `remote` into `document`, skipping fields `accept` refuses.
pub fn merge_into<F>(
    document: &mut SettingsDocument,
    remote: &FieldSnapshot,
    tie_break: TieBreak,
    accept: F,
) -> MergeReport
where
    F: Fn(&str, &Value) -> bool,
{
    let mut report = MergeReport::default();

    for (field, incoming) in remote {
        if !accept(field, &incoming.value) {
            report.rejected.push(field.clone());
            continue;
        }

        let incoming = &incoming_value(incoming, tie_break);
        let current = document.stamped(field);
        let resolution = resolve(current.as_ref(), Some(incoming), tie_break);

        if let Some(current) = &current {
            if current.value != incoming.value {
                report.conflicts.push(FieldConflict {
                    field: field.clone(),
                    local: current.clone(),
                    remote: incoming.clone(),
                    resolution,
                });
            }
        }

        if resolution == Resolution::RemoteWins && current.as_ref() != Some(incoming) {
            document.set_stamped(field.clone(), incoming.clone());
            report.adopted.push(field.clone());
        }
    }

    report
}

/// Merge two stamped snapshots without a document or validation.
pub fn merge_snapshots(
    local: &FieldSnapshot,
    remote: &FieldSnapshot,
    tie_break: TieBreak,
) -> FieldSnapshot {
    let mut merged = local.clone();
    for (field, incoming) in remote {
        let incoming = incoming_value(incoming, tie_break);
        if resolve(local.get(field), Some(&incoming), tie_break) == Resolution::RemoteWins {
            merged.insert(field.clone(), incoming);
        }
    }
    merged
}
