//! Monotonic field stamping.
//!
//! Wall clocks jump backwards and differ between devices. Field timestamps
//! must not: a local edit made after a value was observed has to carry a
//! greater timestamp than that value, or last-write-wins would discard it.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Issues strictly increasing timestamps derived from wall-clock time.
///
/// Rules:
/// 1. A stamp is the wall-clock time, unless that is not greater than the
///    previous stamp, in which case it is `previous + 1`
/// 2. Every timestamp observed from elsewhere (merges) raises the floor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamper {
    /// Highest timestamp issued or observed so far
    last: Timestamp,
}

impl Stamper {
    /// Create a stamper with no history.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Create a stamper that has already seen `last`.
    pub fn starting_at(last: Timestamp) -> Self {
        Self { last }
    }

    /// Issue the next timestamp for a local write at wall-clock time `now`.
    pub fn stamp(&mut self, now: Timestamp) -> Timestamp {
        let next = now.max(self.last.saturating_add(1));
        self.last = next;
        next
    }

    /// Record a timestamp seen from another replica.
    pub fn observe(&mut self, timestamp: Timestamp) {
        self.last = self.last.max(timestamp);
    }

    /// Highest timestamp issued or observed.
    pub fn last(&self) -> Timestamp {
        self.last
    }
}
