//! Snapshot container for the last received grade.
//!
//! The store is a dumb box with timestamped provenance: it replaces the
//! snapshot wholesale and never does time math itself.  The engine task
//! owns it exclusively, so replacement is a single assignment and readers
//! can never observe a half-applied update.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use telecast_proto::schedule::GradeUpdate;

/// A received `GradeUpdate` anchored to its client receipt instant.
///
/// The server's `item_start_time` stamp is consulted exactly once, here,
/// against the client wall clock; every later elapsed-time computation runs
/// on the monotonic clock so server/client clock skew cannot accumulate
/// into drift.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub update: GradeUpdate,
    pub received_at: Instant,
    /// How far into the current item the schedule already was at receipt.
    pub base_elapsed: Duration,
}

impl Snapshot {
    pub fn anchor(update: GradeUpdate, received_at: Instant, wall_now: DateTime<Utc>) -> Self {
        let base_elapsed = wall_now
            .signed_duration_since(update.item_start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            update,
            received_at,
            base_elapsed,
        }
    }

    /// Seconds elapsed since the current item's nominal start, as of `now`.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.base_elapsed + now.saturating_duration_since(self.received_at)
    }
}

#[derive(Debug, Default)]
pub struct ScheduleStore {
    snapshot: Option<Snapshot>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot wholesale.  The previous one is discarded; no
    /// partial merges ever happen.
    pub fn apply(&mut self, snapshot: Snapshot) -> &Snapshot {
        self.snapshot = Some(snapshot);
        self.snapshot.as_ref().unwrap()
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn clear(&mut self) {
        self.snapshot = None;
    }
}
