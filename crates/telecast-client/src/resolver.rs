//! Position resolver — pure schedule-to-position math.
//!
//! Called on the fixed tick and immediately on every new snapshot.  No side
//! effects; the reconciler decides what, if anything, to do with the result.

use std::time::Instant;

use crate::store::Snapshot;

/// Where the schedule says playback should be right now.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPosition {
    /// No snapshot — nothing to play.
    Idle,
    /// `grade[index]` is active, `offset_secs` into its schedule window.
    /// The offset is always in `[0, duration)`.
    Active { index: usize, offset_secs: f64 },
    /// Elapsed time has passed the end of the known grade and no update has
    /// arrived to extend it.  Playback holds just under the final item's
    /// boundary; `index` is that item.
    Stale { index: usize, duration_secs: f64 },
}

/// Resolve the active item and offset for `now`.
///
/// Walks the grade forward from the snapshot's current index, consuming
/// whole durations, until the remaining elapsed time falls inside an item's
/// `[0, duration)` window.  The interval is half-open: an item whose
/// duration exactly equals the remaining elapsed time is finished, not
/// active.  Walking forward (rather than trusting the index) covers sparse
/// ticks and momentarily stale snapshots several items behind.
pub fn resolve(snapshot: Option<&Snapshot>, now: Instant) -> ResolvedPosition {
    let Some(snap) = snapshot else {
        return ResolvedPosition::Idle;
    };

    let grade = &snap.update.grade;
    if grade.is_empty() {
        return ResolvedPosition::Idle;
    }

    let mut elapsed = snap.elapsed_at(now).as_secs_f64();
    let mut index = snap.update.current_item_index;
    while index < grade.len() {
        let duration = grade[index].duration_secs;
        if elapsed < duration {
            return ResolvedPosition::Active {
                index,
                offset_secs: elapsed,
            };
        }
        elapsed -= duration;
        index += 1;
    }

    let last = grade.len() - 1;
    ResolvedPosition::Stale {
        index: last,
        duration_secs: grade[last].duration_secs,
    }
}
