//! Playback reconciler — the single writer of the player handle.
//!
//! Compares what the resolver says should be playing against what the
//! player reports, and issues the minimum set of load/seek/play/pause
//! commands to close the gap.  No other component ever controls the player.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use telecast_proto::config::SyncConfig;

use crate::error::SyncError;
use crate::player::PlayerHandle;
use crate::resolver::ResolvedPosition;
use crate::store::Snapshot;

/// How far under an item's boundary a stale freeze parks the player.
const HOLD_BEFORE_BOUNDARY_SECS: f64 = 0.001;

pub struct Reconciler {
    /// `None` after `detach()` — a detached reconciler never issues a
    /// trailing command.
    player: Option<PlayerHandle>,
    drift_tolerance_secs: f64,
    min_correction_interval: Duration,
    /// When the last corrective attempt (successful or not) was issued.
    last_correction: Option<Instant>,
    /// Source currently loaded in the player, as far as we know.
    loaded_src: Option<String>,
    /// True while the player is parked (stale hold or switch transition).
    frozen: bool,
    /// Set while a channel switch awaits confirmation: stale resolutions
    /// pause instead of freeze-seeking, and nothing speculative is shown.
    switch_pending: bool,
}

impl Reconciler {
    pub fn new(player: PlayerHandle, sync: &SyncConfig) -> Self {
        Self {
            player: Some(player),
            drift_tolerance_secs: sync.drift_tolerance_secs,
            min_correction_interval: sync.min_correction_interval(),
            last_correction: None,
            loaded_src: None,
            frozen: false,
            switch_pending: false,
        }
    }

    pub fn set_switch_pending(&mut self, pending: bool) {
        self.switch_pending = pending;
    }

    pub fn detach(&mut self) {
        self.player = None;
    }

    pub fn is_detached(&self) -> bool {
        self.player.is_none()
    }

    fn can_correct(&self, now: Instant) -> bool {
        self.last_correction
            .map_or(true, |at| now.saturating_duration_since(at) >= self.min_correction_interval)
    }

    /// Apply one reconciliation pass for the given resolution.
    ///
    /// Failures are logged and retried on a later tick with the
    /// then-freshest resolution — never with values cached from the failed
    /// attempt — and corrective attempts are spaced by the minimum
    /// inter-correction interval to avoid seek storms.
    pub async fn tick(
        &mut self,
        snapshot: Option<&Snapshot>,
        resolved: &ResolvedPosition,
        now: Instant,
    ) {
        let Some(player) = self.player.clone() else {
            return;
        };
        let Some(snap) = snapshot else {
            return;
        };
        match resolved {
            ResolvedPosition::Idle => {}
            ResolvedPosition::Active { index, offset_secs } => {
                self.reconcile_active(&player, snap, *index, *offset_secs, now)
                    .await;
            }
            ResolvedPosition::Stale {
                index,
                duration_secs,
            } => {
                self.hold_at_boundary(&player, snap, *index, *duration_secs, now)
                    .await;
            }
        }
    }

    async fn reconcile_active(
        &mut self,
        player: &PlayerHandle,
        snap: &Snapshot,
        index: usize,
        offset_secs: f64,
        now: Instant,
    ) {
        let item = &snap.update.grade[index];
        let expected = item.media_start() + offset_secs;

        if self.loaded_src.as_deref() != Some(item.src.as_str()) {
            if !self.can_correct(now) {
                return;
            }
            self.last_correction = Some(now);
            match switch_media(player, &item.src, expected).await {
                Ok(()) => {
                    debug!(src = %item.src, expected, "media switch");
                    self.loaded_src = Some(item.src.clone());
                    self.frozen = false;
                }
                Err(e) => warn!(
                    error = %SyncError::PlayerControl(e),
                    src = %item.src,
                    "media switch failed; retrying with fresh position"
                ),
            }
            return;
        }

        if self.frozen {
            // Leaving a hold: resume before any drift check.
            if let Err(e) = player.play().await {
                warn!(error = %SyncError::PlayerControl(e), "resume failed");
                return;
            }
            self.frozen = false;
        }

        let observed = match player.current_time().await {
            Ok(Some(t)) => t,
            Ok(None) => {
                // The player lost its media (reset, end-of-file).  Forget
                // the loaded source so the next tick reloads it.
                self.loaded_src = None;
                return;
            }
            Err(e) => {
                warn!(error = %SyncError::PlayerControl(e), "could not read player time");
                return;
            }
        };

        let drift = (observed - expected).abs();
        if drift <= self.drift_tolerance_secs {
            return;
        }
        if !self.can_correct(now) {
            return;
        }
        self.last_correction = Some(now);
        debug!(drift, observed, expected, "correcting drift");
        if let Err(e) = player.seek_to(expected).await {
            warn!(
                error = %SyncError::PlayerControl(e),
                "corrective seek failed; retrying with fresh position"
            );
        }
    }

    async fn hold_at_boundary(
        &mut self,
        player: &PlayerHandle,
        snap: &Snapshot,
        index: usize,
        duration_secs: f64,
        now: Instant,
    ) {
        if self.frozen {
            return;
        }

        if self.switch_pending {
            // Transitional state while a switch awaits confirmation: stop
            // advancing, but never freeze-seek into content we are leaving.
            match player.pause().await {
                Ok(()) => self.frozen = true,
                Err(e) => warn!(error = %SyncError::PlayerControl(e), "transition pause failed"),
            }
            return;
        }

        if !self.can_correct(now) {
            return;
        }
        self.last_correction = Some(now);

        let item = &snap.update.grade[index];
        let hold = item.media_start() + duration_secs - HOLD_BEFORE_BOUNDARY_SECS;
        let result = async {
            if self.loaded_src.as_deref() != Some(item.src.as_str()) {
                player.load(&item.src).await?;
            }
            player.seek_to(hold).await?;
            player.pause().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        match result {
            Ok(()) => {
                debug!(src = %item.src, hold, "schedule stale; holding at final frame");
                self.loaded_src = Some(item.src.clone());
                self.frozen = true;
            }
            Err(e) => warn!(error = %SyncError::PlayerControl(e), "stale freeze failed; retrying"),
        }
    }
}

async fn switch_media(player: &PlayerHandle, src: &str, expected: f64) -> anyhow::Result<()> {
    player.load(src).await?;
    if expected > 0.0 {
        player.seek_to(expected).await?;
    }
    player.play().await?;
    Ok(())
}
