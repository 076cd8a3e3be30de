//! SyncEngine — single-owner event loop for all mutable sync state.
//!
//! The store, reconciler and switch coordinator live here exclusively; all
//! input arrives as messages (connection events, commands, the fixed tick)
//! and all output leaves as published view state or notices.  No other task
//! ever touches the snapshot or the player.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use telecast_proto::config::SyncConfig;
use telecast_proto::schedule::GradeUpdate;

use crate::connection::{ConnEvent, ConnectionHandle, ConnectionState};
use crate::error::SyncError;
use crate::player::PlayerHandle;
use crate::reconciler::Reconciler;
use crate::resolver::{resolve, ResolvedPosition};
use crate::store::{ScheduleStore, Snapshot};
use crate::switcher::SwitchCoordinator;
use crate::view::{Notice, NowPlaying, SignalState, ViewState};

/// Commands from the embedding application.
#[derive(Debug)]
pub enum EngineCommand {
    SwitchChannel(String),
    /// Supply a fresh credential after an auth rejection.
    SetToken(String),
    /// Release the player without side effects (navigation away).
    Detach,
    Shutdown,
}

pub struct SyncEngine {
    sync: SyncConfig,
    store: ScheduleStore,
    reconciler: Reconciler,
    switcher: SwitchCoordinator,
    conn: ConnectionHandle,
    conn_state: ConnectionState,
    /// Newest connection generation seen; updates from older ones are
    /// discarded (reconnection safety).
    latest_generation: u64,
    /// When the resolver first went stale, for the no-signal downgrade.
    stale_since: Option<Instant>,
    view_tx: watch::Sender<ViewState>,
    notice_tx: broadcast::Sender<Notice>,
}

impl SyncEngine {
    pub fn new(sync: SyncConfig, conn: ConnectionHandle, player: PlayerHandle) -> Self {
        let reconciler = Reconciler::new(player, &sync);
        let switcher = SwitchCoordinator::new(sync.switch_timeout());
        let (view_tx, _) = watch::channel(ViewState::default());
        let (notice_tx, _) = broadcast::channel(16);
        Self {
            sync,
            store: ScheduleStore::new(),
            reconciler,
            switcher,
            conn,
            conn_state: ConnectionState::Disconnected,
            latest_generation: 0,
            stale_since: None,
            view_tx,
            notice_tx,
        }
    }

    /// Latest-value-on-subscribe view of the derived state.
    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.view_tx.subscribe()
    }

    /// One-shot failure notifications (auth rejection, switch timeout).
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    /// Run until shutdown.  Returns after detaching the player and telling
    /// the connection manager to stop.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ConnEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) {
        info!(tick_ms = self.sync.tick_ms, "sync engine starting");
        let mut tick = tokio::time::interval(self.sync.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_conn_event(ev).await,
                    None => {
                        info!("connection event channel closed");
                        break;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                _ = tick.tick() => self.handle_tick(Instant::now()).await,
            }
        }

        self.switcher.cancel();
        self.reconciler.detach();
        self.conn.shutdown().await;
        info!("sync engine stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SwitchChannel(channel) => {
                self.switcher.request(channel.clone(), Instant::now());
                self.reconciler.set_switch_pending(true);
                self.conn.switch_channel(&channel).await;
                self.publish_view(Instant::now());
            }
            EngineCommand::SetToken(token) => self.conn.set_token(token).await,
            EngineCommand::Detach => {
                self.switcher.cancel();
                self.reconciler.set_switch_pending(false);
                self.reconciler.detach();
            }
            EngineCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_conn_event(&mut self, ev: ConnEvent) {
        match ev {
            ConnEvent::State(state) => {
                if state != self.conn_state {
                    info!(?state, "connection state");
                    self.conn_state = state;
                    self.publish_view(Instant::now());
                }
            }
            ConnEvent::AuthRejected { reason } => {
                let _ = self.notice_tx.send(Notice::AuthRejected { reason });
            }
            ConnEvent::Update { generation, update } => {
                if generation < self.latest_generation {
                    debug!(
                        generation,
                        latest = self.latest_generation,
                        "discarding update from a stale connection"
                    );
                    return;
                }
                self.latest_generation = generation;
                self.apply_update(update).await;
            }
        }
    }

    async fn apply_update(&mut self, update: GradeUpdate) {
        if let Err(e) = update.validate() {
            warn!(error = %SyncError::BadPayload(e), "dropping schedule update");
            return;
        }
        if self.switcher.confirm(&update.channel) {
            self.reconciler.set_switch_pending(false);
        }
        // Remember the channel for the next reconnect handshake.
        let channel_changed = self
            .store
            .current()
            .map_or(true, |s| s.update.channel != update.channel);
        if channel_changed {
            self.conn.set_channel(Some(update.channel.clone())).await;
        }
        debug!(
            channel = %update.channel,
            items = update.grade.len(),
            index = update.current_item_index,
            "schedule update"
        );
        let now = Instant::now();
        self.store.apply(Snapshot::anchor(update, now, Utc::now()));
        self.stale_since = None;
        self.reconcile(now).await;
    }

    async fn handle_tick(&mut self, now: Instant) {
        if let Some(channel) = self.switcher.check_timeout(now) {
            warn!("{}", SyncError::SwitchTimeout {
                channel: channel.clone()
            });
            self.reconciler.set_switch_pending(false);
            let _ = self.notice_tx.send(Notice::SwitchFailed { channel });
        }
        self.reconcile(now).await;
    }

    async fn reconcile(&mut self, now: Instant) {
        let resolved = resolve(self.store.current(), now);
        match resolved {
            ResolvedPosition::Stale { .. } => {
                self.stale_since.get_or_insert(now);
            }
            ResolvedPosition::Active { .. } => self.stale_since = None,
            ResolvedPosition::Idle => {}
        }
        self.reconciler
            .tick(self.store.current(), &resolved, now)
            .await;
        self.publish_resolved(&resolved, now);
    }

    fn publish_view(&self, now: Instant) {
        let resolved = resolve(self.store.current(), now);
        self.publish_resolved(&resolved, now);
    }

    fn publish_resolved(&self, resolved: &ResolvedPosition, now: Instant) {
        let snapshot = self.store.current();
        let signal = match resolved {
            ResolvedPosition::Idle => SignalState::NoSignal,
            ResolvedPosition::Active { .. } => SignalState::Ok,
            ResolvedPosition::Stale { .. } => {
                if self.switcher.is_awaiting() {
                    SignalState::Switching
                } else if self.stale_since.map_or(false, |since| {
                    now.saturating_duration_since(since) >= self.sync.stale_signal_timeout()
                }) {
                    SignalState::NoSignal
                } else {
                    SignalState::Stale
                }
            }
        };
        let now_playing = snapshot.and_then(|snap| match resolved {
            ResolvedPosition::Idle => None,
            ResolvedPosition::Active { index, offset_secs } => {
                let item = &snap.update.grade[*index];
                Some(NowPlaying {
                    name: item.name.clone(),
                    kind: item.kind,
                    offset_secs: *offset_secs,
                    duration_secs: item.duration_secs,
                    meta: item.meta.clone(),
                })
            }
            ResolvedPosition::Stale {
                index,
                duration_secs,
            } => {
                let item = &snap.update.grade[*index];
                Some(NowPlaying {
                    name: item.name.clone(),
                    kind: item.kind,
                    offset_secs: *duration_secs,
                    duration_secs: *duration_secs,
                    meta: item.meta.clone(),
                })
            }
        });
        self.view_tx.send_replace(ViewState {
            connection: self.conn_state,
            signal,
            channel: snapshot.map(|s| s.update.channel.clone()),
            channel_mode: snapshot.map(|s| s.update.channel_mode.clone()),
            now_playing,
            available_channels: snapshot
                .map(|s| s.update.available_channels.clone())
                .unwrap_or_default(),
        });
    }
}
