//! Derived observable state — the only surface presentation code sees.
//!
//! `ViewState` is continuously derived and published through a `watch`
//! channel (subscribers always get the latest value on subscribe).
//! `Notice` is a one-shot broadcast reserved for user-actionable failures.

use telecast_proto::schedule::{ChannelInfo, ItemKind, ItemMeta};

use crate::connection::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// Schedule and player agree; content is flowing.
    Ok,
    /// Known grade exhausted; holding the last frame until an update lands.
    Stale,
    /// A channel switch awaits its confirming snapshot.
    Switching,
    /// Stale for longer than the signal timeout, or nothing received yet.
    NoSignal,
}

/// What the schedule says is on screen right now.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub name: String,
    pub kind: ItemKind,
    pub offset_secs: f64,
    pub duration_secs: f64,
    pub meta: Option<ItemMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub connection: ConnectionState,
    pub signal: SignalState,
    pub channel: Option<String>,
    pub channel_mode: Option<String>,
    pub now_playing: Option<NowPlaying>,
    pub available_channels: Vec<ChannelInfo>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            signal: SignalState::NoSignal,
            channel: None,
            channel_mode: None,
            now_playing: None,
            available_channels: Vec::new(),
        }
    }
}

/// One-shot, user-actionable failure notification.  Transport and player
/// errors never show up here; they are retried internally.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    AuthRejected { reason: String },
    SwitchFailed { channel: String },
}
