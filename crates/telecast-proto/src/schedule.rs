use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a scheduled item.  The set is closed — the server only ever
/// emits these four kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Regular programming.
    Feature,
    /// Short filler between features.
    Bumper,
    /// Channel intro sequence.
    Intro,
    /// Channel outro sequence.
    Outro,
}

/// Optional descriptive attributes of an item (poster, episode title, …).
/// Purely informational; never affects timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
    /// Override for the display name (e.g. the show's real title when the
    /// grade entry carries a file-derived name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

/// One scheduled unit of the grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// Media source reference — whatever the player can load.
    pub src: String,
    /// Display name.
    pub name: String,
    pub kind: ItemKind,
    /// Scheduled duration in seconds.  Always > 0.
    pub duration_secs: f64,
    /// Offset into the source media at which playback begins, used when an
    /// item is joined mid-way.  In `[0, duration_secs)` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ItemMeta>,
}

impl PlaylistItem {
    /// Where in the source media this item's schedule window begins.
    pub fn media_start(&self) -> f64 {
        self.start_secs.unwrap_or(0.0)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.duration_secs > 0.0) {
            anyhow::bail!("item '{}': duration must be positive", self.name);
        }
        if let Some(start) = self.start_secs {
            if !(0.0..self.duration_secs).contains(&start) {
                anyhow::bail!(
                    "item '{}': start offset {} outside [0, {})",
                    self.name,
                    start,
                    self.duration_secs
                );
            }
        }
        Ok(())
    }
}

/// Catalog entry for the channel-switch UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub episode_count: u32,
}

/// Full-replacement schedule payload.  A new update always replaces the
/// previous snapshot wholesale; there are no partial merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeUpdate {
    /// Code of the channel this grade belongs to.  A pending channel switch
    /// is confirmed by the first update whose code matches the request.
    pub channel: String,
    /// Ordered item sequence.
    pub grade: Vec<PlaylistItem>,
    /// Index of the item current at the moment the update was issued.
    pub current_item_index: usize,
    /// Server-clock stamp of when that item began.  Consulted exactly once,
    /// at receipt, against the client wall clock; all later elapsed-time
    /// math runs on the client's monotonic clock.
    pub item_start_time: DateTime<Utc>,
    /// Free-form playback mode (e.g. "linear", "on-demand").
    pub channel_mode: String,
    #[serde(default)]
    pub available_channels: Vec<ChannelInfo>,
}

impl GradeUpdate {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.grade.is_empty() {
            anyhow::bail!("channel '{}': empty grade", self.channel);
        }
        if self.current_item_index >= self.grade.len() {
            anyhow::bail!(
                "channel '{}': current item index {} out of range (grade has {} items)",
                self.channel,
                self.current_item_index,
                self.grade.len()
            );
        }
        for item in &self.grade {
            item.validate()?;
        }
        Ok(())
    }

    /// Total scheduled seconds from the current item to the end of the grade.
    pub fn remaining_span_secs(&self) -> f64 {
        self.grade[self.current_item_index..]
            .iter()
            .map(|i| i.duration_secs)
            .sum()
    }
}
