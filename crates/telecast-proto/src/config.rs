use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// host:port of the grade server.
    #[serde(default = "default_address")]
    pub address: String,
    /// Bearer token presented in the `Auth` handshake.
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Resolver/reconciler tick interval, independent of player frame rate.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Player drift beyond this triggers a corrective seek.  Chosen to
    /// absorb normal buffering jitter without visible seek artifacts.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance_secs: f64,
    /// Minimum spacing between corrective seeks.
    #[serde(default = "default_min_correction_interval")]
    pub min_correction_interval_secs: f64,
    /// How long a disconnected, stale snapshot keeps driving playback
    /// before the view downgrades to "no signal".
    #[serde(default = "default_stale_signal_timeout")]
    pub stale_signal_timeout_secs: u64,
    /// How long to wait for a confirming snapshot after a switch request.
    #[serde(default = "default_switch_timeout")]
    pub switch_timeout_secs: u64,
    /// Reconnect backoff floor.
    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_secs: u64,
    /// Reconnect backoff cap.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Explicit mpv binary path; `None` resolves from PATH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            auth_token: String::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            drift_tolerance_secs: default_drift_tolerance(),
            min_correction_interval_secs: default_min_correction_interval(),
            stale_signal_timeout_secs: default_stale_signal_timeout(),
            switch_timeout_secs: default_switch_timeout(),
            backoff_floor_secs: default_backoff_floor(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:4950".to_string()
}

fn default_tick_ms() -> u64 {
    250
}

fn default_drift_tolerance() -> f64 {
    1.5
}

fn default_min_correction_interval() -> f64 {
    2.0
}

fn default_stale_signal_timeout() -> u64 {
    60
}

fn default_switch_timeout() -> u64 {
    10
}

fn default_backoff_floor() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    30
}

impl SyncConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn min_correction_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_correction_interval_secs)
    }

    pub fn stale_signal_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_signal_timeout_secs)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_timeout_secs)
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_secs(self.backoff_floor_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            tracing::info!(path = %config_path.display(), "writing default config");
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("config.toml")
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("telecast")
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("telecast")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recommended_tuning() {
        let config = Config::default();
        assert_eq!(config.sync.tick_ms, 250);
        assert_eq!(config.sync.drift_tolerance_secs, 1.5);
        assert_eq!(config.sync.min_correction_interval_secs, 2.0);
        assert_eq!(config.sync.stale_signal_timeout_secs, 60);
        assert_eq!(config.sync.switch_timeout_secs, 10);
        assert!(config.sync.backoff_floor() < config.sync.backoff_cap());
    }

    #[test]
    fn empty_toml_fills_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.address, "127.0.0.1:4950");
        assert_eq!(config.sync.tick().as_millis(), 250);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            "[server]\naddress = \"tv.example.net:9000\"\n[sync]\ntick_ms = 100\n",
        )
        .unwrap();
        assert_eq!(config.server.address, "tv.example.net:9000");
        assert_eq!(config.sync.tick_ms, 100);
        assert_eq!(config.sync.switch_timeout_secs, 10);
    }
}
