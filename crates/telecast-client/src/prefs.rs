//! Persisted viewer preferences — theme and chosen server address.
//!
//! The sync engine never reads these.  The binary resolves them once at
//! startup and writes back on change; a missing or corrupt file silently
//! falls back to defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Default,
    Nostalgia,
    Matrix,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Viewer-chosen server address; overrides the config file when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default)]
    pub theme: Theme,
}

pub struct PrefsStore {
    path: PathBuf,
    prefs: Preferences,
}

impl PrefsStore {
    pub fn load(path: PathBuf) -> Self {
        let prefs = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt preferences; using defaults");
                Preferences::default()
            }),
            Err(_) => Preferences::default(),
        };
        Self { path, prefs }
    }

    pub fn get(&self) -> &Preferences {
        &self.prefs
    }

    pub fn set_theme(&mut self, theme: Theme) -> anyhow::Result<()> {
        if self.prefs.theme != theme {
            self.prefs.theme = theme;
            self.save()?;
        }
        Ok(())
    }

    pub fn set_server_address(&mut self, address: Option<String>) -> anyhow::Result<()> {
        if self.prefs.server_address != address {
            self.prefs.server_address = address;
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string_pretty(&self.prefs)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("telecast-prefs-{}-{}.toml", std::process::id(), name))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = PrefsStore::load(temp_path("missing"));
        assert_eq!(store.get().theme, Theme::Default);
        assert!(store.get().server_address.is_none());
    }

    #[test]
    fn changes_persist_across_reload() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let mut store = PrefsStore::load(path.clone());
        store.set_theme(Theme::Nostalgia).unwrap();
        store
            .set_server_address(Some("tv.example.net:9000".to_string()))
            .unwrap();

        let reloaded = PrefsStore::load(path.clone());
        assert_eq!(reloaded.get().theme, Theme::Nostalgia);
        assert_eq!(
            reloaded.get().server_address.as_deref(),
            Some("tv.example.net:9000")
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "not { valid toml").unwrap();
        let store = PrefsStore::load(path.clone());
        assert_eq!(store.get().theme, Theme::Default);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn theme_serializes_lowercase() {
        let prefs = Preferences {
            server_address: None,
            theme: Theme::Matrix,
        };
        let toml = toml::to_string(&prefs).unwrap();
        assert!(toml.contains("theme = \"matrix\""));
    }
}
