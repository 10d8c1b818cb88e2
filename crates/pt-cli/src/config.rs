//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use pt_core::TrackerConfig;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Base URL of the media server, e.g. `http://localhost:8096`.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Media server API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Seconds between session polls.
    pub poll_interval_secs: u64,

    /// Seconds between hourly-listening flushes.
    pub flush_interval_secs: u64,

    /// Tracker thresholds. Nested env vars use `__`, e.g.
    /// `PT_TRACKER__PAUSE_AFTER_TICKS=8`.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("pt.db"),
            server_url: None,
            api_key: None,
            poll_interval_secs: 15,
            flush_interval_secs: 3600,
            tracker: TrackerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (PT_*)
        figment = figment.merge(Env::prefixed("PT_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for pt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("pt"))
}

/// Returns the platform-specific data directory for pt.
///
/// On Linux: `~/.local/share/pt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("pt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use figment::Jail;

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("pt.db"));
        assert_eq!(config.poll_interval_secs, 15);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = Config {
            api_key: Some("secret-key".to_string()),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "pt.toml",
                r#"
                server_url = "http://media.local:8096"
                poll_interval_secs = 30

                [tracker]
                pause_after_ticks = 10
                "#,
            )?;
            jail.set_env("PT_API_KEY", "from-env");
            jail.set_env("PT_TRACKER__ABANDON_AFTER_TICKS", "120");

            let config = Config::load_from(Some(Path::new("pt.toml")))?;
            assert_eq!(config.server_url.as_deref(), Some("http://media.local:8096"));
            assert_eq!(config.api_key.as_deref(), Some("from-env"));
            assert_eq!(config.poll_interval_secs, 30);
            assert_eq!(config.flush_interval_secs, 3600);
            assert_eq!(config.tracker.pause_after_ticks, 10);
            assert_eq!(config.tracker.abandon_after_ticks, 120);
            assert_eq!(config.tracker.waiting_after_ticks, 60);
            Ok(())
        });
    }
}
