//! Configuration file parser for `$XDG_CONFIG_HOME/feedsync/config.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::{ClassifierRule, RetentionPolicy};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration. Any subset of keys may be given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Items kept per channel after a refresh.
    pub max_items_per_channel: usize,

    /// Items older than this many days are evicted on refresh (the newest always stays).
    pub max_item_age_days: i64,

    /// Periodic refresh in `watch` mode, in minutes. 0 = never.
    pub update_interval_minutes: u64,

    /// Refresh everything as soon as `watch` starts.
    pub update_on_startup: bool,

    /// Debounce between a scheduled save and the actual write.
    pub save_delay_ms: u64,

    /// Tags known before any feed is added.
    pub global_tags: Vec<String>,

    /// SQLite file; defaults to `$XDG_DATA_HOME/feedsync/feedsync.db`.
    pub database_path: Option<PathBuf>,

    pub user_agent: String,

    /// Lets the downloader fetch from localhost and private networks.
    pub allow_private_hosts: bool,

    pub classifier_rules: Vec<ClassifierRule>,
}

impl Default for Config {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            max_items_per_channel: retention.max_items_per_channel,
            max_item_age_days: retention.max_item_age_days,
            update_interval_minutes: 60,
            update_on_startup: true,
            save_delay_ms: 500,
            global_tags: vec!["untagged".to_string()],
            database_path: None,
            user_agent: format!("feedsync/{}", env!("CARGO_PKG_VERSION")),
            allow_private_hosts: false,
            classifier_rules: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "max_items_per_channel",
        "max_item_age_days",
        "update_interval_minutes",
        "update_on_startup",
        "save_delay_ms",
        "global_tags",
        "database_path",
        "user_agent",
        "allow_private_hosts",
        "classifier_rules",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            max_items = config.max_items_per_channel,
            max_age_days = config.max_item_age_days,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_items_per_channel: self.max_items_per_channel,
            max_item_age_days: self.max_item_age_days,
        }
    }

    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }

    /// `None` when periodic refresh is off.
    pub fn update_interval(&self) -> Option<Duration> {
        (self.update_interval_minutes > 0)
            .then(|| Duration::from_secs(self.update_interval_minutes.saturating_mul(60)))
    }

    /// Configured database path, else the default under the data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| data_dir().map(|dir| dir.join("feedsync.db")))
    }
}

fn xdg_dir(var: &str, fallback: &[&str]) -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join("feedsync"));
    }
    let home = std::env::var_os("HOME")?;
    let mut dir = PathBuf::from(home);
    dir.extend(fallback);
    Some(dir.join("feedsync"))
}

/// `$XDG_CONFIG_HOME/feedsync`, or `~/.config/feedsync`.
pub fn config_dir() -> Option<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

/// `$XDG_DATA_HOME/feedsync`, or `~/.local/share/feedsync`.
pub fn data_dir() -> Option<PathBuf> {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("feedsync_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_items_per_channel, 100);
        assert_eq!(config.max_item_age_days, 30);
        assert_eq!(config.update_interval_minutes, 60);
        assert!(config.update_on_startup);
        assert_eq!(config.save_delay(), Duration::from_millis(500));
        assert_eq!(config.global_tags, vec!["untagged".to_string()]);
        assert!(config.user_agent.starts_with("feedsync/"));
        assert!(!config.allow_private_hosts);
        assert!(config.classifier_rules.is_empty());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedsync_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n\t\n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("partial", "max_items_per_channel = 20\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_items_per_channel, 20);
        assert_eq!(config.max_item_age_days, 30);
        assert_eq!(
            config.retention(),
            RetentionPolicy {
                max_items_per_channel: 20,
                max_item_age_days: 30,
            }
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
max_items_per_channel = 50
max_item_age_days = 7
update_interval_minutes = 0
update_on_startup = false
save_delay_ms = 100
global_tags = ["news", "tech"]
database_path = "/var/lib/feedsync/feeds.db"
user_agent = "custom/1.0"
allow_private_hosts = true

[[classifier_rules]]
keywords = ["rust", "cargo"]
tags = ["lang"]
"#;
        let (dir, path) = write_config("full", content);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_item_age_days, 7);
        assert_eq!(config.update_interval(), None);
        assert!(!config.update_on_startup);
        assert_eq!(config.save_delay(), Duration::from_millis(100));
        assert_eq!(config.global_tags, vec!["news".to_string(), "tech".to_string()]);
        assert_eq!(
            config.database_path(),
            Some(PathBuf::from("/var/lib/feedsync/feeds.db"))
        );
        assert_eq!(config.user_agent, "custom/1.0");
        assert!(config.allow_private_hosts);
        assert_eq!(
            config.classifier_rules,
            vec![ClassifierRule {
                keywords: vec!["rust".into(), "cargo".into()],
                tags: vec!["lang".into()],
            }]
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_update_interval_in_minutes() {
        let config = Config {
            update_interval_minutes: 15,
            ..Config::default()
        };
        assert_eq!(config.update_interval(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "max_item_age_days = 3\ntotally_fake_key = 1\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_item_age_days, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (dir, path) = write_config("wrongtype", "max_items_per_channel = \"lots\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedsync_config_test_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let content = "# ".to_string() + &"x".repeat(1_048_577);
        std::fs::write(&path, content).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
