//! Configuration loading, validation, and management for Membase.
//!
//! Loads configuration from `~/.membase/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Nothing below the binary reads this crate: the store, scheduler and sync
//! queue take their knobs as constructor parameters.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.membase/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Account whose memories this process manages
    #[serde(default = "default_account")]
    pub account: String,

    /// Remote hub mirroring
    #[serde(default)]
    pub hub: HubConfig,

    /// Background consolidation
    #[serde(default)]
    pub consolidation: ConsolidationConfig,

    /// Local persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// LLM used to write summaries
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

fn default_account() -> String {
    "default".into()
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_url")]
    pub url: String,

    /// Mirror every committed record to the hub
    #[serde(default)]
    pub auto_upload: bool,

    /// Process-wide bucket override (`MEMBASE_ID`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,

    /// Pull every remote conversation when an account is opened
    #[serde(default)]
    pub preload: bool,

    #[serde(default = "default_hub_timeout")]
    pub timeout_secs: u64,
}

fn default_hub_url() -> String {
    "https://testnet.hub.membase.io".into()
}
fn default_hub_timeout() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            auto_upload: false,
            hub_id: None,
            preload: false,
            timeout_secs: default_hub_timeout(),
        }
    }
}

/// When a consolidation batch counts as due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Fire as soon as one full unconsumed batch exists
    #[default]
    CompleteBatch,
    /// `latest_stm / batch_size > last_ltm + 1`, one batch late at boundaries
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default)]
    pub trigger: TriggerRule,
}

fn default_batch_size() -> u64 {
    16
}
fn default_tick_interval() -> u64 {
    60
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            tick_interval_secs: default_tick_interval(),
            trigger: TriggerRule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "in_memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root for per-account databases; defaults to `~/.membase`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: None,
        }
    }
}

impl StorageConfig {
    /// Directory holding one sub-directory per account.
    pub fn data_root(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(AppConfig::config_dir)
    }

    /// Database file of one account: `<data_dir>/<account>/sql.db`.
    pub fn database_path(&self, account: &str) -> PathBuf {
        self.data_root().join(account).join("sql.db")
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// "openai", "openrouter", "ollama" or "none"
    #[serde(default = "default_summarizer_provider")]
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_summarizer_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_summarizer_provider() -> String {
    "openai".into()
}
fn default_summarizer_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_summarizer_provider(),
            api_url: None,
            api_key: None,
            model: default_summarizer_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl std::fmt::Debug for SummarizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerConfig")
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

const KNOWN_BACKENDS: [&str; 2] = ["sqlite", "in_memory"];
const KNOWN_PROVIDERS: [&str; 4] = ["openai", "openrouter", "ollama", "none"];

impl AppConfig {
    /// Load configuration from the default path (~/.membase/config.toml).
    ///
    /// Environment overrides:
    /// - `MEMBASE_ACCOUNT`, `MEMBASE_HUB`, `MEMBASE_ID`, `MEMBASE_MODEL`
    /// - `MEMBASE_API_KEY`, then `OPENAI_API_KEY`, then `OPENROUTER_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (highest priority).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(account) = non_empty("MEMBASE_ACCOUNT") {
            self.account = account;
        }
        if let Some(url) = non_empty("MEMBASE_HUB") {
            self.hub.url = url;
        }
        if let Some(hub_id) = non_empty("MEMBASE_ID") {
            self.hub.hub_id = Some(hub_id);
        }
        if let Some(model) = non_empty("MEMBASE_MODEL") {
            self.summarizer.model = model;
        }
        if self.summarizer.api_key.is_none() {
            self.summarizer.api_key = non_empty("MEMBASE_API_KEY")
                .or_else(|| non_empty("OPENAI_API_KEY"))
                .or_else(|| non_empty("OPENROUTER_API_KEY"));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".membase")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.account.trim().is_empty() {
            return Err(ConfigError::ValidationError("account must not be empty".into()));
        }

        if self.consolidation.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "consolidation.batch_size must be at least 1".into(),
            ));
        }

        if self.consolidation.tick_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "consolidation.tick_interval_secs must be at least 1".into(),
            ));
        }

        if !KNOWN_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "storage.backend must be one of {KNOWN_BACKENDS:?}, got '{}'",
                self.storage.backend
            )));
        }

        if !KNOWN_PROVIDERS.contains(&self.summarizer.provider.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "summarizer.provider must be one of {KNOWN_PROVIDERS:?}, got '{}'",
                self.summarizer.provider
            )));
        }

        if self.summarizer.temperature < 0.0 || self.summarizer.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "summarizer.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            hub: HubConfig::default(),
            consolidation: ConsolidationConfig::default(),
            storage: StorageConfig::default(),
            summarizer: SummarizerConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.account, "default");
        assert_eq!(config.consolidation.batch_size, 16);
        assert_eq!(config.consolidation.tick_interval_secs, 60);
        assert_eq!(config.consolidation.trigger, TriggerRule::CompleteBatch);
        assert!(!config.hub.auto_upload);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.account, config.account);
        assert_eq!(parsed.hub.url, config.hub.url);
        assert_eq!(parsed.consolidation.batch_size, config.consolidation.batch_size);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = AppConfig::default();
        config.consolidation.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.storage.backend = "postgres".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.account, "default");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
account = "alice"

[hub]
auto_upload = true

[consolidation]
batch_size = 8
trigger = "legacy"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.account, "alice");
        assert!(config.hub.auto_upload);
        assert_eq!(config.hub.url, "https://testnet.hub.membase.io");
        assert_eq!(config.consolidation.batch_size, 8);
        assert_eq!(config.consolidation.trigger, TriggerRule::Legacy);
        assert_eq!(config.consolidation.tick_interval_secs, 60);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "account = [").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MEMBASE_ACCOUNT", "bob"),
            ("MEMBASE_HUB", "http://127.0.0.1:8080"),
            ("MEMBASE_ID", "hub-bob"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.account, "bob");
        assert_eq!(config.hub.url, "http://127.0.0.1:8080");
        assert_eq!(config.hub.hub_id.as_deref(), Some("hub-bob"));
        assert_eq!(config.summarizer.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn api_key_is_redacted() {
        let mut config = AppConfig::default();
        config.summarizer.api_key = Some("sk-secret".into());
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn database_path_is_per_account() {
        let storage = StorageConfig {
            backend: "sqlite".into(),
            data_dir: Some(PathBuf::from("/var/lib/membase")),
        };
        assert_eq!(
            storage.database_path("alice"),
            PathBuf::from("/var/lib/membase/alice/sql.db")
        );
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("testnet.hub.membase.io"));
        assert!(toml_str.contains("batch_size = 16"));
    }
}
