//! Configuration file parser for ~/.config/reelfeed/config.toml.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are accepted by serde and logged as potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `api_token`.
pub const API_TOKEN_ENV: &str = "REELFEED_API_TOKEN";

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

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `Debug` masks `api_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listing API base URL. HTTPS unless the host is localhost.
    pub api_base_url: String,

    /// Bearer token. `REELFEED_API_TOKEN` takes precedence.
    pub api_token: Option<String>,

    pub page_size: usize,

    /// Number of player slots (decoders) that may exist at once.
    pub slot_count: usize,

    /// Minimum visible-area fraction for an item to count as viewable.
    pub viewability_threshold: f32,

    pub visibility_stabilization_ms: u64,

    /// Dwell on the active item before a view is reported.
    pub view_dwell_ms: u64,

    pub interaction_debounce_ms: u64,

    pub muted_by_default: bool,

    /// Fetch the next page when the active index is this close to the end.
    pub prefetch_distance: usize,

    pub request_timeout_secs: u64,

    pub tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.reelfeed.app/v1".to_string(),
            api_token: None,
            page_size: 20,
            slot_count: 3,
            viewability_threshold: 0.5,
            visibility_stabilization_ms: 100,
            view_dwell_ms: 3000,
            interaction_debounce_ms: 500,
            muted_by_default: false,
            prefetch_distance: 3,
            request_timeout_secs: 15,
            tick_interval_ms: 50,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("page_size", &self.page_size)
            .field("slot_count", &self.slot_count)
            .field("viewability_threshold", &self.viewability_threshold)
            .field("visibility_stabilization_ms", &self.visibility_stabilization_ms)
            .field("view_dwell_ms", &self.view_dwell_ms)
            .field("interaction_debounce_ms", &self.interaction_debounce_ms)
            .field("muted_by_default", &self.muted_by_default)
            .field("prefetch_distance", &self.prefetch_distance)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .finish()
    }
}

/// Runtime knobs for the feed controller, with durations resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    pub page_size: usize,
    pub slot_count: usize,
    pub viewability_threshold: f32,
    pub visibility_stabilization: Duration,
    pub view_dwell: Duration,
    pub interaction_debounce: Duration,
    pub muted_by_default: bool,
    pub prefetch_distance: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Config::default().feed_settings()
    }
}

const KNOWN_KEYS: [&str; 12] = [
    "api_base_url",
    "api_token",
    "page_size",
    "slot_count",
    "viewability_threshold",
    "visibility_stabilization_ms",
    "view_dwell_ms",
    "interaction_debounce_ms",
    "muted_by_default",
    "prefetch_distance",
    "request_timeout_secs",
    "tick_interval_ms",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Largest supported player pool.
    pub const MAX_SLOTS: usize = 8;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
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

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            api_base_url = %config.api_base_url,
            slot_count = config.slot_count,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate TOML text. Blank input yields defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=Self::MAX_SLOTS).contains(&self.slot_count) {
            return Err(ConfigError::Invalid {
                key: "slot_count",
                reason: format!("must be between 1 and {}, got {}", Self::MAX_SLOTS, self.slot_count),
            });
        }
        if !(self.viewability_threshold > 0.0 && self.viewability_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "viewability_threshold",
                reason: format!("must be in (0, 1], got {}", self.viewability_threshold),
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.interaction_debounce_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "interaction_debounce_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "tick_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// The bearer token, preferring the environment over the file.
    pub fn api_token(&self) -> Option<SecretString> {
        resolve_token(std::env::var(API_TOKEN_ENV).ok(), self.api_token.as_deref())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            page_size: self.page_size,
            slot_count: self.slot_count,
            viewability_threshold: self.viewability_threshold,
            visibility_stabilization: Duration::from_millis(self.visibility_stabilization_ms),
            view_dwell: Duration::from_millis(self.view_dwell_ms),
            interaction_debounce: Duration::from_millis(self.interaction_debounce_ms),
            muted_by_default: self.muted_by_default,
            prefetch_distance: self.prefetch_distance,
        }
    }
}

fn resolve_token(env: Option<String>, file: Option<&str>) -> Option<SecretString> {
    env.filter(|t| !t.trim().is_empty())
        .or_else(|| file.filter(|t| !t.trim().is_empty()).map(str::to_string))
        .map(SecretString::from)
}

// ============================================================================
// Tests
// ============================================================================
