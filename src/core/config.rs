use crate::core::models::{DataPath, SyncParams, validate_since_date};
use crate::core::tracker::TrackerSettings;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";
pub const TOKEN_ENV: &str = "SENTIMENTA_TOKEN";
pub const API_URL_ENV: &str = "SENTIMENTA_API_URL";
/// Upper bound for the clock-skew allowance (one day)
pub const MAX_CLOCK_SKEW_SECS: u64 = 86_400;

/// Settings persisted in `config.toml` under the data directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub sync: SyncParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            token: String::new(),
        }
    }
}

impl ApiConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Timings of the progress tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_live_connect_timeout")]
    pub live_connect_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_unmatched_polls")]
    pub max_unmatched_polls: u32,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            live_connect_timeout_secs: default_live_connect_timeout(),
            poll_interval_secs: default_poll_interval(),
            max_unmatched_polls: default_max_unmatched_polls(),
            clock_skew_secs: default_clock_skew(),
        }
    }
}

impl TrackingConfig {
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            live_connect_timeout: Duration::from_secs(self.live_connect_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_unmatched_polls: self.max_unmatched_polls.max(1),
            clock_skew: Duration::from_secs(self.clock_skew_secs.min(MAX_CLOCK_SKEW_SECS)),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}
fn default_live_connect_timeout() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    3
}
fn default_max_unmatched_polls() -> u32 {
    20
}
fn default_clock_skew() -> u64 {
    60
}

/// Keys accepted by `config get` / `config set`
pub const CONFIG_KEYS: &[&str] = &[
    "api_url",
    "token",
    "max_posts",
    "max_comments_per_post",
    "since_date",
    "live_connect_timeout_secs",
    "poll_interval_secs",
    "max_unmatched_polls",
    "clock_skew_secs",
];

/// Service for loading and updating the configuration file
pub struct ConfigService;

impl ConfigService {
    /// Load configuration, falling back to defaults when no file exists
    pub fn load_config(data_path: &DataPath) -> io::Result<AppConfig> {
        let config_path = data_path.config_path();
        if !config_path.exists() {
            log::debug!(
                "No config at {}, using defaults",
                config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid config format in {}: {e}", config_path.display()),
            )
        })
    }

    /// Load configuration and apply environment overrides
    pub fn load_effective(data_path: &DataPath) -> io::Result<AppConfig> {
        let mut config = Self::load_config(data_path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            config.api.token = token;
        }
        if let Some(url) = lookup(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            config.api.base_url = url;
        }
    }

    pub fn save_config(config: &AppConfig, data_path: &DataPath) -> io::Result<()> {
        let config_path = data_path.config_path();
        let toml_content = toml::to_string_pretty(config).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize config: {e}"),
            )
        })?;

        std::fs::create_dir_all(&data_path.root)?;
        std::fs::write(&config_path, toml_content)?;
        log::info!("Saved configuration to {}", config_path.display());
        Ok(())
    }

    pub fn get_value(config: &AppConfig, key: &str) -> io::Result<String> {
        let value = match key {
            "api_url" => config.api.base_url.clone(),
            "token" => mask_token(&config.api.token),
            "max_posts" => config.sync.max_posts.to_string(),
            "max_comments_per_post" => config.sync.max_comments_per_post.to_string(),
            "since_date" => config.sync.since_date.clone(),
            "live_connect_timeout_secs" => config.tracking.live_connect_timeout_secs.to_string(),
            "poll_interval_secs" => config.tracking.poll_interval_secs.to_string(),
            "max_unmatched_polls" => config.tracking.max_unmatched_polls.to_string(),
            "clock_skew_secs" => config.tracking.clock_skew_secs.to_string(),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    pub fn set_value(config: &mut AppConfig, key: &str, value: &str) -> io::Result<()> {
        let value = value.trim();
        match key {
            "api_url" => {
                url::Url::parse(value).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid API URL '{value}': {e}"),
                    )
                })?;
                config.api.base_url = value.trim_end_matches('/').to_string();
            }
            "token" => config.api.token = value.to_string(),
            "max_posts" => config.sync.max_posts = parse_number(key, value)?,
            "max_comments_per_post" => config.sync.max_comments_per_post = parse_number(key, value)?,
            "since_date" => {
                validate_since_date(value)?;
                config.sync.since_date = value.to_string();
            }
            "live_connect_timeout_secs" => {
                config.tracking.live_connect_timeout_secs = parse_number(key, value)?
            }
            "poll_interval_secs" => config.tracking.poll_interval_secs = parse_number(key, value)?,
            "max_unmatched_polls" => config.tracking.max_unmatched_polls = parse_number(key, value)?,
            "clock_skew_secs" => {
                let secs: u64 = parse_number(key, value)?;
                config.tracking.clock_skew_secs = secs.min(MAX_CLOCK_SKEW_SECS);
            }
            _ => return Err(unknown_key(key)),
        }

        config.sync = config.sync.normalized();
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> io::Result<T> {
    value.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Value for {key} must be a non-negative number, got '{value}'"),
        )
    })
}

fn unknown_key(key: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Unknown key: {key} (known keys: {})", CONFIG_KEYS.join(", ")),
    )
}

fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "(not set)".to_string();
    }
    let visible: String = token.chars().take(4).collect();
    format!("{visible}****")
}
