//! Configuration loading for the Campus client.
//!
//! Connection and auth fields are required. Policy sections fall back to the
//! documented defaults when omitted.

use campus_core::RetryPolicy;
use campus_storage::QueryCacheConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "CAMPUS_CLIENT_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub realtime_endpoint: String,
    pub request_timeout_ms: u64,
    pub auth: AuthConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub local_cache: LocalCacheConfig,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Project key sent as `apikey`.
    pub api_key: Option<String>,
    /// Session token sent as `Authorization: Bearer`.
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySettings {
    pub stale_time_ms: u64,
    pub gc_time_ms: u64,
    pub gc_interval_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            stale_time_ms: 5 * 60 * 1_000,
            gc_time_ms: 30 * 60 * 1_000,
            gc_interval_ms: 60 * 1_000,
        }
    }
}

impl QuerySettings {
    pub fn to_cache_config(&self) -> QueryCacheConfig {
        QueryCacheConfig::new()
            .with_stale_time(Duration::from_millis(self.stale_time_ms))
            .with_gc_time(Duration::from_millis(self.gc_time_ms))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Persistent local cache. Without a path the cache lives in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalCacheConfig {
    pub path: Option<PathBuf>,
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeSettings {
    /// Per-channel dispatch queue; the oldest events are dropped past this.
    pub queue_capacity: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or CAMPUS_CLIENT_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.api_base_url.trim();
        if base.is_empty() {
            return Err(invalid("api_base_url", "must not be empty"));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(invalid("api_base_url", "must be an http(s) URL"));
        }
        let realtime = self.realtime_endpoint.trim();
        if !(realtime.starts_with("ws://") || realtime.starts_with("wss://")) {
            return Err(invalid("realtime_endpoint", "must be a ws(s) URL"));
        }
        if self.auth.api_key.is_none() && self.auth.access_token.is_none() {
            return Err(invalid("auth", "api_key or access_token must be provided"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }

        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be >= 1"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms", "must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must be >= base_delay_ms"));
        }
        if self.retry.jitter_ms > self.retry.base_delay_ms {
            return Err(invalid("retry.jitter_ms", "must be <= base_delay_ms"));
        }

        if self.query.gc_interval_ms == 0 {
            return Err(invalid("query.gc_interval_ms", "must be > 0"));
        }
        if self.query.gc_time_ms < self.query.stale_time_ms {
            return Err(invalid("query.gc_time_ms", "must be >= stale_time_ms"));
        }

        if self.local_cache.max_bytes == Some(0) {
            return Err(invalid("local_cache.max_bytes", "must be > 0"));
        }
        if let Some(path) = &self.local_cache.path {
            if path.as_os_str().is_empty() {
                return Err(invalid("local_cache.path", "must not be empty"));
            }
        }

        if self.realtime.queue_capacity == 0 {
            return Err(invalid("realtime.queue_capacity", "must be > 0"));
        }
        if self.realtime.queue_capacity > usize::MAX / 2 {
            return Err(invalid("realtime.queue_capacity", "too large"));
        }

        if self.reconnect.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid("reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be >= 1.0"));
        }

        if self.logging.filter.trim().is_empty() {
            return Err(invalid("logging.filter", "must not be empty"));
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        api_base_url = "https://api.campus.test"
        realtime_endpoint = "wss://api.campus.test/realtime"
        request_timeout_ms = 10000

        [auth]
        api_key = "anon-key"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert_eq!(config.query.to_cache_config(), QueryCacheConfig::default());
        assert_eq!(config.realtime.queue_capacity, 256);
        assert!(config.local_cache.path.is_none());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let contents = format!("{MINIMAL}\n[query]\nstale_ms = 1\n");
        assert!(matches!(
            ClientConfig::from_toml_str(&contents),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_jitter_above_base_rejected() {
        let contents = format!(
            "{MINIMAL}\n[retry]\nmax_retries = 3\nbase_delay_ms = 100\nmax_delay_ms = 1000\njitter_ms = 500\n"
        );
        match ClientConfig::from_toml_str(&contents) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "retry.jitter_ms"),
            other => panic!("expected invalid jitter, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_auth_rejected() {
        let contents = MINIMAL.replace("api_key = \"anon-key\"", "");
        match ClientConfig::from_toml_str(&contents) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "auth"),
            other => panic!("expected invalid auth, got {other:?}"),
        }
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = ClientConfig::from_path(&path).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));

        assert!(matches!(
            ClientConfig::from_path(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
