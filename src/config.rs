//! Configuration management for Sendgate.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SendgateError};

/// Main configuration for the Sendgate daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to listen on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// TCP port for the policy protocol
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
        }
    }
}

fn default_listen_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27091
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitingConfig {
    /// Messages allowed per window for senders without a domain override
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Text appended to `defer_if_permit` responses
    #[serde(default)]
    pub defer_message: Option<String>,

    /// Sender and domain whitelist file
    #[serde(default = "default_whitelist_path")]
    pub whitelist_path: PathBuf,

    /// Per-domain limit overrides file
    #[serde(default = "default_domain_list_path")]
    pub domain_list_path: PathBuf,

    /// Token snapshot written on shutdown and read on startup
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            window_secs: default_window_secs(),
            defer_message: None,
            whitelist_path: default_whitelist_path(),
            domain_list_path: default_domain_list_path(),
            snapshot_path: None,
        }
    }
}

impl RateLimitingConfig {
    /// The configured window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_limit() -> u64 {
    110
}

fn default_window_secs() -> u64 {
    3660
}

fn default_whitelist_path() -> PathBuf {
    PathBuf::from("sendgate.wl")
}

fn default_domain_list_path() -> PathBuf {
    PathBuf::from("sendgate.domains")
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SendgateConfig {
    /// Load configuration from files and the environment.
    ///
    /// An explicit `path` must exist. Without one, `/etc/sendgate/sendgate.*`
    /// and `./sendgate.*` are read if present. `SENDGATE_`-prefixed variables
    /// override both, with `__` separating section and key
    /// (`SENDGATE_RATE_LIMITING__DEFAULT_LIMIT=50`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder
                .add_source(File::with_name("/etc/sendgate/sendgate").required(false))
                .add_source(File::with_name("sendgate").required(false)),
        };

        let config: SendgateConfig = builder
            .add_source(
                Environment::with_prefix("SENDGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: SendgateConfig = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would silently disable rate limiting.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_secs == 0 {
            return Err(SendgateError::Config(
                "rate_limiting.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.server.listen_address.trim().is_empty() {
            return Err(SendgateError::Config(
                "server.listen_address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SendgateConfig::default();
        assert_eq!(config.server.listen_address, "localhost");
        assert_eq!(config.server.port, 27091);
        assert_eq!(config.rate_limiting.default_limit, 110);
        assert_eq!(config.rate_limiting.window(), Duration::from_secs(3660));
        assert!(config.rate_limiting.snapshot_path.is_none());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
listen_address = "127.0.0.1"
port = 10031

[rate_limiting]
default_limit = 250
window_secs = 600
defer_message = "slow down"
whitelist_path = "/etc/sendgate/whitelist"
domain_list_path = "/etc/sendgate/domains"
snapshot_path = "/var/lib/sendgate/tokens"

[logging]
level = "debug"
format = "json"
"#;
        let config = SendgateConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.port, 10031);
        assert_eq!(config.rate_limiting.default_limit, 250);
        assert_eq!(config.rate_limiting.window_secs, 600);
        assert_eq!(config.rate_limiting.defer_message.as_deref(), Some("slow down"));
        assert_eq!(
            config.rate_limiting.snapshot_path,
            Some(PathBuf::from("/var/lib/sendgate/tokens"))
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = SendgateConfig::from_toml("[server]\nport = 9999\n").unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.listen_address, "localhost");
        assert_eq!(config.rate_limiting.window_secs, 3660);
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = SendgateConfig::from_toml("[rate_limiting]\nwindow_secs = 0\n");
        assert!(matches!(result, Err(SendgateError::Config(_))));
    }

    #[test]
    fn test_unparsable_window_rejected() {
        let result = SendgateConfig::from_toml("[rate_limiting]\nwindow_secs = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let path = std::env::temp_dir().join("sendgate-does-not-exist.toml");
        assert!(SendgateConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = std::env::temp_dir().join(format!("sendgate-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[rate_limiting]\ndefault_limit = 10\nwindow_secs = 600\n",
        )
        .unwrap();

        std::env::set_var("SENDGATE_RATE_LIMITING__DEFAULT_LIMIT", "50");
        let result = SendgateConfig::load(Some(&path));
        std::env::remove_var("SENDGATE_RATE_LIMITING__DEFAULT_LIMIT");
        let _ = std::fs::remove_file(&path);

        let config = result.unwrap();
        assert_eq!(config.rate_limiting.default_limit, 50);
        assert_eq!(config.rate_limiting.window_secs, 600);
    }
}
