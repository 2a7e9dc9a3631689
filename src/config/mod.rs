//! Configuration module for boxterm
//!
//! Supports configuration via:
//! - YAML/TOML/JSON config files (`config/boxterm.*`, `/etc/boxterm/config.*`)
//! - Environment variables (with BOXTERM__ prefix, `__` as the nesting separator)
//!
//! The language table lives in its own JSON file, see [`AppConfig::languages_file`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::container::ContainerSessionConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional file receiving JSON logs in addition to stdout
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// JSON file mapping language names to run/term containers
    #[serde(default = "default_languages_file")]
    pub languages_file: PathBuf,

    /// Pull every configured image before serving
    #[serde(default)]
    pub pull_images: bool,

    /// Session timing and buffering
    #[serde(default)]
    pub session: SessionSettings,
}

/// Per-session limits, in config-file friendly units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Largest chunk of container output per frame, in bytes
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,

    /// Close handshake budget in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Seconds between pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Container removal budget in seconds
    #[serde(default = "default_stop_timeout")]
    pub container_stop_timeout_secs: u64,

    /// Container startup budget in seconds (includes code upload)
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Maximum length of the interactive phase in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_languages_file() -> PathBuf {
    PathBuf::from("langs.json")
}

fn default_output_buffer_size() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    60
}

fn default_start_timeout() -> u64 {
    60
}

fn default_session_timeout() -> u64 {
    30 * 60
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            output_buffer_size: default_output_buffer_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            ping_interval_secs: default_ping_interval(),
            container_stop_timeout_secs: default_stop_timeout(),
            start_timeout_secs: default_start_timeout(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_file: None,
            languages_file: default_languages_file(),
            pull_images: false,
            session: SessionSettings::default(),
        }
    }
}

impl SessionSettings {
    /// Convert to the runtime session configuration
    pub fn to_session_config(&self) -> ContainerSessionConfig {
        ContainerSessionConfig {
            output_buffer_size: self.output_buffer_size,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ping_rate: Duration::from_secs(self.ping_interval_secs),
            container_stop_timeout: Duration::from_secs(self.container_stop_timeout_secs),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/boxterm").required(false))
            .add_source(config::File::with_name("/etc/boxterm/config").required(false))
            .add_source(
                config::Environment::with_prefix("BOXTERM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        let session = &self.session;
        if session.output_buffer_size == 0 {
            anyhow::bail!("Output buffer size cannot be 0");
        }

        let timeouts = [
            ("shutdown_timeout_secs", session.shutdown_timeout_secs),
            ("ping_interval_secs", session.ping_interval_secs),
            ("container_stop_timeout_secs", session.container_stop_timeout_secs),
            ("start_timeout_secs", session.start_timeout_secs),
            ("session_timeout_secs", session.session_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                anyhow::bail!("session.{name} cannot be 0");
            }
        }

        Ok(())
    }

    /// Address string to bind the listener to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.languages_file, PathBuf::from("langs.json"));
        assert!(!config.pull_images);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = AppConfig {
            port: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.ping_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_interval_secs"));
    }

    #[test]
    fn test_session_config_conversion() {
        let session = SessionSettings::default().to_session_config();
        assert_eq!(session.output_buffer_size, 1024);
        assert_eq!(session.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(session.ping_rate, Duration::from_secs(30));
        assert_eq!(session.container_stop_timeout, Duration::from_secs(60));
        assert_eq!(session.start_timeout, Duration::from_secs(60));
        assert_eq!(session.session_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_partial_session_table_uses_defaults() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"ping_interval_secs": 5}"#).unwrap();
        assert_eq!(settings.ping_interval_secs, 5);
        assert_eq!(settings.output_buffer_size, 1024);
    }
}
