//! Configuration management for Corelink.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// OTA configuration.
    #[serde(default)]
    pub ota: OtaSettings,

    /// Event bus configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ota.chunk_size == 0 || self.ota.chunk_size > crate::ota::MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "ota.chunk_size must be 1..={}",
                crate::ota::MAX_CHUNK_SIZE
            )));
        }

        if self.events.response_timeout_secs < 5 {
            return Err(Error::InvalidConfig(
                "events.response_timeout_secs must be at least 5".into(),
            ));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("io", "corelink", "corelink").map_or_else(
            || PathBuf::from("corelink.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Server listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address devices connect to.
    pub listen_addr: SocketAddr,
    /// Server RSA keypair (PKCS#8 PEM). Generated on first run if absent.
    pub server_key_path: PathBuf,
    /// Directory of per-device public keys.
    pub device_keys_dir: PathBuf,
    /// Directory firmware binaries are served from.
    pub binaries_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", crate::DEFAULT_PORT).parse().unwrap(),
            server_key_path: PathBuf::from("data/server_key.pem"),
            device_keys_dir: PathBuf::from("data/device_keys"),
            binaries_dir: PathBuf::from("data/binaries"),
        }
    }
}

/// Per-session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keepalive probe interval in seconds; a session silent for two
    /// intervals is closed.
    pub ping_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 15,
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// OTA delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaSettings {
    /// Chunk size in bytes.
    pub chunk_size: u16,
    /// Offer fast (pipelined) OTA to devices that support it.
    pub fast_ota: bool,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::ota::DEFAULT_CHUNK_SIZE,
            fast_ota: true,
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Timeout for request/response correlation, seconds. Minimum 5.
    pub response_timeout_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 15,
        }
    }
}

impl EventsConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub level: String,
    /// Output format: "text" or "json".
    pub format: String,
    /// Enable ANSI colors.
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            color: true,
        }
    }
}

/// Initialize the logging subsystem.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.server.listen_addr, config.server.listen_addr);
        assert_eq!(back.ota.chunk_size, config.ota.chunk_size);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.ota.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.events.response_timeout_secs = 1;
        assert!(config.validate().is_err());
    }
}
