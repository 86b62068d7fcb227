#![forbid(unsafe_code)]

// Server configuration: defaults, optional YAML file, environment overrides

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub rooms: RoomLimits,
    pub media: MediaSettings,
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_connections: 10_000,
            idle_timeout_secs: 300,
            max_message_size: 64 * 1024,
        }
    }
}

/// Room admission limits; zero means unlimited
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoomLimits {
    pub max_rooms: usize,
    pub max_participants_per_room: usize,
}

/// Knobs for the real media engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediaSettings {
    /// Worker processes; 0 spawns one per CPU
    pub num_workers: usize,
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<PathBuf>,
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            num_workers: 0,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Daily-rotated log file in addition to stdout
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })
}

impl ServerConfig {
    /// Loads defaults, then the YAML file when given, then process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applies environment-style overrides from `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = parse_env("PORT", v)?;
        }
        if let Some(v) = lookup("MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = lookup("MAX_ROOMS") {
            self.rooms.max_rooms = parse_env("MAX_ROOMS", v)?;
        }
        if let Some(v) = lookup("MAX_PARTICIPANTS_PER_ROOM") {
            self.rooms.max_participants_per_room = parse_env("MAX_PARTICIPANTS_PER_ROOM", v)?;
        }
        if let Some(ip) = lookup("ANNOUNCE_IP").filter(|ip| !ip.is_empty()) {
            self.media.announced_ip = Some(ip);
        }
        if let Some(path) = lookup("LOG_FILE").filter(|p| !p.is_empty()) {
            self.logging.log_file = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be positive".to_string(),
            ));
        }
        if self.server.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.idle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.server.max_message_size < 1024 {
            return Err(ConfigError::Invalid(
                "server.max_message_size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.media.rtc_min_port > self.media.rtc_max_port {
            return Err(ConfigError::Invalid(format!(
                "media.rtc_min_port ({}) exceeds media.rtc_max_port ({})",
                self.media.rtc_min_port, self.media.rtc_max_port
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
