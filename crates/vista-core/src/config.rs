//! Configuration system for Vista.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VISTA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vista/config.toml
//!   3. ~/.config/vista/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VistaConfig {
    pub network: NetworkConfig,
    pub workers: WorkersConfig,
    pub channels: ChannelsConfig,
    pub liveness: LivenessConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the channel listener binds to.
    pub listen_addr: String,
    /// TCP port for channel connections. 0 = OS-assigned.
    pub port: u16,
    /// Optional unix socket path accepting the same protocol.
    pub unix_socket: Option<PathBuf>,
    /// Loopback port for the operator HTTP API. 0 = disabled.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Worker threads, one per display adapter. Must be at least 1.
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Messages the peer may receive before it must acknowledge.
    pub ack_window: u32,
    /// Largest inbound message body accepted, in bytes.
    pub max_message_size: u32,
    /// Connectivity watchdog period in milliseconds. 0 = disabled.
    pub connectivity_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Probe interval while latency monitoring is requested.
    pub ping_timeout_ms: u64,
    /// Probe interval otherwise.
    pub ping_long_timeout_ms: u64,
    /// Retry interval while the socket still holds unsent bytes.
    pub idle_net_timeout_ms: u64,
    pub monitor_latency: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cursor cache capacity, counted in entries.
    pub cursor_cache_size: i64,
    /// Palette cache capacity, counted in entries.
    pub palette_cache_size: i64,
    /// Pixmap cache size used when the peer does not announce one, in bytes.
    pub pixmap_cache_size: i64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 5900,
            unix_socket: None,
            api_port: 5980,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            ack_window: 20,
            max_message_size: 16 * 1024 * 1024,
            connectivity_timeout_ms: 30_000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 15_000,
            ping_long_timeout_ms: 5 * 60 * 1000,
            idle_net_timeout_ms: 100,
            monitor_latency: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cursor_cache_size: 256,
            palette_cache_size: 128,
            pixmap_cache_size: 32 * 1024 * 1024,
        }
    }
}

impl ChannelsConfig {
    pub fn connectivity_timeout(&self) -> Option<Duration> {
        match self.connectivity_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl LivenessConfig {
    /// Interval between latency probes.
    pub fn ping_interval(&self) -> Duration {
        if self.monitor_latency {
            Duration::from_millis(self.ping_timeout_ms)
        } else {
            Duration::from_millis(self.ping_long_timeout_ms)
        }
    }

    pub fn idle_net_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_net_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vista")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VistaConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            VistaConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VISTA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VistaConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count", "must be at least 1".into()));
        }
        if self.channels.ack_window == 0 {
            return Err(ConfigError::Invalid("channels.ack_window", "must be at least 1".into()));
        }
        if self.cache.cursor_cache_size <= 0 || self.cache.palette_cache_size <= 0 {
            return Err(ConfigError::Invalid("cache", "capacities must be positive".into()));
        }
        Ok(())
    }

    /// Apply VISTA_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VISTA_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("VISTA_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("VISTA_NETWORK__UNIX_SOCKET") {
            self.network.unix_socket = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VISTA_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("VISTA_WORKERS__COUNT") {
            if let Ok(n) = v.parse() {
                self.workers.count = n;
            }
        }
        if let Ok(v) = std::env::var("VISTA_CHANNELS__ACK_WINDOW") {
            if let Ok(n) = v.parse() {
                self.channels.ack_window = n;
            }
        }
        if let Ok(v) = std::env::var("VISTA_LIVENESS__MONITOR_LATENCY") {
            self.liveness.monitor_latency = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VistaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels.ack_window, 20);
        assert_eq!(config.cache.cursor_cache_size, 256);
        assert_eq!(config.liveness.ping_interval(), Duration::from_secs(300));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = VistaConfig::from_toml(
            "[liveness]\nmonitor_latency = true\n\n[workers]\ncount = 4\n",
        )
        .unwrap();
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.liveness.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.network.port, 5900);
    }

    #[test]
    fn zero_connectivity_timeout_disables_watchdog() {
        let mut config = VistaConfig::default();
        config.channels.connectivity_timeout_ms = 0;
        assert_eq!(config.channels.connectivity_timeout(), None);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = VistaConfig::default();
        config.workers.count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("workers.count", _))));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("vista-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("VISTA_CONFIG", config_path.to_str().unwrap());
        }

        let path = VistaConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = VistaConfig::load().expect("load should succeed");
        assert_eq!(config.channels.ack_window, 20);

        unsafe {
            std::env::remove_var("VISTA_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
