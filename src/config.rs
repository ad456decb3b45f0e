use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::connection::ConnectionConfig;
use crate::ipc::frame::DEFAULT_MAX_FRAME_LENGTH;
use crate::ipc::pool::DEFAULT_POOL_SIZE;
use crate::ipc::server::ServerConfig;
use crate::supervisor::manager::SupervisorConfig;
use crate::supervisor::process::RestartPolicy;

const PROJECT_NAME: &str = "diskjockey";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub connection: ConnectionSettings,
    pub pool: PoolSettings,
    pub server: ServerSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_poll_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 30000,
            reconnect_poll_ms: 200,
            reconnect_timeout_ms: 10000,
            event_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub max_frame_length: usize,
    pub max_clients: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_clients: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub startup_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Directory holding the managed executables; defaults to our own.
    pub install_dir: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub control_socket_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 5000,
            restart_backoff_ms: 1000,
            max_restarts: 5,
            restart_window_ms: 60000,
            shutdown_timeout_ms: 10000,
            install_dir: None,
            config_dir: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(PROJECT_NAME),
            control_socket_dir: dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(PROJECT_NAME),
        }
    }
}

impl SupervisorSettings {
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            backoff: Duration::from_millis(self.restart_backoff_ms),
            max_restarts: self.max_restarts,
            window: Duration::from_millis(self.restart_window_ms),
        }
    }

    /// Control socket path for the named process.
    pub fn control_socket(&self, name: &str) -> PathBuf {
        self.control_socket_dir.join(format!("{}.sock", name))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            connection: ConnectionSettings::default(),
            pool: PoolSettings::default(),
            server: ServerSettings::default(),
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl From<&Config> for ConnectionConfig {
    fn from(config: &Config) -> Self {
        let c = &config.connection;
        ConnectionConfig {
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            reconnect_poll_interval: Duration::from_millis(c.reconnect_poll_ms),
            reconnect_timeout: Duration::from_millis(c.reconnect_timeout_ms),
            event_capacity: c.event_capacity,
            max_frame_length: config.server.max_frame_length,
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        ServerConfig::default()
            .with_max_frame_length(config.server.max_frame_length)
            .with_max_clients(config.server.max_clients)
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        let s = &config.supervisor;
        let defaults = SupervisorConfig::default();
        SupervisorConfig {
            install_dir: s.install_dir.clone().unwrap_or(defaults.install_dir),
            startup_timeout: Duration::from_millis(s.startup_timeout_ms),
            shutdown_timeout: Duration::from_millis(s.shutdown_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // An explicit path must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/diskjockey/diskjockey.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(PROJECT_NAME).join(format!("{}.yml", PROJECT_NAME));
            if let Some(config) = Self::try_load(&primary_config) {
                return Ok(config);
            }
        }

        // Try fallback location: ./diskjockey.yml
        let fallback_config = PathBuf::from(format!("{}.yml", PROJECT_NAME));
        if let Some(config) = Self::try_load(&fallback_config) {
            return Ok(config);
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn try_load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::load_from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to load config from {}: {}", path.display(), e);
                None
            }
        }
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.max_idle
    }
}
