use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seriald configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialdConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address: `host:port` or `unix:/path/to.sock`
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Device health poll interval in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Longest accepted command line in bytes
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,
    /// Serial driver read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_addr() -> String {
    "localhost:5000".to_string()
}

fn default_monitor_interval() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_command_len() -> usize {
    4096
}

fn default_read_timeout() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            monitor_interval_ms: default_monitor_interval(),
            buffer_size: default_buffer_size(),
            max_command_len: default_max_command_len(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}
