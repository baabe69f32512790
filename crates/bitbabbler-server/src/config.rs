//! Daemon configuration: a `BitbabblerConfig` loaded from TOML and
//! overridable from the CLI. `bitbabbler-core` stays agnostic of where
//! its tuning numbers come from; this module is the one place that
//! knows about files and flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bitbabbler_core::DeviceId;

fn default_pool_size() -> usize {
    bitbabbler_core::pool::DEFAULT_POOL_SIZE
}

fn default_sample_block_bytes() -> usize {
    64
}

fn default_fold() -> u32 {
    1
}

fn default_bitrate_hz() -> u32 {
    1_000_000
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_latency_ms() -> u8 {
    16
}

fn default_sleep_init_ms() -> u64 {
    1
}

fn default_sleep_max_ms() -> u64 {
    1000
}

fn default_suspend_after_ms() -> u64 {
    60_000
}

fn default_control_socket_path() -> PathBuf {
    PathBuf::from("/run/bitbabbler/control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub group: u32,
    #[serde(default = "default_bitrate_hz")]
    pub bitrate_hz: u32,
    #[serde(default = "default_fold")]
    pub fold: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u8,
}

impl DeviceConfig {
    pub fn device_id(&self) -> Result<DeviceId, ConfigError> {
        self.id.parse().map_err(|_| ConfigError::InvalidDeviceId(self.id.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumersConfig {
    /// Feed the OS kernel's entropy pool (Linux only; a no-op elsewhere).
    #[serde(default)]
    pub kernel: bool,
    #[serde(default = "default_kernel_device_path")]
    pub kernel_device_path: PathBuf,
    /// Bind address for the UDP request/reply source, e.g. `127.0.0.1:7869`.
    #[serde(default)]
    pub udp_bind: Option<String>,
    /// Path to a "watch" source to drain into the pool alongside the
    /// configured devices (another generator, or a file being populated).
    #[serde(default)]
    pub watch_path: Option<PathBuf>,
    #[serde(default = "default_watch_block_bytes")]
    pub watch_block_bytes: usize,
    #[serde(default)]
    pub watch_delay_ms: u64,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            kernel: false,
            kernel_device_path: default_kernel_device_path(),
            udp_bind: None,
            watch_path: None,
            watch_block_bytes: default_watch_block_bytes(),
            watch_delay_ms: 0,
        }
    }
}

fn default_kernel_device_path() -> PathBuf {
    PathBuf::from("/dev/random")
}

fn default_watch_block_bytes() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitbabblerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_sample_block_bytes")]
    pub sample_block_bytes: usize,
    #[serde(default = "default_sleep_init_ms")]
    pub sleep_init_ms: u64,
    #[serde(default = "default_sleep_max_ms")]
    pub sleep_max_ms: u64,
    #[serde(default = "default_suspend_after_ms")]
    pub suspend_after_ms: u64,
    #[serde(default)]
    pub no_qa: bool,
    #[serde(default = "default_control_socket_path")]
    pub control_socket_path: PathBuf,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub log_verbosity: i64,
    #[serde(default)]
    pub consumers: ConsumersConfig,
}

impl Default for BitbabblerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            sample_block_bytes: default_sample_block_bytes(),
            sleep_init_ms: default_sleep_init_ms(),
            sleep_max_ms: default_sleep_max_ms(),
            suspend_after_ms: default_suspend_after_ms(),
            no_qa: false,
            control_socket_path: default_control_socket_path(),
            devices: Vec::new(),
            log_verbosity: 0,
            consumers: ConsumersConfig::default(),
        }
    }
}

impl BitbabblerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn sleep_init(&self) -> Duration {
        Duration::from_millis(self.sleep_init_ms)
    }

    pub fn sleep_max(&self) -> Duration {
        Duration::from_millis(self.sleep_max_ms)
    }

    pub fn suspend_after(&self) -> Duration {
        Duration::from_millis(self.suspend_after_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid device identity {0:?}")]
    InvalidDeviceId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BitbabblerConfig::default();
        assert_eq!(config.pool_size, 64 * 1024);
        assert_eq!(config.sample_block_bytes, 64);
        assert!(!config.no_qa);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [[devices]]
            id = "AB1234CD"
            group = 1
        "#;
        let config = BitbabblerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].id, "AB1234CD");
        assert_eq!(config.devices[0].bitrate_hz, default_bitrate_hz());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(BitbabblerConfig::from_toml_str("not = [valid").is_err());
    }

    #[test]
    fn consumers_default_to_disabled() {
        let config = BitbabblerConfig::default();
        assert!(!config.consumers.kernel);
        assert_eq!(config.consumers.kernel_device_path, PathBuf::from("/dev/random"));
        assert!(config.consumers.udp_bind.is_none());
        assert!(config.consumers.watch_path.is_none());
        assert_eq!(config.consumers.watch_block_bytes, default_watch_block_bytes());
    }

    #[test]
    fn parses_consumers_section() {
        let toml = r#"
            [consumers]
            kernel = true
            udp_bind = "127.0.0.1:7869"
            watch_path = "/tmp/other-source"
            watch_block_bytes = 256
            watch_delay_ms = 50
        "#;
        let config = BitbabblerConfig::from_toml_str(toml).unwrap();
        assert!(config.consumers.kernel);
        assert_eq!(config.consumers.udp_bind.as_deref(), Some("127.0.0.1:7869"));
        assert_eq!(config.consumers.watch_path, Some(PathBuf::from("/tmp/other-source")));
        assert_eq!(config.consumers.watch_block_bytes, 256);
        assert_eq!(config.consumers.watch_delay_ms, 50);
    }
}
