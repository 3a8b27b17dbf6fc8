use crate::{MoveError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kvmove.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveConfig {
    /// Connection URI of the local hypervisor
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
    /// Where exported definitions are written, on both hosts
    #[serde(default = "default_definition_dir")]
    pub definition_dir: PathBuf,
    /// Volume group used when a volume path does not name one
    #[serde(default = "default_volume_group")]
    pub volume_group: String,
    #[serde(default = "default_extent_bytes")]
    pub lvm_extent_bytes: u64,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_user")]
    pub user: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
    /// Directory holding the ssh control socket
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Unset means wait for the guest forever
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
    #[serde(default = "default_settle")]
    pub define_settle_ms: u64,
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_definition_dir() -> PathBuf {
    PathBuf::from("/root")
}

fn default_volume_group() -> String {
    "ubuntu-vg".to_string()
}

fn default_extent_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_remote_host() -> String {
    "otherkvm".to_string()
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_block_size() -> usize {
    4096
}

fn default_zstd_level() -> u8 {
    6
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_settle() -> u64 {
    1000
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: default_libvirt_uri(),
            definition_dir: default_definition_dir(),
            volume_group: default_volume_group(),
            lvm_extent_bytes: default_extent_bytes(),
            remote: RemoteConfig::default(),
            transfer: TransferConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_remote_host(),
            user: default_remote_user(),
            connect_timeout_secs: default_connect_timeout(),
            libvirt_uri: default_libvirt_uri(),
            control_dir: default_control_dir(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: None,
            define_settle_ms: default_settle(),
        }
    }
}

impl MoveConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: MoveConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            crate::log_debug!("{} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(MoveError::Config("remote.host must not be empty".to_string()));
        }
        if self.transfer.block_size == 0 {
            return Err(MoveError::Config(
                "transfer.block_size must be positive".to_string(),
            ));
        }
        if !(1..=19).contains(&self.transfer.zstd_level) {
            return Err(MoveError::Config(format!(
                "transfer.zstd_level must be within 1..=19, got {}",
                self.transfer.zstd_level
            )));
        }
        if self.lifecycle.poll_interval_ms == 0 {
            return Err(MoveError::Config(
                "lifecycle.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lifecycle.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.lifecycle.shutdown_timeout_secs.map(Duration::from_secs)
    }

    pub fn define_settle(&self) -> Duration {
        Duration::from_millis(self.lifecycle.define_settle_ms)
    }

    /// Destination URI handed to the native live migration: the remote
    /// hypervisor's URI reached over ssh as `remote.user`.
    pub fn live_destination_uri(&self) -> String {
        let uri = self.remote.libvirt_uri.as_str();
        let (driver, rest) = uri.split_once("://").unwrap_or((uri, ""));
        let driver = driver.split('+').next().unwrap_or(driver);
        let path = match rest.find('/') {
            Some(start) => &rest[start..],
            None => "/system",
        };
        format!(
            "{}+ssh://{}@{}{}",
            driver, self.remote.user, self.remote.host, path
        )
    }
}
