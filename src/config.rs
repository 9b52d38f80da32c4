use crate::header::{DeviceType, RBM_MIN_BLOCK_SIZE};
use crate::types::DeviceId;
use crate::util::{RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Settings for one random block device, persisted as JSON.
///
/// A relative `path` is resolved against the directory holding the config
/// file when loaded through [`RbmConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RbmConfig {
    pub path: PathBuf,
    pub device_id: DeviceId,
    pub size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default)]
    pub start: u64,
    #[serde(default = "default_true")]
    pub major_dev: bool,
    #[serde(default = "default_true")]
    pub sync_on_complete: bool,
    /// Overrides the file device's built-in retry schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_retry: Option<IoRetryConfig>,
}

impl RbmConfig {
    pub fn new(path: impl Into<PathBuf>, device_id: DeviceId, size: u64) -> Self {
        Self {
            path: path.into(),
            device_id,
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            start: 0,
            major_dev: true,
            sync_on_complete: true,
            io_retry: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let mut config: RbmConfig = serde_json::from_slice(&bytes)?;
        if config.path.is_relative() {
            let base = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            config.path = base.join(&config.path);
        }
        config.validate()?;
        Ok(config)
    }

    /// Writes the config atomically via a sibling temp file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        let payload = serde_json::to_vec_pretty(self)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_null() {
            return Err(ConfigError::Invalid("device_id 255 is reserved".into()));
        }
        if !self.block_size.is_power_of_two() || self.block_size < RBM_MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size {} must be a power of two of at least {}",
                self.block_size, RBM_MIN_BLOCK_SIZE
            )));
        }
        if self.start % self.block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "start {:#x} is not aligned to block_size {}",
                self.start, self.block_size
            )));
        }
        if self.size <= self.start {
            return Err(ConfigError::Invalid(format!(
                "size {} leaves nothing after start {:#x}",
                self.size, self.start
            )));
        }
        Ok(())
    }

    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            size: self.size,
            block_size: self.block_size,
            start: self.start,
            major_dev: self.major_dev,
            device_type: DeviceType::RandomBlockSsd,
            device_id: self.device_id,
            seastore_id: [0u8; 16],
        }
    }
}

/// Retry schedule for transient device I/O failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoRetryConfig {
    #[serde(default = "default_retry_strategy")]
    pub strategy: RetryStrategy,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    /// Zero leaves the delay uncapped.
    #[serde(default)]
    pub max_delay_ms: u64,
}

impl IoRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let base_delay = Duration::from_millis(self.base_delay_ms);
        let policy = match self.strategy {
            RetryStrategy::Linear => RetryPolicy::linear(self.max_attempts, base_delay),
            RetryStrategy::Exponential => RetryPolicy::exponential(self.max_attempts, base_delay),
        };
        policy.with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Geometry and identity written by `mkfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub size: u64,
    pub block_size: u64,
    pub start: u64,
    pub major_dev: bool,
    pub device_type: DeviceType,
    pub device_id: DeviceId,
    pub seastore_id: [u8; 16],
}

impl FormatOptions {
    pub fn new(device_id: DeviceId, size: u64) -> Self {
        Self {
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            start: 0,
            major_dev: true,
            device_type: DeviceType::RandomBlockSsd,
            device_id,
            seastore_id: [0u8; 16],
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_seastore_id(mut self, seastore_id: [u8; 16]) -> Self {
        self.seastore_id = seastore_id;
        self
    }
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_retry_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
