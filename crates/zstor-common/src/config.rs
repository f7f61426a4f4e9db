//! Configuration types for zstor
//!
//! All structures deserialize with defaults for absent fields, so a file
//! only needs to name what differs from the defaults. [`ClientConfig::from_file`]
//! loads any format known to the `config` crate and applies `ZSTOR__*`
//! environment overrides (e.g. `ZSTOR__PIPELINE__BLOCK_SIZE=65536`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration of a zstor client
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Namespace label used on every shard
    pub namespace: String,
    /// Data shard cluster configuration
    pub datastor: DataStorConfig,
    /// Metadata store configuration
    pub metastor: MetaStorConfig,
    /// Data processing pipeline configuration
    pub pipeline: PipelineConfig,
}

impl ClientConfig {
    /// Create a configuration for the given namespace and shard addresses
    #[must_use]
    pub fn new(namespace: impl Into<String>, shards: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            datastor: DataStorConfig {
                shards,
                ..DataStorConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("ZSTOR").separator("__"))
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        let cfg: Self = settings
            .try_deserialize()
            .map_err(|e| Error::configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::NoLabel);
        }
        self.datastor.validate()?;
        self.pipeline.validate(self.datastor.shards.len())
    }
}

/// Data shard cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStorConfig {
    /// Addresses of the listed shards
    pub shards: Vec<String>,
    /// Deadline of a single shard request, in seconds
    pub request_timeout_secs: u64,
    /// Maximum gRPC message size, in bytes
    pub max_message_size: usize,
}

impl Default for DataStorConfig {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            request_timeout_secs: 30,
            max_message_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl DataStorConfig {
    /// Deadline of a single shard request
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::NoShards);
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::configuration("request timeout must be > 0"));
        }
        Ok(())
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaStorConfig {
    /// Path of the persistent metadata database; in-memory when absent
    pub db_path: Option<PathBuf>,
    /// Deadline of a single metadata operation, in seconds
    pub op_timeout_secs: u64,
}

impl Default for MetaStorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            op_timeout_secs: 10,
        }
    }
}

impl MetaStorConfig {
    /// Deadline of a single metadata operation
    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Compression mode of the processing pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// No compression
    Disabled,
    /// Balanced speed and ratio
    #[default]
    Default,
    /// Fastest compression
    BestSpeed,
    /// Highest compression ratio
    BestCompression,
}

/// Encryption configuration of the processing pipeline
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// AES key (16 or 32 bytes); encryption is disabled when absent
    pub private_key: Option<String>,
}

impl EncryptionConfig {
    /// Whether encryption is enabled
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.private_key.is_some()
    }
}

/// Erasure distribution configuration
///
/// Distribution is disabled when `data_shard_count` is 0, in which case
/// chunks are replicated instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Number of data pieces per chunk (k)
    pub data_shard_count: usize,
    /// Number of parity pieces per chunk (m)
    pub parity_shard_count: usize,
}

impl DistributionConfig {
    /// Create a distribution configuration
    #[must_use]
    pub const fn new(data_shard_count: usize, parity_shard_count: usize) -> Self {
        Self {
            data_shard_count,
            parity_shard_count,
        }
    }

    /// Whether erasure distribution is enabled
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.data_shard_count > 0
    }

    /// Total number of pieces per chunk (k + m)
    #[must_use]
    pub const fn total_shards(&self) -> usize {
        self.data_shard_count + self.parity_shard_count
    }
}

/// Data processing pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Chunk size in bytes; 0 never splits an object
    pub block_size: usize,
    /// Compression mode
    pub compression: CompressionMode,
    /// Encryption configuration
    pub encryption: EncryptionConfig,
    /// Erasure distribution; takes precedence over replication when enabled
    pub distribution: DistributionConfig,
    /// Number of replicas per chunk when distribution is disabled
    pub replication_nr: usize,
    /// Number of chunks processed concurrently per object
    pub max_concurrent_chunks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024 * 1024, // 4 MB
            compression: CompressionMode::Default,
            encryption: EncryptionConfig::default(),
            distribution: DistributionConfig::default(),
            replication_nr: 1,
            max_concurrent_chunks: 8,
        }
    }
}

impl PipelineConfig {
    /// Validate against the number of listed shards
    pub fn validate(&self, shard_count: usize) -> Result<()> {
        if self.max_concurrent_chunks == 0 {
            return Err(Error::configuration("max_concurrent_chunks must be > 0"));
        }

        if self.distribution.enabled() {
            if self.distribution.parity_shard_count == 0 {
                return Err(Error::configuration(
                    "distribution requires at least one parity shard",
                ));
            }
            if self.distribution.total_shards() > shard_count {
                return Err(Error::configuration(format!(
                    "distribution needs {} shards, only {} listed",
                    self.distribution.total_shards(),
                    shard_count
                )));
            }
        } else {
            if self.replication_nr == 0 {
                return Err(Error::configuration("replication_nr must be > 0"));
            }
            if self.replication_nr > shard_count {
                return Err(Error::configuration(format!(
                    "replication needs {} shards, only {} listed",
                    self.replication_nr, shard_count
                )));
            }
        }

        if let Some(key) = &self.encryption.private_key {
            if key.len() != 16 && key.len() != 32 {
                return Err(Error::configuration(format!(
                    "encryption key must be 16 or 32 bytes, got {}",
                    key.len()
                )));
            }
        }

        Ok(())
    }

    /// Number of pieces stored per chunk
    #[must_use]
    pub const fn pieces_per_chunk(&self) -> usize {
        if self.distribution.enabled() {
            self.distribution.total_shards()
        } else {
            self.replication_nr
        }
    }
}
