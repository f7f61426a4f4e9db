//! zstor Common - Shared types and utilities
//!
//! This crate provides the data model, error definitions and configuration
//! used across all zstor components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    ClientConfig, CompressionMode, DataStorConfig, DistributionConfig, EncryptionConfig,
    MetaStorConfig, PipelineConfig,
};
pub use error::{Error, Result};
pub use types::*;
