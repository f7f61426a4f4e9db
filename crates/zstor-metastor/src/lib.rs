//! zstor Metastor - metadata storage
//!
//! The metadata store is the sole owner of [`Metadata`] records; the client
//! only links records to each other by key. Two implementations ship with
//! the crate: an in-memory map and a redb-backed persistent store.

pub mod memory;
pub mod store;
mod tables;

pub use memory::MemoryMetaStore;
pub use store::{MetaStoreError, RedbMetaStore};

use async_trait::async_trait;
use zstor_common::{Metadata, Result};

/// Durable key to [`Metadata`] map
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Store `metadata` under its own key, replacing any previous record
    async fn set_metadata(&self, metadata: &Metadata) -> Result<()>;

    /// Load the record stored under `key`
    ///
    /// Fails with [`zstor_common::Error::MetadataNotFound`] if there is none.
    async fn get_metadata(&self, key: &[u8]) -> Result<Metadata>;

    /// Remove the record stored under `key`; removing a missing record succeeds
    async fn delete_metadata(&self, key: &[u8]) -> Result<()>;

    /// Release the store
    async fn close(&self) -> Result<()>;
}
