//! In-memory metadata store

use crate::MetaStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use zstor_common::{Error, Metadata, Result, display_key};

/// Metadata store keeping records in a lock-protected map
#[derive(Default)]
pub struct MemoryMetaStore {
    records: RwLock<HashMap<Vec<u8>, Metadata>>,
}

impl MemoryMetaStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn set_metadata(&self, metadata: &Metadata) -> Result<()> {
        if metadata.key.is_empty() {
            return Err(Error::MissingKey);
        }
        self.records
            .write()
            .insert(metadata.key.clone(), metadata.clone());
        Ok(())
    }

    async fn get_metadata(&self, key: &[u8]) -> Result<Metadata> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::MetadataNotFound {
                key: display_key(key),
            })
    }

    async fn delete_metadata(&self, key: &[u8]) -> Result<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
