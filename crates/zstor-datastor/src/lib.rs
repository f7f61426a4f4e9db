//! zstor Datastor - shard clients and the shard cluster
//!
//! A shard is one independent storage node. Pipeline and traversal code only
//! see the [`ShardClient`] capability; each transport (gRPC, in-memory)
//! provides one implementation of it, plus a [`Dialer`] the [`Cluster`] uses
//! to open connections.

pub mod cluster;
pub mod grpc;
pub mod iterator;
pub mod jwt;
pub mod memory;

pub use cluster::Cluster;
pub use grpc::{GrpcDialer, GrpcShardClient};
pub use iterator::ShardIterator;
pub use jwt::JwtTokenGetter;
pub use memory::{MemoryDialer, MemoryServer, MemoryShardClient};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use zstor_common::{ObjectStatus, Result};

/// Stream of keys stored in a namespace; errors are reported in-band
pub type KeyStream = BoxStream<'static, Result<Vec<u8>>>;

/// Block operations offered by a single shard
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Store `data` under `key`, returning the key it was stored under
    async fn set_object(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Fetch the data stored under `key`
    async fn get_object(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Delete the data stored under `key`; deleting a missing key succeeds
    async fn delete_object(&self, key: &[u8]) -> Result<()>;

    /// Report whether `key` is missing, intact or corrupted
    async fn get_object_status(&self, key: &[u8]) -> Result<ObjectStatus>;

    /// Enumerate all keys of the namespace
    async fn list_object_keys(&self) -> Result<KeyStream>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Opens shard clients for a transport
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the shard at `address`, scoped to namespace `label`
    async fn dial(&self, address: &str, label: &str) -> Result<Arc<dyn ShardClient>>;
}

/// A shard client paired with the address identifying it in a cluster
#[derive(Clone)]
pub struct Shard {
    address: Arc<str>,
    client: Arc<dyn ShardClient>,
}

impl Shard {
    /// Wrap a client under the given address
    #[must_use]
    pub fn new(address: &str, client: Arc<dyn ShardClient>) -> Self {
        Self {
            address: Arc::from(address),
            client,
        }
    }

    /// Address identifying this shard
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.address
    }
}

impl Deref for Shard {
    type Target = dyn ShardClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
