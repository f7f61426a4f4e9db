//! In-process shard transport
//!
//! [`MemoryServer`] stands in for a shard node, keeping objects per
//! namespace label. Servers can be taken offline and objects corrupted or
//! removed, which lets pipeline tests exercise the degraded read paths.

use crate::{Dialer, KeyStream, ShardClient};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use zstor_common::{Error, ObjectStatus, Result, display_key};

struct StoredObject {
    data: Vec<u8>,
    corrupted: bool,
}

/// A shard node living in process memory
pub struct MemoryServer {
    address: String,
    /// label -> key -> object
    namespaces: RwLock<HashMap<String, HashMap<Vec<u8>, StoredObject>>>,
    available: AtomicBool,
    open_connections: AtomicUsize,
}

impl MemoryServer {
    /// Create an empty, available server
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            namespaces: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            open_connections: AtomicUsize::new(0),
        }
    }

    /// Address this server answers on
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Take the server offline or bring it back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the server currently answers requests
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of clients connected and not yet closed
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Number of objects stored in namespace `label`
    #[must_use]
    pub fn object_count(&self, label: &str) -> usize {
        self.namespaces.read().get(label).map_or(0, HashMap::len)
    }

    /// Flip a bit of the stored object and mark it corrupted
    ///
    /// Returns false if the object does not exist.
    pub fn corrupt_object(&self, label: &str, key: &[u8]) -> bool {
        let mut namespaces = self.namespaces.write();
        let Some(object) = namespaces.get_mut(label).and_then(|ns| ns.get_mut(key)) else {
            return false;
        };
        if let Some(byte) = object.data.first_mut() {
            *byte ^= 0xFF;
        }
        object.corrupted = true;
        true
    }

    /// Copy of the bytes stored under `key`
    #[must_use]
    pub fn object(&self, label: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.namespaces
            .read()
            .get(label)
            .and_then(|ns| ns.get(key))
            .map(|object| object.data.clone())
    }

    /// Store `data` under `key` behind the client's back
    ///
    /// The server keeps reporting the object as intact, whatever `data` is.
    pub fn put_object(&self, label: &str, key: &[u8], data: Vec<u8>) {
        self.namespaces
            .write()
            .entry(label.to_string())
            .or_default()
            .insert(
                key.to_vec(),
                StoredObject {
                    data,
                    corrupted: false,
                },
            );
    }

    /// Drop a stored object behind the client's back
    pub fn remove_object(&self, label: &str, key: &[u8]) -> bool {
        self.namespaces
            .write()
            .get_mut(label)
            .and_then(|ns| ns.remove(key))
            .is_some()
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(format!(
                "shard {} is unavailable",
                self.address
            )))
        }
    }
}

/// Client bound to one [`MemoryServer`] and namespace
pub struct MemoryShardClient {
    server: Arc<MemoryServer>,
    label: String,
    closed: AtomicBool,
}

impl MemoryShardClient {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(format!(
                "connection to {} is closed",
                self.server.address
            )));
        }
        self.server.check_available()
    }
}

#[async_trait]
impl ShardClient for MemoryShardClient {
    async fn set_object(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check()?;
        self.server
            .namespaces
            .write()
            .entry(self.label.clone())
            .or_default()
            .insert(
                key.to_vec(),
                StoredObject {
                    data: data.to_vec(),
                    corrupted: false,
                },
            );
        Ok(key.to_vec())
    }

    async fn get_object(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check()?;
        let namespaces = self.server.namespaces.read();
        match namespaces.get(&self.label).and_then(|ns| ns.get(key)) {
            Some(object) if object.corrupted => Err(Error::ObjectCorrupted {
                key: display_key(key),
            }),
            Some(object) => Ok(object.data.clone()),
            None => Err(Error::KeyNotFound {
                key: display_key(key),
            }),
        }
    }

    async fn delete_object(&self, key: &[u8]) -> Result<()> {
        self.check()?;
        if let Some(ns) = self.server.namespaces.write().get_mut(&self.label) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn get_object_status(&self, key: &[u8]) -> Result<ObjectStatus> {
        self.check()?;
        let namespaces = self.server.namespaces.read();
        Ok(
            match namespaces.get(&self.label).and_then(|ns| ns.get(key)) {
                Some(object) if object.corrupted => ObjectStatus::Corrupted,
                Some(_) => ObjectStatus::Ok,
                None => ObjectStatus::Missing,
            },
        )
    }

    async fn list_object_keys(&self) -> Result<KeyStream> {
        self.check()?;
        let keys: Vec<Vec<u8>> = self
            .server
            .namespaces
            .read()
            .get(&self.label)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        Ok(futures::stream::iter(keys.into_iter().map(Ok)).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.server.check_available()?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Dialer resolving addresses to registered [`MemoryServer`]s
#[derive(Default)]
pub struct MemoryDialer {
    servers: RwLock<HashMap<String, Arc<MemoryServer>>>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    /// Create a dialer with no servers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dialer with one fresh server per address
    #[must_use]
    pub fn with_servers(addresses: &[String]) -> Self {
        let dialer = Self::new();
        for address in addresses {
            dialer.add_server(address);
        }
        dialer
    }

    /// Register a fresh server under `address`
    pub fn add_server(&self, address: &str) -> Arc<MemoryServer> {
        let server = Arc::new(MemoryServer::new(address));
        self.servers
            .write()
            .insert(address.to_string(), server.clone());
        server
    }

    /// Look up the server registered under `address`
    #[must_use]
    pub fn server(&self, address: &str) -> Option<Arc<MemoryServer>> {
        self.servers.read().get(address).cloned()
    }

    /// Total number of successful dials
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str, label: &str) -> Result<Arc<dyn ShardClient>> {
        let server = self
            .server(address)
            .ok_or_else(|| Error::ConnectionFailed(format!("no shard at {address}")))?;
        // Let concurrent dials interleave as they would over a network
        tokio::task::yield_now().await;
        server.check_available()?;

        server.open_connections.fetch_add(1, Ordering::SeqCst);
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryShardClient {
            server,
            label: label.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}
