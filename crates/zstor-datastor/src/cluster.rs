//! Shard cluster
//!
//! A cluster owns one connection per shard. Listed shards are dialed up
//! front and are the only candidates for random selection and for new
//! writes. Unlisted shards are dialed lazily when metadata references an
//! address outside the listed set.

use crate::grpc::GrpcDialer;
use crate::{Dialer, Shard, ShardIterator};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zstor_common::{DataStorConfig, Error, Result};

/// Set of shards scoped to one namespace label
pub struct Cluster {
    /// Listed shards in configuration order
    listed: Vec<Shard>,
    /// Address to index into `listed`
    listed_index: HashMap<String, usize>,
    /// Shards dialed on demand; the lock is held across the dial
    unlisted: Mutex<HashMap<String, Shard>>,
    label: String,
    dialer: Arc<dyn Dialer>,
}

impl Cluster {
    /// Create a cluster over gRPC shards
    pub async fn connect(
        addresses: &[String],
        label: &str,
        config: &DataStorConfig,
        token_getter: Option<Arc<dyn crate::JwtTokenGetter>>,
    ) -> Result<Self> {
        let dialer = GrpcDialer::from_config(config, token_getter);
        Self::with_dialer(addresses, label, Arc::new(dialer)).await
    }

    /// Create a cluster, dialing every listed address with `dialer`
    ///
    /// Construction is all-or-nothing: if any dial fails, the shards opened
    /// so far are closed again and the dial error is returned.
    pub async fn with_dialer(
        addresses: &[String],
        label: &str,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::NoShards);
        }
        if label.is_empty() {
            return Err(Error::NoLabel);
        }

        let mut listed: Vec<Shard> = Vec::with_capacity(addresses.len());
        let mut listed_index = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if listed_index.contains_key(address) {
                close_all(&listed).await;
                return Err(Error::invalid_argument(format!(
                    "shard address {address} listed more than once"
                )));
            }
            match dialer.dial(address, label).await {
                Ok(client) => {
                    listed_index.insert(address.clone(), listed.len());
                    listed.push(Shard::new(address, client));
                }
                Err(e) => {
                    warn!("Failed to dial shard {}: {}", address, e);
                    close_all(&listed).await;
                    return Err(e);
                }
            }
        }

        info!(
            "Cluster for namespace {} connected to {} shards",
            label,
            listed.len()
        );
        Ok(Self {
            listed,
            listed_index,
            unlisted: Mutex::new(HashMap::new()),
            label: label.to_string(),
            dialer,
        })
    }

    /// Namespace label every shard is scoped to
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of listed shards
    #[must_use]
    pub fn listed_shard_count(&self) -> usize {
        self.listed.len()
    }

    /// Get the shard at `address`, dialing it once if it is not listed
    ///
    /// Concurrent calls for the same unlisted address share one connection.
    pub async fn get_shard(&self, address: &str) -> Result<Shard> {
        if let Some(&idx) = self.listed_index.get(address) {
            return Ok(self.listed[idx].clone());
        }

        let mut unlisted = self.unlisted.lock().await;
        if let Some(shard) = unlisted.get(address) {
            return Ok(shard.clone());
        }

        let client = self.dialer.dial(address, &self.label).await?;
        let shard = Shard::new(address, client);
        unlisted.insert(address.to_string(), shard.clone());
        debug!("Dialed unlisted shard {}", address);
        Ok(shard)
    }

    /// Pick a listed shard uniformly at random
    pub fn get_random_shard(&self) -> Result<Shard> {
        if self.listed.is_empty() {
            return Err(Error::NoShards);
        }
        let idx = rand::thread_rng().gen_range(0..self.listed.len());
        Ok(self.listed[idx].clone())
    }

    /// Iterate the listed shards in random order, skipping `except`
    #[must_use]
    pub fn get_random_shard_iterator(&self, except: &[String]) -> ShardIterator {
        let candidates = self
            .listed
            .iter()
            .filter(|shard| !except.iter().any(|e| e == shard.identifier()))
            .cloned()
            .collect();
        ShardIterator::new(candidates)
    }

    /// Close every shard, unlisted first
    ///
    /// All shards are attempted even if some fail; the failures are counted
    /// into a single error.
    pub async fn close(&self) -> Result<()> {
        let unlisted: Vec<Shard> = self.unlisted.lock().await.drain().map(|(_, s)| s).collect();
        let total = unlisted.len() + self.listed.len();

        let failed = close_all(&unlisted).await + close_all(&self.listed).await;
        if failed > 0 {
            return Err(Error::ShardClose { failed, total });
        }
        info!("Closed {} shards of namespace {}", total, self.label);
        Ok(())
    }
}

/// Close the given shards, returning how many failed
async fn close_all(shards: &[Shard]) -> usize {
    let mut failed = 0;
    for shard in shards {
        if let Err(e) = shard.close().await {
            warn!("Failed to close shard {}: {}", shard.identifier(), e);
            failed += 1;
        }
    }
    failed
}
