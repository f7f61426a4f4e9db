//! Client facade
//!
//! Composes the pipeline, the shard cluster and the metadata store into
//! object level operations.

use crate::pipeline::Pipeline;
use crate::traverse::{Direction, EpochRange, TraverseIterator};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};
use zstor_common::{
    CheckStatus, ClientConfig, Error, Metadata, PipelineConfig, Result, display_key,
};
use zstor_datastor::{Cluster, Dialer, JwtTokenGetter};
use zstor_metastor::{MemoryMetaStore, MetaStore, RedbMetaStore};

/// Client of a zstor namespace
pub struct Client {
    pipeline: Arc<Pipeline>,
    metastore: Arc<dyn MetaStore>,
}

impl Client {
    /// Connect to the configured gRPC shards and open the configured
    /// metadata store
    pub async fn from_config(
        config: &ClientConfig,
        token_getter: Option<Arc<dyn JwtTokenGetter>>,
    ) -> Result<Self> {
        config.validate()?;
        let metastore: Arc<dyn MetaStore> = if config.metastor.db_path.is_some() {
            Arc::new(RedbMetaStore::from_config(&config.metastor)?)
        } else {
            Arc::new(MemoryMetaStore::new())
        };
        let cluster = Cluster::connect(
            &config.datastor.shards,
            &config.namespace,
            &config.datastor,
            token_getter,
        )
        .await?;
        Self::new(&config.pipeline, Arc::new(cluster), metastore)
    }

    /// Create a client whose shards are opened with `dialer`
    pub async fn with_dialer(
        config: &ClientConfig,
        dialer: Arc<dyn Dialer>,
        metastore: Arc<dyn MetaStore>,
    ) -> Result<Self> {
        config.validate()?;
        let cluster =
            Cluster::with_dialer(&config.datastor.shards, &config.namespace, dialer).await?;
        Self::new(&config.pipeline, Arc::new(cluster), metastore)
    }

    /// Create a client over an existing cluster and metadata store
    pub fn new(
        config: &PipelineConfig,
        cluster: Arc<Cluster>,
        metastore: Arc<dyn MetaStore>,
    ) -> Result<Self> {
        Ok(Self {
            pipeline: Arc::new(Pipeline::new(config, cluster)?),
            metastore,
        })
    }

    /// Shard cluster of this client
    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        self.pipeline.cluster()
    }

    /// Metadata store of this client
    #[must_use]
    pub fn metastore(&self) -> &Arc<dyn MetaStore> {
        &self.metastore
    }

    /// Store the data of `reader` under a new `key`
    ///
    /// Fails with [`Error::MetadataExists`] if `key` is already stored.
    pub async fn write<R>(&self, key: &[u8], reader: R) -> Result<Metadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        if key.is_empty() {
            return Err(Error::MissingKey);
        }
        self.store(key, None, reader).await
    }

    /// Store the data of `reader` under `key` and append it after `prev_key`
    ///
    /// The new record is written first, then the predecessor is updated to
    /// point at it. The two updates are not atomic: if the second fails, the
    /// link only exists from the new record back to its predecessor.
    pub async fn write_linked<R>(
        &self,
        key: &[u8],
        prev_key: &[u8],
        reader: Option<R>,
    ) -> Result<Metadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        match (key.is_empty(), prev_key.is_empty()) {
            (true, true) => return Err(Error::MissingKeys),
            (true, false) => return Err(Error::MissingKey),
            (false, true) => return Err(Error::MissingPrevKey),
            (false, false) => {}
        }
        let Some(reader) = reader else {
            return Err(Error::MissingReader);
        };
        if key == prev_key {
            return Err(Error::invalid_argument(format!(
                "object {} cannot be linked to itself",
                display_key(key)
            )));
        }

        let mut previous = self.metastore.get_metadata(prev_key).await?;
        if let Some(next) = previous.next.as_deref().filter(|next| *next != key) {
            return Err(Error::invalid_argument(format!(
                "object {} is already followed by {}",
                display_key(prev_key),
                display_key(next)
            )));
        }

        let metadata = self.store(key, Some(prev_key.to_vec()), reader).await?;

        previous.next = Some(key.to_vec());
        if let Err(e) = self.metastore.set_metadata(&previous).await {
            warn!(
                "Object {} stored, but linking it from {} failed: {}",
                display_key(key),
                display_key(prev_key),
                e
            );
            return Err(e);
        }
        Ok(metadata)
    }

    /// Fail if a record is already stored under `key`
    ///
    /// Records are never replaced, so chains stay append-only.
    async fn ensure_absent(&self, key: &[u8]) -> Result<()> {
        match self.metastore.get_metadata(key).await {
            Ok(_) => Err(Error::MetadataExists {
                key: display_key(key),
            }),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn store<R>(&self, key: &[u8], previous: Option<Vec<u8>>, reader: R) -> Result<Metadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_absent(key).await?;
        let chunks = self.pipeline.write(key, reader).await?;
        let mut metadata = Metadata::new(key.to_vec(), chunks);
        metadata.previous = previous;
        self.metastore.set_metadata(&metadata).await?;
        Ok(metadata)
    }

    /// Write the data stored under `key` to `writer`
    pub async fn read<W>(&self, key: &[u8], writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if key.is_empty() {
            return Err(Error::MissingKey);
        }
        let metadata = self.metastore.get_metadata(key).await?;
        self.pipeline.read(&metadata, writer).await
    }

    /// Write the data described by `metadata` to `writer`
    pub async fn read_metadata<W>(&self, metadata: &Metadata, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.pipeline.read(metadata, writer).await
    }

    /// Load the metadata stored under `key`
    pub async fn get_metadata(&self, key: &[u8]) -> Result<Metadata> {
        if key.is_empty() {
            return Err(Error::MissingKey);
        }
        self.metastore.get_metadata(key).await
    }

    /// Delete the data and the metadata of `key`
    ///
    /// The metadata is kept if any piece could not be deleted, so the call
    /// can be retried. Links of neighbouring records are left untouched.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let metadata = self.get_metadata(key).await?;
        self.pipeline.delete(&metadata).await?;
        self.metastore.delete_metadata(key).await
    }

    /// Report the health of the object stored under `key`
    pub async fn check(&self, key: &[u8], fast: bool) -> Result<CheckStatus> {
        let metadata = self.get_metadata(key).await?;
        self.pipeline.check(&metadata, fast).await
    }

    /// Restore the missing or corrupted pieces of the object stored under
    /// `key`, returning its updated metadata
    pub async fn repair(&self, key: &[u8]) -> Result<Metadata> {
        let metadata = self.get_metadata(key).await?;
        let repaired = self.pipeline.repair(&metadata).await?;
        if repaired != metadata {
            self.metastore.set_metadata(&repaired).await?;
            info!("Repaired object {}", display_key(key));
        }
        Ok(repaired)
    }

    /// Walk the chain starting at `start_key` along `next` links
    ///
    /// Only records with `from_epoch <= epoch <= to_epoch` are returned;
    /// bounds `<= 0` are open.
    pub fn traverse(
        &self,
        start_key: &[u8],
        from_epoch: i64,
        to_epoch: i64,
    ) -> Result<TraverseIterator> {
        self.iterator(start_key, Direction::Forward, from_epoch, to_epoch)
    }

    /// Walk the chain starting at `start_key` along `previous` links
    ///
    /// Walking backward in time, `from_epoch` is the later bound and
    /// `to_epoch` the earlier one; bounds `<= 0` are open.
    pub fn traverse_post_order(
        &self,
        start_key: &[u8],
        from_epoch: i64,
        to_epoch: i64,
    ) -> Result<TraverseIterator> {
        self.iterator(start_key, Direction::Backward, to_epoch, from_epoch)
    }

    fn iterator(
        &self,
        start_key: &[u8],
        direction: Direction,
        lower: i64,
        upper: i64,
    ) -> Result<TraverseIterator> {
        if start_key.is_empty() {
            return Err(Error::MissingStartKey);
        }
        let range = EpochRange::new(lower, upper)?;
        TraverseIterator::new(
            self.metastore.clone(),
            self.pipeline.clone(),
            start_key,
            direction,
            range,
        )
    }

    /// Close the shard cluster and the metadata store
    ///
    /// Both are closed even if the first fails; the first error is returned.
    pub async fn close(&self) -> Result<()> {
        let cluster = self.cluster().close().await;
        let metastore = self.metastore.close().await;
        cluster.and(metastore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, RngCore};
    use std::time::Duration;
    use zstor_common::{CompressionMode, DistributionConfig, EncryptionConfig, epoch_now};
    use zstor_datastor::MemoryDialer;

    const NAMESPACE: &str = "testns";

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("shard-{i}")).collect()
    }

    fn distributed(k: usize, m: usize, block_size: usize) -> PipelineConfig {
        PipelineConfig {
            block_size,
            distribution: DistributionConfig::new(k, m),
            ..PipelineConfig::default()
        }
    }

    async fn test_client(shards: usize, pipeline: PipelineConfig) -> (Client, Arc<MemoryDialer>) {
        let addrs = addresses(shards);
        let dialer = Arc::new(MemoryDialer::with_servers(&addrs));
        let mut config = ClientConfig::new(NAMESPACE, addrs);
        config.pipeline = pipeline;
        let client = Client::with_dialer(&config, dialer.clone(), Arc::new(MemoryMetaStore::new()))
            .await
            .unwrap();
        (client, dialer)
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    async fn read_all(client: &Client, key: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        client.read(key, &mut buf).await?;
        Ok(buf)
    }

    fn stored_objects(dialer: &MemoryDialer, shards: usize) -> usize {
        addresses(shards)
            .iter()
            .map(|a| dialer.server(a).unwrap().object_count(NAMESPACE))
            .sum()
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let mut pipeline = distributed(3, 1, 1024);
        pipeline.encryption = EncryptionConfig {
            private_key: Some("0123456789abcdef0123456789abcdef".into()),
        };
        let (client, _dialer) = test_client(4, pipeline).await;

        for (i, len) in [0usize, 1, 1000, 1024, 5000].into_iter().enumerate() {
            let key = format!("object-{i}");
            let data = random_bytes(len);
            let metadata = client.write(key.as_bytes(), data.as_slice()).await.unwrap();
            assert_eq!(metadata.chunks.len(), len.div_ceil(1024));
            assert_eq!(metadata.size(), len as i64);
            assert!(metadata.next.is_none() && metadata.previous.is_none());
            assert_eq!(read_all(&client, key.as_bytes()).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_unsplit_object() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 0)).await;
        let data = random_bytes(100_000);
        let metadata = client.write(b"whole", data.as_slice()).await.unwrap();
        assert_eq!(metadata.chunks.len(), 1);
        assert_eq!(read_all(&client, b"whole").await.unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_large_object_survives_one_loss_per_chunk() {
        let (client, dialer) = test_client(4, distributed(3, 1, 64 * 1024)).await;
        let data = random_bytes(10 * 1024 * 1024);

        let metadata = client.write(b"large", data.as_slice()).await.unwrap();
        assert_eq!(metadata.chunks.len(), 160);
        for chunk in &metadata.chunks {
            assert_eq!(chunk.shards.len(), 4);
            let mut distinct = chunk.shards.clone();
            distinct.sort();
            distinct.dedup();
            assert_eq!(distinct.len(), 4);
        }

        let mut rng = rand::thread_rng();
        for chunk in &metadata.chunks {
            let victim = chunk.shards.choose(&mut rng).unwrap();
            assert!(dialer.server(victim).unwrap().remove_object(NAMESPACE, &chunk.key));
        }
        assert_eq!(read_all(&client, b"large").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_too_many_losses_is_unrecoverable() {
        let (client, dialer) = test_client(4, distributed(3, 1, 512)).await;
        let data = random_bytes(2000);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();

        let chunk = &metadata.chunks[1];
        for addr in &chunk.shards[..2] {
            dialer.server(addr).unwrap().remove_object(NAMESPACE, &chunk.key);
        }
        let err = read_all(&client, b"obj").await.unwrap_err();
        assert!(err.is_unrecoverable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_damaged_pieces_are_left_out() {
        let (client, dialer) = test_client(4, distributed(3, 1, 1024)).await;
        let data = random_bytes(3000);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();

        // Same length, wrong bytes
        let first = &metadata.chunks[0];
        let server = dialer.server(&first.shards[0]).unwrap();
        let piece_len = server.object(NAMESPACE, &first.key).unwrap().len();
        server.put_object(NAMESPACE, &first.key, vec![0xAB; piece_len]);

        // Truncated
        let second = &metadata.chunks[1];
        let server = dialer.server(&second.shards[2]).unwrap();
        let piece = server.object(NAMESPACE, &second.key).unwrap();
        server.put_object(NAMESPACE, &second.key, piece[..piece.len() - 64].to_vec());

        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);

        // A second damaged piece in one chunk exceeds the parity
        let server = dialer.server(&first.shards[1]).unwrap();
        server.put_object(NAMESPACE, &first.key, vec![0xCD; piece_len]);
        let err = read_all(&client, b"obj").await.unwrap_err();
        assert!(
            matches!(err, Error::ObjectCorrupted { .. }),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_damaged_replica_is_skipped() {
        let pipeline = PipelineConfig {
            block_size: 256,
            replication_nr: 2,
            ..PipelineConfig::default()
        };
        let (client, dialer) = test_client(3, pipeline).await;
        let data = random_bytes(1000);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();

        for chunk in &metadata.chunks {
            let server = dialer.server(&chunk.shards[0]).unwrap();
            server.put_object(NAMESPACE, &chunk.key, b"garbage".to_vec());
        }
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);

        for chunk in &metadata.chunks {
            let server = dialer.server(&chunk.shards[1]).unwrap();
            server.put_object(NAMESPACE, &chunk.key, b"garbage".to_vec());
        }
        let err = read_all(&client, b"obj").await.unwrap_err();
        assert!(err.is_unrecoverable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_unavailable_shard() {
        let (client, dialer) = test_client(5, distributed(3, 1, 256)).await;
        dialer.server("shard-2").unwrap().set_available(false);

        // Writes route around the unavailable shard
        let data = random_bytes(3000);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();
        assert!(
            metadata
                .chunks
                .iter()
                .all(|c| !c.shards.contains(&"shard-2".to_string()))
        );

        dialer.server("shard-2").unwrap().set_available(true);
        let addr = metadata.chunks[0].shards[0].clone();
        dialer.server(&addr).unwrap().set_available(false);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_from_unlisted_shard() {
        let (client, dialer) = test_client(4, distributed(3, 1, 512)).await;
        let data = random_bytes(1500);
        let mut metadata = client.write(b"obj", data.as_slice()).await.unwrap();

        // Move one piece to a shard the cluster was not configured with
        let extra = dialer.add_server("shard-extra");
        let chunk = &mut metadata.chunks[0];
        let origin = dialer.server(&chunk.shards[0]).unwrap();
        extra.put_object(NAMESPACE, &chunk.key, origin.object(NAMESPACE, &chunk.key).unwrap());
        assert!(origin.remove_object(NAMESPACE, &chunk.key));
        chunk.shards[0] = "shard-extra".to_string();
        client.metastore().set_metadata(&metadata).await.unwrap();

        // Without the moved piece the first chunk cannot be rebuilt
        dialer
            .server(&metadata.chunks[0].shards[1])
            .unwrap()
            .set_available(false);

        let dials = dialer.dial_count();
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
        assert_eq!(dialer.dial_count(), dials + 1);
        assert_eq!(extra.open_connections(), 1);
        assert_eq!(client.cluster().listed_shard_count(), 4);
        assert!(
            client
                .cluster()
                .get_random_shard_iterator(&[])
                .all(|shard| shard.identifier() != "shard-extra")
        );
    }

    #[tokio::test]
    async fn test_write_fails_without_enough_shards() {
        let (client, dialer) = test_client(4, distributed(3, 1, 256)).await;
        dialer.server("shard-0").unwrap().set_available(false);
        let err = client.write(b"obj", &b"data"[..]).await.unwrap_err();
        assert!(
            err.is_network() || matches!(err, Error::InsufficientShards { .. }),
            "unexpected error: {err}"
        );
        assert!(client.get_metadata(b"obj").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_replication() {
        let pipeline = PipelineConfig {
            block_size: 128,
            replication_nr: 2,
            compression: CompressionMode::BestSpeed,
            ..PipelineConfig::default()
        };
        let (client, dialer) = test_client(3, pipeline).await;
        let data = random_bytes(1000);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();
        assert!(metadata.chunks.iter().all(|c| c.shards.len() == 2));

        let first = metadata.chunks[0].shards[0].clone();
        dialer.server(&first).unwrap().set_available(false);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
        assert_eq!(client.check(b"obj", false).await.unwrap(), CheckStatus::Valid);

        let repaired = client.repair(b"obj").await.unwrap();
        assert!(!repaired.chunks[0].shards.contains(&first));
        assert_eq!(client.check(b"obj", false).await.unwrap(), CheckStatus::Optimal);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_check_and_repair() {
        let (client, dialer) = test_client(5, distributed(2, 2, 512)).await;
        let data = random_bytes(1500);
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();
        assert_eq!(client.check(b"obj", false).await.unwrap(), CheckStatus::Optimal);

        let chunk = &metadata.chunks[0];
        let server = dialer.server(&chunk.shards[0]).unwrap();
        assert!(server.corrupt_object(NAMESPACE, &chunk.key));
        assert_eq!(client.check(b"obj", true).await.unwrap(), CheckStatus::Valid);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);

        let repaired = client.repair(b"obj").await.unwrap();
        assert_eq!(repaired.chunks.len(), metadata.chunks.len());
        assert_eq!(client.check(b"obj", false).await.unwrap(), CheckStatus::Optimal);
        assert_eq!(client.get_metadata(b"obj").await.unwrap(), repaired);
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);

        // An optimal object is left as is
        assert_eq!(client.repair(b"obj").await.unwrap(), repaired);
    }

    #[tokio::test]
    async fn test_invalid_object_cannot_be_repaired() {
        let (client, dialer) = test_client(4, distributed(3, 1, 512)).await;
        let metadata = client.write(b"obj", random_bytes(1000).as_slice()).await.unwrap();

        let chunk = &metadata.chunks[0];
        for addr in &chunk.shards[1..3] {
            dialer.server(addr).unwrap().remove_object(NAMESPACE, &chunk.key);
        }
        assert_eq!(client.check(b"obj", true).await.unwrap(), CheckStatus::Invalid);
        assert_eq!(client.check(b"obj", false).await.unwrap(), CheckStatus::Invalid);
        assert!(client.repair(b"obj").await.unwrap_err().is_unrecoverable());
    }

    #[tokio::test]
    async fn test_delete() {
        let (client, dialer) = test_client(3, distributed(2, 1, 256)).await;
        client.write(b"obj", random_bytes(1000).as_slice()).await.unwrap();
        assert_eq!(stored_objects(&dialer, 3), 4 * 3);

        client.delete(b"obj").await.unwrap();
        assert_eq!(stored_objects(&dialer, 3), 0);
        assert!(read_all(&client, b"obj").await.unwrap_err().is_not_found());
        assert!(client.delete(b"obj").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_write_linked_validation() {
        let (client, dialer) = test_client(2, distributed(1, 1, 256)).await;
        let reader = || Some(&b"data"[..]);

        let errors = [
            client.write_linked(b"", b"bar", reader()).await.unwrap_err(),
            client.write_linked(b"foo", b"", reader()).await.unwrap_err(),
            client.write_linked(b"", b"", reader()).await.unwrap_err(),
            client.write_linked(b"foo", b"bar", None::<&[u8]>).await.unwrap_err(),
        ];
        assert!(matches!(errors[0], Error::MissingKey));
        assert!(matches!(errors[1], Error::MissingPrevKey));
        assert!(matches!(errors[2], Error::MissingKeys));
        assert!(matches!(errors[3], Error::MissingReader));
        for (i, a) in errors.iter().enumerate() {
            assert!(a.is_validation());
            for b in &errors[i + 1..] {
                assert_ne!(a.to_string(), b.to_string());
            }
        }
        assert_eq!(stored_objects(&dialer, 2), 0);

        assert!(matches!(
            client.write(b"", &b"data"[..]).await,
            Err(Error::MissingKey)
        ));
    }

    #[tokio::test]
    async fn test_write_linked_links_both_ways() {
        let (client, dialer) = test_client(2, distributed(1, 1, 256)).await;
        client.write(b"first", &b"one"[..]).await.unwrap();
        let second = client
            .write_linked(b"second", b"first", Some(&b"two"[..]))
            .await
            .unwrap();
        assert_eq!(second.previous.as_deref(), Some(&b"first"[..]));
        let first = client.get_metadata(b"first").await.unwrap();
        assert_eq!(first.next.as_deref(), Some(&b"second"[..]));

        // Missing predecessor is detected before any data is stored
        let before = stored_objects(&dialer, 2);
        let err = client
            .write_linked(b"third", b"missing", Some(&b"three"[..]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(stored_objects(&dialer, 2), before);

        assert!(matches!(
            client.write_linked(b"first", b"first", Some(&b"x"[..])).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.write_linked(b"other", b"first", Some(&b"x"[..])).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    async fn write_chain(client: &Client, n: usize) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let keys: Vec<Vec<u8>> = (0..n).map(|i| format!("key#{i}").into_bytes()).collect();
        let values: Vec<Vec<u8>> = (0..n).map(|_| random_bytes(1024)).collect();
        for (i, key) in keys.iter().enumerate() {
            if i == 0 {
                client.write(key, values[i].as_slice()).await.unwrap();
            } else {
                client
                    .write_linked(key, &keys[i - 1], Some(values[i].as_slice()))
                    .await
                    .unwrap();
            }
        }
        (keys, values)
    }

    async fn walk_chain(forward: bool) {
        const N: usize = 100;
        let (client, _dialer) = test_client(3, distributed(2, 1, 256)).await;

        let start_epoch = epoch_now();
        let (keys, values) = write_chain(&client, N).await;
        let end_epoch = epoch_now();

        let ranges = [
            (start_epoch, end_epoch),
            (0, end_epoch),
            (start_epoch, 0),
            (0, 0),
            (0, -1),
            (-1, 0),
            (-1, -1),
        ];
        for (start, end) in ranges {
            let mut it = if forward {
                client.traverse(&keys[0], start, end).unwrap()
            } else {
                client.traverse_post_order(&keys[N - 1], end, start).unwrap()
            };

            assert!(matches!(it.get_metadata(), Err(Error::NotPositioned)));
            let mut buf = Vec::new();
            assert!(matches!(
                it.read_data(&mut buf).await,
                Err(Error::NotPositioned)
            ));

            let mut i = 0;
            let mut last: Option<(Metadata, Vec<u8>)> = None;
            while it.next().await.unwrap() {
                let idx = if forward { i } else { N - i - 1 };
                if i < N - 1 {
                    let idy = if forward { idx + 1 } else { idx - 1 };
                    assert_eq!(it.peek_next_key(), Some(keys[idy].as_slice()));
                } else {
                    assert!(it.peek_next_key().is_none());
                }

                let md = it.get_metadata().unwrap().clone();
                assert_eq!(md.key, keys[idx]);

                let mut buf = Vec::new();
                it.read_data(&mut buf).await.unwrap();
                assert_eq!(buf, values[idx]);

                i += 1;
                if i == N {
                    last = Some((md, buf));
                }
            }
            assert_eq!(i, N);

            // Exhausted, but the last element stays readable
            assert!(!it.next().await.unwrap());
            assert!(it.peek_next_key().is_none());
            let (last_md, last_data) = last.unwrap();
            for _ in 0..2 {
                assert_eq!(it.get_metadata().unwrap(), &last_md);
                let mut buf = Vec::new();
                it.read_data(&mut buf).await.unwrap();
                assert_eq!(buf, last_data);
            }
        }
    }

    #[tokio::test]
    async fn test_traverse_forward() {
        walk_chain(true).await;
    }

    #[tokio::test]
    async fn test_traverse_post_order() {
        walk_chain(false).await;
    }

    #[tokio::test]
    async fn test_traverse_validation() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 256)).await;
        assert!(matches!(
            client.traverse(b"", 0, 0),
            Err(Error::MissingStartKey)
        ));
        assert!(matches!(
            client.traverse(b"k", 20, 10),
            Err(Error::InvalidEpochRange { .. })
        ));
        assert!(matches!(
            client.traverse_post_order(b"k", 10, 20),
            Err(Error::InvalidEpochRange { .. })
        ));
        assert!(client.traverse_post_order(b"k", 20, 10).is_ok());

        let it = client.traverse(b"k", 0, 0).unwrap();
        assert_eq!(it.peek_next_key(), Some(&b"k"[..]));
    }

    #[tokio::test]
    async fn test_traverse_epoch_window() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 256)).await;
        let mut epochs = Vec::new();
        let mut prev: Option<&[u8]> = None;
        let keys: [&[u8]; 3] = [b"a", b"b", b"c"];
        for key in keys {
            let md = match prev {
                None => client.write(key, &b"x"[..]).await.unwrap(),
                Some(p) => client.write_linked(key, p, Some(&b"x"[..])).await.unwrap(),
            };
            epochs.push(md.epoch);
            prev = Some(key);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(epochs[0] < epochs[1] && epochs[1] < epochs[2]);

        let mut it = client.traverse(b"a", epochs[1], epochs[1]).unwrap();
        assert!(it.next().await.unwrap());
        assert_eq!(it.get_metadata().unwrap().key, b"b");
        assert!(!it.next().await.unwrap());

        let mut it = client.traverse_post_order(b"c", epochs[1], epochs[1]).unwrap();
        assert!(it.next().await.unwrap());
        assert_eq!(it.get_metadata().unwrap().key, b"b");
        assert!(!it.next().await.unwrap());
        assert_eq!(it.get_metadata().unwrap().key, b"b");
    }

    #[tokio::test]
    async fn test_traverse_broken_link() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 256)).await;
        let (keys, _values) = write_chain(&client, 3).await;
        client.metastore().delete_metadata(&keys[1]).await.unwrap();

        let mut it = client.traverse(&keys[0], 0, 0).unwrap();
        assert!(it.next().await.unwrap());
        assert!(it.next().await.unwrap_err().is_not_found());
        assert!(!it.next().await.unwrap());
        assert_eq!(it.get_metadata().unwrap().key, keys[0]);
    }

    #[tokio::test]
    async fn test_existing_key_is_not_replaced() {
        let (client, dialer) = test_client(2, distributed(1, 1, 256)).await;
        client.write(b"a", &b"one"[..]).await.unwrap();
        client.write_linked(b"b", b"a", Some(&b"two"[..])).await.unwrap();
        let before = stored_objects(&dialer, 2);

        assert!(matches!(
            client.write(b"a", &b"three"[..]).await,
            Err(Error::MetadataExists { .. })
        ));
        assert!(matches!(
            client.write_linked(b"a", b"b", Some(&b"three"[..])).await,
            Err(Error::MetadataExists { .. })
        ));
        assert_eq!(stored_objects(&dialer, 2), before);

        let a = client.get_metadata(b"a").await.unwrap();
        assert_eq!(a.next.as_deref(), Some(&b"b"[..]));
        assert!(a.previous.is_none());
        assert!(client.get_metadata(b"b").await.unwrap().next.is_none());
        assert_eq!(read_all(&client, b"a").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_traverse_stops_at_link_cycle() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 256)).await;
        let (keys, _values) = write_chain(&client, 2).await;

        let mut first = client.get_metadata(&keys[0]).await.unwrap();
        first.previous = Some(keys[1].clone());
        client.metastore().set_metadata(&first).await.unwrap();
        let mut last = client.get_metadata(&keys[1]).await.unwrap();
        last.next = Some(keys[0].clone());
        client.metastore().set_metadata(&last).await.unwrap();

        // Every record is newer than the window, so all of them are skipped
        let mut it = client.traverse_post_order(&keys[1], 1, 0).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), it.next())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::LinkCycle { .. })));
        assert!(!it.next().await.unwrap());
        assert!(matches!(it.get_metadata(), Err(Error::NotPositioned)));

        let mut it = client.traverse(&keys[0], 0, 0).unwrap();
        assert!(it.next().await.unwrap());
        assert!(it.next().await.unwrap());
        assert!(matches!(it.next().await, Err(Error::LinkCycle { .. })));
        assert!(!it.next().await.unwrap());
        assert_eq!(it.get_metadata().unwrap().key, keys[1]);
    }

    #[tokio::test]
    async fn test_read_metadata_of_traversed_record() {
        let (client, _dialer) = test_client(2, distributed(1, 1, 0)).await;
        let data = random_bytes(rand::thread_rng().gen_range(1..4096));
        let metadata = client.write(b"obj", data.as_slice()).await.unwrap();
        let mut buf = Vec::new();
        client.read_metadata(&metadata, &mut buf).await.unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_cancelled_write() {
        let (client, _dialer) = test_client(3, distributed(2, 1, 256)).await;
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let result =
            crate::run_cancellable(&token, client.write(b"obj", random_bytes(4096).as_slice()))
                .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(client.get_metadata(b"obj").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let addrs = addresses(3);
        let dialer = Arc::new(MemoryDialer::with_servers(&addrs));
        let mut config = ClientConfig::new(NAMESPACE, addrs);
        config.pipeline = distributed(2, 1, 256);
        let data = random_bytes(1000);

        {
            let metastore = Arc::new(RedbMetaStore::open(&path, Duration::from_secs(5)).unwrap());
            let client = Client::with_dialer(&config, dialer.clone(), metastore)
                .await
                .unwrap();
            client.write(b"obj", data.as_slice()).await.unwrap();
            client.close().await.unwrap();
        }

        let metastore = Arc::new(RedbMetaStore::open(&path, Duration::from_secs(5)).unwrap());
        let client = Client::with_dialer(&config, dialer, metastore)
            .await
            .unwrap();
        assert_eq!(read_all(&client, b"obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_close() {
        let (client, dialer) = test_client(3, distributed(2, 1, 256)).await;
        client.cluster().get_shard("shard-1").await.unwrap();
        client.close().await.unwrap();
        for addr in addresses(3) {
            assert_eq!(dialer.server(&addr).unwrap().open_connections(), 0);
        }
    }

    #[tokio::test]
    async fn test_from_config_unreachable_shard() {
        let mut config = ClientConfig::new(NAMESPACE, vec!["127.0.0.1:1".to_string()]);
        assert!(matches!(
            Client::from_config(&config, None).await,
            Err(e) if e.is_network()
        ));

        config.namespace.clear();
        assert!(matches!(
            Client::from_config(&config, None).await,
            Err(Error::NoLabel)
        ));
    }
}
