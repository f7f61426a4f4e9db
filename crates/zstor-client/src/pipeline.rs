//! Data pipeline
//!
//! Write path per chunk: compress, encrypt, spread into pieces, store one
//! piece per distinct listed shard. Read path per chunk: fetch pieces from
//! the shards recorded in the chunk, rebuild, verify the chunk key, decrypt
//! and decompress.
//!
//! Chunks of one object are processed concurrently but always emitted in
//! stream order. CPU-bound stages run on the blocking pool.

use crate::processing::{Processor, chunk_key};
use crate::redundancy::Redundancy;
use futures::future::{join_all, try_join_all};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use zstor_common::{
    CheckStatus, Chunk, Error, Metadata, ObjectStatus, PipelineConfig, Result, display_key,
};
use zstor_datastor::{Cluster, ShardIterator};

/// CPU-bound stages shared with blocking tasks
struct Stages {
    processor: Processor,
    redundancy: Redundancy,
}

impl Stages {
    /// Process and spread one block, returning its key and pieces
    fn encode(
        &self,
        object_key: &[u8],
        index: usize,
        block: &[u8],
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let processed = self.processor.process(block)?;
        let key = chunk_key(object_key, index, &processed);
        let pieces = self.redundancy.spread(&processed)?;
        Ok((key, pieces))
    }

    /// Rebuild the processed block of a chunk that matches the chunk key
    ///
    /// Damaged pieces are left out as long as enough remain.
    fn rebuild(
        &self,
        object_key: &[u8],
        index: usize,
        chunk: &Chunk,
        pieces: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let verify = |processed: &[u8]| chunk_key(object_key, index, processed) == chunk.key;
        match self.redundancy.gather_verified(pieces, verify) {
            Ok(Some(processed)) => Ok(processed),
            Ok(None) => Err(Error::ObjectCorrupted {
                key: display_key(&chunk.key),
            }),
            Err(Error::InsufficientShards {
                available,
                required,
            }) => Err(Error::Unrecoverable {
                key: display_key(&chunk.key),
                available,
                required,
            }),
            Err(e) => Err(e),
        }
    }

    fn decode(
        &self,
        object_key: &[u8],
        index: usize,
        chunk: &Chunk,
        pieces: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let processed = self.rebuild(object_key, index, chunk, pieces)?;
        let block = self.processor.unprocess(&processed)?;
        if i64::try_from(block.len()).ok() != Some(chunk.size) {
            return Err(Error::ObjectCorrupted {
                key: display_key(&chunk.key),
            });
        }
        Ok(block)
    }
}

/// Moves object data between byte streams and the shard cluster
pub struct Pipeline {
    cluster: Arc<Cluster>,
    stages: Arc<Stages>,
    block_size: usize,
    max_concurrent_chunks: usize,
}

impl Pipeline {
    /// Create a pipeline storing into `cluster`
    pub fn new(config: &PipelineConfig, cluster: Arc<Cluster>) -> Result<Self> {
        config.validate(cluster.listed_shard_count())?;
        Ok(Self {
            cluster,
            stages: Arc::new(Stages {
                processor: Processor::new(config)?,
                redundancy: Redundancy::new(config)?,
            }),
            block_size: config.block_size,
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
        })
    }

    /// Cluster the pipeline stores into
    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Split `reader` into chunks and store them, returning the chunks in
    /// stream order
    ///
    /// Pieces stored before a failure are left in place.
    pub async fn write<R>(&self, key: &[u8], reader: R) -> Result<Vec<Chunk>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let block_size = self.block_size;
        let blocks = stream::try_unfold((reader, 0usize, false), move |(reader, index, done)| {
            next_block(reader, index, done, block_size)
        });

        let chunks: Vec<Chunk> = blocks
            .map_ok(|(index, block)| self.write_chunk(key, index, block))
            .try_buffered(self.max_concurrent_chunks)
            .try_collect()
            .await?;

        debug!(
            "Stored object {} as {} chunks",
            display_key(key),
            chunks.len()
        );
        Ok(chunks)
    }

    async fn write_chunk(&self, key: &[u8], index: usize, block: Vec<u8>) -> Result<Chunk> {
        let size = i64::try_from(block.len())
            .map_err(|_| Error::internal("block size exceeds i64"))?;
        let stages = self.stages.clone();
        let object_key = key.to_vec();
        let (chunk_key, pieces) =
            tokio::task::spawn_blocking(move || stages.encode(&object_key, index, &block))
                .await
                .map_err(|e| Error::internal(format!("chunk encoding task failed: {e}")))??;

        let shards = self.store_pieces(&chunk_key, pieces, &[]).await?;
        Ok(Chunk::new(size, chunk_key, shards))
    }

    /// Store each piece on a distinct listed shard outside `except`
    ///
    /// A shard refusing its piece is replaced by the next shard of the random
    /// iterator. Returns the shard addresses in piece order.
    async fn store_pieces(
        &self,
        chunk_key: &[u8],
        pieces: Vec<Vec<u8>>,
        except: &[String],
    ) -> Result<Vec<String>> {
        let shards = self.cluster.get_random_shard_iterator(except);
        if shards.len() < pieces.len() {
            return Err(Error::InsufficientShards {
                available: shards.len(),
                required: pieces.len(),
            });
        }
        let shards = Mutex::new(shards);

        try_join_all(
            pieces
                .iter()
                .map(|piece| store_piece(&shards, chunk_key, piece)),
        )
        .await
    }

    /// Write the object described by `metadata` to `writer`
    pub async fn read<W>(&self, metadata: &Metadata, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut blocks = std::pin::pin!(
            stream::iter(metadata.chunks.iter().enumerate())
                .map(|(index, chunk)| self.read_chunk(&metadata.key, index, chunk))
                .buffered(self.max_concurrent_chunks)
        );

        while let Some(block) = blocks.try_next().await? {
            writer.write_all(&block).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn read_chunk(&self, key: &[u8], index: usize, chunk: &Chunk) -> Result<Vec<u8>> {
        self.check_layout(chunk)?;
        if let Redundancy::Replication(_) = self.stages.redundancy {
            return self.read_replicated_chunk(key, index, chunk).await;
        }
        let pieces = self.fetch_pieces(chunk).await?;
        self.decode_chunk(key, index, chunk, pieces).await
    }

    /// Try the replicas of a chunk in order until one decodes
    async fn read_replicated_chunk(
        &self,
        key: &[u8],
        index: usize,
        chunk: &Chunk,
    ) -> Result<Vec<u8>> {
        for (i, addr) in chunk.shards.iter().enumerate() {
            let Some(piece) = self.fetch_piece(addr, &chunk.key).await else {
                continue;
            };
            let mut pieces = vec![None; chunk.shards.len()];
            pieces[i] = Some(piece);
            match self.decode_chunk(key, index, chunk, pieces).await {
                Err(Error::ObjectCorrupted { .. }) => {
                    warn!(
                        "Replica of chunk {} on shard {} is corrupted",
                        display_key(&chunk.key),
                        addr
                    );
                }
                result => return result,
            }
        }
        error!(
            "Chunk {} is unrecoverable: no intact replica",
            display_key(&chunk.key)
        );
        Err(Error::Unrecoverable {
            key: display_key(&chunk.key),
            available: 0,
            required: 1,
        })
    }

    async fn decode_chunk(
        &self,
        key: &[u8],
        index: usize,
        chunk: &Chunk,
        pieces: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let stages = self.stages.clone();
        let object_key = key.to_vec();
        let chunk = chunk.clone();
        tokio::task::spawn_blocking(move || stages.decode(&object_key, index, &chunk, pieces))
            .await
            .map_err(|e| Error::internal(format!("chunk decoding task failed: {e}")))?
    }

    /// Fetch every piece of a chunk, `None` for pieces that could not be read
    ///
    /// Fails as unrecoverable when fewer pieces than required are available.
    async fn fetch_pieces(&self, chunk: &Chunk) -> Result<Vec<Option<Vec<u8>>>> {
        let pieces =
            join_all(chunk.shards.iter().map(|addr| self.fetch_piece(addr, &chunk.key))).await;

        let available = pieces.iter().filter(|p| p.is_some()).count();
        let required = self.stages.redundancy.required_pieces();
        if available < required {
            error!(
                "Chunk {} is unrecoverable: {} of {} required pieces available",
                display_key(&chunk.key),
                available,
                required
            );
            return Err(Error::Unrecoverable {
                key: display_key(&chunk.key),
                available,
                required,
            });
        }
        Ok(pieces)
    }

    async fn fetch_piece(&self, address: &str, chunk_key: &[u8]) -> Option<Vec<u8>> {
        let result = match self.cluster.get_shard(address).await {
            Ok(shard) => shard.get_object(chunk_key).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(piece) => Some(piece),
            Err(e) => {
                warn!(
                    "Failed to read piece of chunk {} from shard {}: {}",
                    display_key(chunk_key),
                    address,
                    e
                );
                None
            }
        }
    }

    fn check_layout(&self, chunk: &Chunk) -> Result<()> {
        let expected = self.stages.redundancy.piece_count();
        let valid = match self.stages.redundancy {
            Redundancy::Distribution(_) => chunk.shards.len() == expected,
            Redundancy::Replication(_) => !chunk.shards.is_empty(),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "chunk {} lists {} shards, expected {}",
                display_key(&chunk.key),
                chunk.shards.len(),
                expected
            )))
        }
    }

    /// Health of every piece of a chunk, in storage order
    async fn piece_statuses(&self, chunk: &Chunk) -> Vec<ObjectStatus> {
        join_all(chunk.shards.iter().map(|addr| async move {
            let status = match self.cluster.get_shard(addr).await {
                Ok(shard) => shard.get_object_status(&chunk.key).await,
                Err(e) => Err(e),
            };
            status.unwrap_or_else(|e| {
                warn!("Failed to check piece on shard {}: {}", addr, e);
                ObjectStatus::Missing
            })
        }))
        .await
    }

    /// Classify a chunk by how many of its pieces are intact
    pub async fn check_chunk(&self, chunk: &Chunk) -> Result<CheckStatus> {
        self.check_layout(chunk)?;
        let statuses = self.piece_statuses(chunk).await;
        let ok = statuses.iter().filter(|s| **s == ObjectStatus::Ok).count();

        Ok(if ok == statuses.len() {
            CheckStatus::Optimal
        } else if ok >= self.stages.redundancy.required_pieces() {
            CheckStatus::Valid
        } else {
            CheckStatus::Invalid
        })
    }

    /// Classify an object by its worst chunk
    ///
    /// In fast mode the check stops at the first invalid chunk.
    pub async fn check(&self, metadata: &Metadata, fast: bool) -> Result<CheckStatus> {
        let mut result = CheckStatus::Optimal;
        for chunk in &metadata.chunks {
            let status = self.check_chunk(chunk).await?;
            if status != CheckStatus::Optimal {
                debug!(
                    "Chunk {} of object {} is {}",
                    display_key(&chunk.key),
                    display_key(&metadata.key),
                    status
                );
            }
            result = result.min(status);
            if fast && result == CheckStatus::Invalid {
                break;
            }
        }
        Ok(result)
    }

    /// Restore every missing or corrupted piece of an object
    ///
    /// Returns the metadata with updated shard lists; the caller persists it.
    pub async fn repair(&self, metadata: &Metadata) -> Result<Metadata> {
        let mut repaired = metadata.clone();
        for (index, chunk) in repaired.chunks.iter_mut().enumerate() {
            self.repair_chunk(&metadata.key, index, chunk).await?;
        }
        Ok(repaired)
    }

    async fn repair_chunk(&self, key: &[u8], index: usize, chunk: &mut Chunk) -> Result<()> {
        self.check_layout(chunk)?;
        let statuses = self.piece_statuses(chunk).await;
        let broken: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ObjectStatus::Ok)
            .map(|(i, _)| i)
            .collect();
        if broken.is_empty() {
            return Ok(());
        }

        let required = self.stages.redundancy.required_pieces();
        let intact = statuses.len() - broken.len();
        if intact < required {
            return Err(Error::Unrecoverable {
                key: display_key(&chunk.key),
                available: intact,
                required,
            });
        }

        // Rebuild from intact pieces only, then recompute the full piece set
        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; chunk.shards.len()];
        for (i, addr) in chunk.shards.iter().enumerate() {
            if statuses[i] == ObjectStatus::Ok {
                pieces[i] = self.fetch_piece(addr, &chunk.key).await;
            }
        }
        let stages = self.stages.clone();
        let object_key = key.to_vec();
        let snapshot = chunk.clone();
        let lost = broken.clone();
        let missing = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>> {
            let processed = stages.rebuild(&object_key, index, &snapshot, pieces)?;
            match &stages.redundancy {
                Redundancy::Distribution(_) => {
                    let fresh = stages.redundancy.spread(&processed)?;
                    lost.iter()
                        .map(|&i| {
                            fresh.get(i).cloned().ok_or_else(|| {
                                Error::internal(format!("piece {i} out of range"))
                            })
                        })
                        .collect()
                }
                Redundancy::Replication(_) => Ok(vec![processed; lost.len()]),
            }
        })
        .await
        .map_err(|e| Error::internal(format!("chunk repair task failed: {e}")))??;

        let keep: Vec<String> = chunk
            .shards
            .iter()
            .zip(&statuses)
            .filter(|(_, s)| **s == ObjectStatus::Ok)
            .map(|(addr, _)| addr.clone())
            .collect();
        let addresses = self.store_pieces(&chunk.key, missing, &keep).await?;
        for (&i, addr) in broken.iter().zip(addresses) {
            chunk.shards[i] = addr;
        }

        info!(
            "Repaired {} pieces of chunk {}",
            broken.len(),
            display_key(&chunk.key)
        );
        Ok(())
    }

    /// Remove every piece of every chunk of an object
    ///
    /// All pieces are attempted; the first failure is returned.
    pub async fn delete(&self, metadata: &Metadata) -> Result<()> {
        let deletions = metadata.chunks.iter().flat_map(|chunk| {
            chunk.shards.iter().map(move |addr| async move {
                let shard = self.cluster.get_shard(addr).await?;
                shard.delete_object(&chunk.key).await.inspect_err(|e| {
                    warn!(
                        "Failed to delete piece of chunk {} on shard {}: {}",
                        display_key(&chunk.key),
                        addr,
                        e
                    );
                })
            })
        });
        join_all(deletions).await.into_iter().collect()
    }
}

/// Store one piece on the next shard that accepts it
async fn store_piece(
    shards: &Mutex<ShardIterator>,
    chunk_key: &[u8],
    piece: &[u8],
) -> Result<String> {
    let mut last_error = None;
    loop {
        let next = shards.lock().next();
        let Some(shard) = next else {
            return Err(last_error.unwrap_or(Error::InsufficientShards {
                available: 0,
                required: 1,
            }));
        };
        match shard.set_object(chunk_key, piece).await {
            Ok(_) => return Ok(shard.identifier().to_string()),
            Err(e) => {
                warn!(
                    "Failed to store piece of chunk {} on shard {}: {}",
                    display_key(chunk_key),
                    shard.identifier(),
                    e
                );
                last_error = Some(e);
            }
        }
    }
}

type BlockState<R> = ((usize, Vec<u8>), (R, usize, bool));

/// Read the next block of a stream, tagged with its index
async fn next_block<R>(
    mut reader: R,
    index: usize,
    done: bool,
    block_size: usize,
) -> Result<Option<BlockState<R>>>
where
    R: AsyncRead + Unpin,
{
    if done {
        return Ok(None);
    }
    let block = read_block(&mut reader, block_size).await?;
    if block.is_empty() {
        return Ok(None);
    }
    let last = block_size == 0 || block.len() < block_size;
    Ok(Some(((index, block), (reader, index + 1, last))))
}

/// Read up to `size` bytes, or everything when `size` is 0
async fn read_block<R>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut block = Vec::new();
    if size == 0 {
        reader.read_to_end(&mut block).await?;
    } else {
        block.reserve(size);
        reader.take(size as u64).read_to_end(&mut block).await?;
    }
    Ok(block)
}
