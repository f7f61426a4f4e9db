//! Redundancy policies: erasure distribution or replication
//!
//! Distribution frames the processed block with its length (8 bytes, little
//! endian) before erasure coding, since pieces are padded to the codec's
//! alignment.
//!
//! Shards may hand back damaged pieces without reporting an error. Pieces
//! whose length differs from the majority are dropped, and
//! [`Redundancy::gather_verified`] leaves out growing sets of pieces until
//! the rebuilt block passes the caller's check.

use zstor_common::{Error, PipelineConfig, Result};
use zstor_erasure::ErasureCodec;

const LEN_PREFIX: usize = 8;

/// Upper bound on rebuilds tried for one chunk
const MAX_REBUILD_ATTEMPTS: usize = 256;

/// How the pieces of a chunk are derived from its processed block
#[derive(Clone)]
pub enum Redundancy {
    /// `k` data pieces and `m` parity pieces, any `k` suffice
    Distribution(ErasureCodec),
    /// `n` identical copies, any one suffices
    Replication(usize),
}

impl Redundancy {
    /// Build the configured policy
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        if config.distribution.enabled() {
            let codec = ErasureCodec::new(
                config.distribution.data_shard_count,
                config.distribution.parity_shard_count,
            )?;
            Ok(Self::Distribution(codec))
        } else if config.replication_nr == 0 {
            Err(Error::configuration("replication_nr must be > 0"))
        } else {
            Ok(Self::Replication(config.replication_nr))
        }
    }

    /// Total number of pieces stored per chunk
    #[must_use]
    pub fn piece_count(&self) -> usize {
        match self {
            Self::Distribution(codec) => codec.total_shards(),
            Self::Replication(n) => *n,
        }
    }

    /// Minimum number of pieces needed to rebuild a chunk
    #[must_use]
    pub fn required_pieces(&self) -> usize {
        match self {
            Self::Distribution(codec) => codec.data_shards(),
            Self::Replication(_) => 1,
        }
    }

    /// Split a processed block into pieces
    pub fn spread(&self, processed: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self {
            Self::Distribution(codec) => {
                let mut frame = Vec::with_capacity(LEN_PREFIX + processed.len());
                frame.extend_from_slice(&(processed.len() as u64).to_le_bytes());
                frame.extend_from_slice(processed);
                Ok(codec.encode(&frame)?)
            }
            Self::Replication(n) => Ok(vec![processed.to_vec(); *n]),
        }
    }

    /// Rebuild a processed block from the available pieces
    ///
    /// `pieces` is in storage order with `None` for unavailable pieces.
    pub fn gather(&self, mut pieces: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>> {
        match self {
            Self::Distribution(codec) => {
                let piece_len = drop_odd_sized(&mut pieces);
                let frame = codec.decode(&mut pieces, piece_len * codec.data_shards())?;
                let (prefix, body) = frame
                    .split_first_chunk::<LEN_PREFIX>()
                    .ok_or_else(|| Error::ErasureCoding("decoded frame too short".into()))?;
                let len = usize::try_from(u64::from_le_bytes(*prefix))
                    .map_err(|_| Error::ErasureCoding("invalid frame length".into()))?;
                body.get(..len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::ErasureCoding("frame length exceeds data".into()))
            }
            Self::Replication(_) => pieces
                .into_iter()
                .flatten()
                .next()
                .ok_or(Error::InsufficientShards {
                    available: 0,
                    required: 1,
                }),
        }
    }

    /// Rebuild a processed block that `verify` accepts
    ///
    /// The block rebuilt from every available piece is tried first. When it
    /// is rejected, sets of one, two, ... pieces are left out for as long as
    /// enough pieces remain. Returns `None` when no rebuild is accepted.
    pub fn gather_verified<F>(
        &self,
        mut pieces: Vec<Option<Vec<u8>>>,
        verify: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: Fn(&[u8]) -> bool,
    {
        if let Self::Replication(_) = self {
            return Ok(pieces.into_iter().flatten().find(|p| verify(p)));
        }

        drop_odd_sized(&mut pieces);
        let present: Vec<usize> = (0..pieces.len()).filter(|&i| pieces[i].is_some()).collect();
        let required = self.required_pieces();
        if present.len() < required {
            return Err(Error::InsufficientShards {
                available: present.len(),
                required,
            });
        }

        let mut found = None;
        let mut attempts = 0;
        for left_out in 0..=present.len() - required {
            let stop = visit_subsets(&present, left_out, &mut |excluded: &[usize]| {
                attempts += 1;
                let mut candidate = pieces.clone();
                for &i in excluded {
                    candidate[i] = None;
                }
                // A damaged piece may also break the frame itself
                if let Ok(block) = self.gather(candidate) {
                    if verify(&block) {
                        found = Some(block);
                        return true;
                    }
                }
                attempts >= MAX_REBUILD_ATTEMPTS
            });
            if stop {
                break;
            }
        }
        Ok(found)
    }
}

/// Drop every piece whose length differs from the most common one
///
/// Returns the common length, 0 when no piece is present.
fn drop_odd_sized(pieces: &mut [Option<Vec<u8>>]) -> usize {
    let lengths: Vec<usize> = pieces.iter().flatten().map(Vec::len).collect();
    let common = lengths
        .iter()
        .copied()
        .max_by_key(|len| lengths.iter().filter(|l| *l == len).count())
        .unwrap_or_default();
    for piece in pieces.iter_mut() {
        if piece.as_ref().is_some_and(|p| p.len() != common) {
            *piece = None;
        }
    }
    common
}

/// Call `visit` with every `size` element subset of `items`, in
/// lexicographic order, until it returns true
///
/// Returns whether `visit` asked to stop.
fn visit_subsets<F>(items: &[usize], size: usize, visit: &mut F) -> bool
where
    F: FnMut(&[usize]) -> bool,
{
    let n = items.len();
    if size > n {
        return false;
    }
    let mut positions: Vec<usize> = (0..size).collect();
    let mut subset = Vec::with_capacity(size);
    loop {
        subset.clear();
        subset.extend(positions.iter().map(|&p| items[p]));
        if visit(&subset) {
            return true;
        }

        // Advance the rightmost position that can still move
        let Some(i) = (0..size).rev().find(|&i| positions[i] < i + n - size) else {
            return false;
        };
        positions[i] += 1;
        for j in i + 1..size {
            positions[j] = positions[j - 1] + 1;
        }
    }
}
