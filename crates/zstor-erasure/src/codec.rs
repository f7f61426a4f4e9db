//! Reed-Solomon codec
//!
//! [`ErasureCodec`] pads a block into `k` equal data pieces and computes `m`
//! parity pieces with `reed-solomon-simd`. Any `k` surviving pieces join
//! back into the block.

use thiserror::Error;
use zstor_common::Error as CommonError;

/// Pieces are padded to a multiple of this size
const PIECE_ALIGN: usize = 64;

/// Upper bound on `k + m`
const MAX_PIECES: usize = 255;

/// Errors specific to erasure coding
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid erasure layout: {0}")]
    InvalidLayout(String),

    #[error("reed-solomon failure: {0}")]
    Codec(#[from] reed_solomon_simd::Error),

    #[error("insufficient pieces: have {available}, need {required}")]
    InsufficientPieces { available: usize, required: usize },

    #[error("pieces differ in size")]
    PieceSizeMismatch,
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientPieces {
                available,
                required,
            } => Self::InsufficientShards {
                available,
                required,
            },
            ErasureError::InvalidLayout(msg) => Self::Configuration(msg),
            other => Self::ErasureCoding(other.to_string()),
        }
    }
}

/// `k` data plus `m` parity pieces per block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErasureCodec {
    data_pieces: usize,
    parity_pieces: usize,
}

impl ErasureCodec {
    /// Create a codec producing `data_pieces` data and `parity_pieces` parity pieces
    pub fn new(data_pieces: usize, parity_pieces: usize) -> Result<Self, ErasureError> {
        if data_pieces == 0 || parity_pieces == 0 {
            return Err(ErasureError::InvalidLayout(format!(
                "need at least one data and one parity piece, got {data_pieces}+{parity_pieces}"
            )));
        }
        if data_pieces + parity_pieces > MAX_PIECES {
            return Err(ErasureError::InvalidLayout(format!(
                "at most {MAX_PIECES} pieces per block, got {}",
                data_pieces + parity_pieces
            )));
        }
        Ok(Self {
            data_pieces,
            parity_pieces,
        })
    }

    /// Number of data pieces (k)
    #[must_use]
    pub const fn data_shards(&self) -> usize {
        self.data_pieces
    }

    /// Number of parity pieces (m)
    #[must_use]
    pub const fn parity_shards(&self) -> usize {
        self.parity_pieces
    }

    /// Number of pieces per block (k + m)
    #[must_use]
    pub const fn total_shards(&self) -> usize {
        self.data_pieces + self.parity_pieces
    }

    /// Size of each piece produced for a block of `len` bytes
    #[must_use]
    pub const fn shard_size(&self, len: usize) -> usize {
        let size = len.div_ceil(self.data_pieces);
        if size < PIECE_ALIGN {
            PIECE_ALIGN
        } else {
            size.next_multiple_of(PIECE_ALIGN)
        }
    }

    /// Split `data` into k zero-padded data pieces followed by m parity pieces
    ///
    /// The caller keeps the original length to decode.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let size = self.shard_size(data.len());
        let mut pieces: Vec<Vec<u8>> = (0..self.data_pieces)
            .map(|i| {
                let start = (i * size).min(data.len());
                let end = (start + size).min(data.len());
                let mut piece = data[start..end].to_vec();
                piece.resize(size, 0);
                piece
            })
            .collect();

        let parity = reed_solomon_simd::encode(self.data_pieces, self.parity_pieces, &pieces)?;
        pieces.extend(parity);
        Ok(pieces)
    }

    /// Join the data pieces back into the first `original_size` bytes
    ///
    /// `pieces` holds k + m entries in encoding order, `None` for missing
    /// ones. Missing data pieces are restored in place.
    pub fn decode(
        &self,
        pieces: &mut [Option<Vec<u8>>],
        original_size: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        let k = self.data_pieces;
        if pieces.len() != self.total_shards() {
            return Err(ErasureError::InvalidLayout(format!(
                "expected {} pieces, got {}",
                self.total_shards(),
                pieces.len()
            )));
        }

        let available = pieces.iter().flatten().count();
        if available < k {
            return Err(ErasureError::InsufficientPieces {
                available,
                required: k,
            });
        }
        let mut sizes = pieces.iter().flatten().map(Vec::len);
        let size = sizes.next().unwrap_or_default();
        if sizes.any(|s| s != size) {
            return Err(ErasureError::PieceSizeMismatch);
        }
        if original_size > size * k {
            return Err(ErasureError::InvalidLayout(format!(
                "original size {original_size} exceeds {} data bytes",
                size * k
            )));
        }

        let missing: Vec<usize> = (0..k).filter(|&i| pieces[i].is_none()).collect();
        if !missing.is_empty() {
            let (data, parity) = pieces.split_at(k);
            let mut restored = reed_solomon_simd::decode(
                k,
                self.parity_pieces,
                data.iter()
                    .enumerate()
                    .filter_map(|(i, piece)| piece.as_ref().map(|p| (i, p))),
                parity
                    .iter()
                    .enumerate()
                    .filter_map(|(i, piece)| piece.as_ref().map(|p| (i, p))),
            )?;
            for i in missing {
                let piece = restored.remove(&i).ok_or_else(|| {
                    ErasureError::InvalidLayout(format!("data piece {i} was not restored"))
                })?;
                pieces[i] = Some(piece);
            }
        }

        let mut output = Vec::with_capacity(size * k);
        for piece in pieces[..k].iter().flatten() {
            output.extend_from_slice(piece);
        }
        output.truncate(original_size);
        Ok(output)
    }
}
