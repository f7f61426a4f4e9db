//! zstor Erasure Coding
//!
//! Splits a block into `k` data pieces and `m` parity pieces such that any
//! `k` of the `k + m` pieces suffice to rebuild the block.
//!
//! # Example
//!
//! ```
//! use zstor_erasure::ErasureCodec;
//!
//! let codec = ErasureCodec::new(3, 1).unwrap();
//! let data = b"Hello, World!";
//! let pieces = codec.encode(data).unwrap();
//! assert_eq!(pieces.len(), 4);
//!
//! let mut pieces: Vec<Option<Vec<u8>>> = pieces.into_iter().map(Some).collect();
//! pieces[0] = None;
//! assert_eq!(codec.decode(&mut pieces, data.len()).unwrap(), data);
//! ```

pub mod codec;

pub use codec::{ErasureCodec, ErasureError};
