//! Block processing: compression and authenticated encryption
//!
//! Write order is compress, then encrypt. The encrypted form is
//! `nonce (12 bytes) || ciphertext || tag`, with a fresh random nonce per
//! block.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zstor_common::{CompressionMode, Error, PipelineConfig, Result};

const NONCE_LEN: usize = 12;

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(|c| Self::Aes128(Box::new(c)))
                .map_err(|e| Error::Encryption(format!("failed to create cipher: {e}"))),
            32 => Aes256Gcm::new_from_slice(key)
                .map(|c| Self::Aes256(Box::new(c)))
                .map_err(|e| Error::Encryption(format!("failed to create cipher: {e}"))),
            n => Err(Error::configuration(format!(
                "encryption key must be 16 or 32 bytes, got {n}"
            ))),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = match self {
            Self::Aes128(c) => c.encrypt(&nonce, plaintext),
            Self::Aes256(c) => c.encrypt(&nonce, plaintext),
        }
        .map_err(|e| Error::Encryption(format!("encryption failed: {e}")))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::Encryption("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|e| Error::Encryption(format!("decryption failed: {e}")))
    }
}

/// Compression and encryption stages of the pipeline
pub struct Processor {
    compression: CompressionMode,
    cipher: Option<Cipher>,
}

impl Processor {
    /// Create a processor for the configured compression and encryption
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let cipher = config
            .encryption
            .private_key
            .as_deref()
            .map(|key| Cipher::new(key.as_bytes()))
            .transpose()?;
        Ok(Self {
            compression: config.compression,
            cipher,
        })
    }

    /// Transform a plain block into its stored form
    pub fn process(&self, block: &[u8]) -> Result<Vec<u8>> {
        let compressed = match zstd_level(self.compression) {
            Some(level) => zstd::encode_all(block, level)
                .map_err(|e| Error::Compression(e.to_string()))?,
            None => block.to_vec(),
        };
        match &self.cipher {
            Some(cipher) => cipher.encrypt(&compressed),
            None => Ok(compressed),
        }
    }

    /// Recover a plain block from its stored form
    pub fn unprocess(&self, data: &[u8]) -> Result<Vec<u8>> {
        let decrypted = match &self.cipher {
            Some(cipher) => cipher.decrypt(data)?,
            None => data.to_vec(),
        };
        if self.compression == CompressionMode::Disabled {
            return Ok(decrypted);
        }
        zstd::decode_all(decrypted.as_slice()).map_err(|e| Error::Compression(e.to_string()))
    }
}

const fn zstd_level(mode: CompressionMode) -> Option<i32> {
    match mode {
        CompressionMode::Disabled => None,
        CompressionMode::Default => Some(3),
        CompressionMode::BestSpeed => Some(1),
        CompressionMode::BestCompression => Some(19),
    }
}

/// Key under which the pieces of a chunk are stored
///
/// Derived from the processed block and its position within the object, so
/// equal blocks at different positions never share shard keys.
#[must_use]
pub fn chunk_key(object_key: &[u8], index: usize, processed: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update((object_key.len() as u64).to_le_bytes());
    hasher.update(object_key);
    hasher.update((index as u64).to_le_bytes());
    hasher.update(processed);
    hasher.finalize().to_vec()
}
