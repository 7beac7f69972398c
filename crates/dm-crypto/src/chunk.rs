//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Each chunk has its own random [`ChunkKey`]; the ciphertext carries the
//! 16-byte Poly1305 tag at the end and the 24-byte nonce travels separately
//! (base64 in the chunk record).

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use dm_core::{DmError, DmResult};
use rand::RngCore;

use crate::keys::ChunkKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Output of [`encrypt_chunk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    /// Ciphertext with the tag appended
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

pub fn encrypt_chunk(key: &ChunkKey, plaintext: &[u8]) -> DmResult<SealedChunk> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| DmError::Cipher(format!("chunk encryption failed: {e}")))?;

    Ok(SealedChunk { ciphertext, nonce })
}

/// Authentication failure is an error, never an empty plaintext.
pub fn decrypt_chunk(
    key: &ChunkKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> DmResult<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(DmError::Cipher(format!(
            "encrypted chunk too short: {} bytes (minimum {TAG_SIZE})",
            ciphertext.len()
        )));
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| DmError::Cipher("chunk decryption failed: invalid key or corrupted data".into()))
}
