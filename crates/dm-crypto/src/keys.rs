//! File and chunk keys, and the typed wrap/unwrap operations between levels.
//!
//! A wrapped key is XChaCha20-Poly1305 over the 32 raw key bytes:
//! 48 bytes of ciphertext+tag plus a separate 24-byte random nonce.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use dm_core::{DmError, DmResult};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::kdf::MasterKey;
use crate::{encoding, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A per-file 256-bit key. Only ever used to wrap chunk keys. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-chunk 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct ChunkKey {
    bytes: [u8; KEY_SIZE],
}

impl ChunkKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ChunkKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

pub fn generate_file_key() -> FileKey {
    FileKey::from_bytes(random_key())
}

pub fn generate_chunk_key() -> ChunkKey {
    ChunkKey::from_bytes(random_key())
}

fn random_key() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A key encrypted under the key one level up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Ciphertext with the Poly1305 tag appended (48 bytes)
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

impl WrappedKey {
    /// Base64 `(ciphertext, nonce)` as carried in submissions and file records.
    pub fn to_base64(&self) -> (String, String) {
        (encoding::encode(&self.ciphertext), encoding::encode(&self.nonce))
    }

    pub fn from_base64(ciphertext: &str, nonce: &str) -> DmResult<Self> {
        Ok(Self {
            ciphertext: encoding::decode(ciphertext, "wrapped key")?,
            nonce: encoding::decode_array(nonce, "wrap nonce")?,
        })
    }
}

/// Wrap a file key under the master key.
pub fn wrap_file_key(master: &MasterKey, file_key: &FileKey) -> DmResult<WrappedKey> {
    seal_key(master.as_bytes(), file_key.as_bytes())
}

/// Unwrap a file key. A wrong master key or any tampering fails authentication.
pub fn unwrap_file_key(master: &MasterKey, wrapped: &WrappedKey) -> DmResult<FileKey> {
    open_key(master.as_bytes(), wrapped).map(|k| FileKey::from_bytes(*k))
}

/// Wrap a chunk key under its file key.
pub fn wrap_chunk_key(file_key: &FileKey, chunk_key: &ChunkKey) -> DmResult<WrappedKey> {
    seal_key(file_key.as_bytes(), chunk_key.as_bytes())
}

pub fn unwrap_chunk_key(file_key: &FileKey, wrapped: &WrappedKey) -> DmResult<ChunkKey> {
    open_key(file_key.as_bytes(), wrapped).map(|k| ChunkKey::from_bytes(*k))
}

fn seal_key(wrapping: &[u8; KEY_SIZE], key: &[u8; KEY_SIZE]) -> DmResult<WrappedKey> {
    let cipher = XChaCha20Poly1305::new(wrapping.into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), key.as_ref())
        .map_err(|e| DmError::WrapFailure(format!("key wrapping failed: {e}")))?;

    Ok(WrappedKey { ciphertext, nonce })
}

fn open_key(wrapping: &[u8; KEY_SIZE], wrapped: &WrappedKey) -> DmResult<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.ciphertext.len() != KEY_SIZE + TAG_SIZE {
        return Err(DmError::UnwrapFailure(format!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.ciphertext.len(),
            KEY_SIZE + TAG_SIZE
        )));
    }

    let cipher = XChaCha20Poly1305::new(wrapping.into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(&wrapped.nonce), wrapped.ciphertext.as_slice())
            .map_err(|_| {
                DmError::UnwrapFailure("invalid wrapping key or corrupted data".into())
            })?,
    );

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}
