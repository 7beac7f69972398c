//! dm-crypto: client-side key hierarchy for drivemerge
//!
//! ```text
//! Master Key (256-bit, Argon2id or PBKDF2-HMAC-SHA256 from passphrase)
//!   └── File Key (per-file, 256-bit random, wrapped by master key)
//!         └── Chunk Key (per-chunk, 256-bit random, wrapped by file key)
//!               └── Chunk AEAD: XChaCha20-Poly1305 (nonce = random 192-bit)
//! ```
//!
//! Wrapping functions are typed per level, so a chunk key can only ever be
//! wrapped under a file key and a file key only under the master key.

pub mod chunk;
pub mod encoding;
pub mod kdf;
pub mod keys;
pub mod service;

pub use chunk::{decrypt_chunk, encrypt_chunk, SealedChunk};
pub use kdf::{derive_master_key, derive_with, DerivedKey, KdfAlgorithm, KdfParams, MasterKey};
pub use keys::{
    generate_chunk_key, generate_file_key, unwrap_chunk_key, unwrap_file_key, wrap_chunk_key,
    wrap_file_key, ChunkKey, FileKey, WrappedKey,
};
pub use service::{KeyReply, KeyRequest, KeyService};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a generated KDF salt
pub const SALT_SIZE: usize = 16;
