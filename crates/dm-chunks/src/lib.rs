//! dm-chunks: content-defined chunking and per-chunk encryption
//!
//! # Overview
//! - `gear`: the versioned gear table that fixes chunk boundaries
//! - `cdc`: streaming gear-hash chunker and size normalisation
//! - `hash`: SHA-256 plaintext identity used for dedup
//! - `producer`: async reader → encrypted chunk events
//! - `submission`: encrypted file → submission request; decrypt and reassembly

pub mod cdc;
pub mod gear;
pub mod hash;
pub mod producer;
pub mod submission;

pub use cdc::{chunk_data, Chunk, ChunkSizes, GearChunker, RawChunk};
pub use gear::{GEAR, GEAR_TABLE_VERSION};
pub use hash::{hash_bytes, sha256_hex};
pub use producer::{ChunkEvent, ChunkProducer, ChunkStream, EncryptedChunk, EncryptedFile};
pub use submission::{decrypt_chunk_record, reassemble, recover_file_key, Submission};
