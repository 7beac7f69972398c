//! Request and response shapes exchanged with the transport layer.
//!
//! Two submission shapes are accepted: the chunked shape, which carries
//! wrapped-key material per chunk, and the legacy shape with bare
//! `chunkHashes`. Both become a [`NewFile`] through
//! [`SubmitRequest::into_new_file`], which validates everything before any
//! state is written.

use serde::{Deserialize, Serialize};

use crate::error::{DmError, DmResult};
use crate::types::{ChunkRecord, FilePatch, ItemStatus, JobStatus, KdfInfo, NewFile};

/// Length of a lowercase hex SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// One chunk as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedChunk {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_chunk_key: Option<String>,
    #[serde(default, alias = "wrapIv", skip_serializing_if = "Option::is_none")]
    pub wrap_nonce: Option<String>,
    #[serde(default, alias = "chunkIv", skip_serializing_if = "Option::is_none")]
    pub ciphertext_nonce: Option<String>,
}

impl From<&ChunkRecord> for SubmittedChunk {
    fn from(c: &ChunkRecord) -> Self {
        Self {
            hash: c.hash.clone(),
            size: c.size,
            wrapped_chunk_key: c.wrapped_chunk_key.clone(),
            wrap_nonce: c.wrap_nonce.clone(),
            ciphertext_nonce: c.ciphertext_nonce.clone(),
        }
    }
}

/// File submission. Exactly one of `chunk_hashes` (legacy) or `chunks` must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<SubmittedChunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_file_key: Option<String>,
    #[serde(default, alias = "wrappedFileKeyIv", skip_serializing_if = "Option::is_none")]
    pub wrap_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfInfo>,
}

impl SubmitRequest {
    /// Parse a JSON body. Shape errors are reported as `InvalidInput`.
    pub fn from_json(body: &[u8]) -> DmResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| DmError::InvalidInput(format!("submission body: {e}")))
    }

    /// Validate and convert into catalog input. Chunk indices follow list order.
    pub fn into_new_file(self, owner_id: Option<String>) -> DmResult<NewFile> {
        let chunks = match (self.chunk_hashes, self.chunks) {
            (Some(hashes), _) => hashes
                .iter()
                .enumerate()
                .map(|(i, h)| Ok(ChunkRecord::bare(i as u64, normalize_hash(h)?)))
                .collect::<DmResult<Vec<_>>>()?,
            (None, Some(chunks)) => chunks
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    Ok(ChunkRecord {
                        index: i as u64,
                        hash: normalize_hash(&c.hash)?,
                        size: c.size,
                        ciphertext_nonce: c.ciphertext_nonce,
                        wrapped_chunk_key: c.wrapped_chunk_key,
                        wrap_nonce: c.wrap_nonce,
                    })
                })
                .collect::<DmResult<Vec<_>>>()?,
            (None, None) => {
                return Err(DmError::InvalidInput(
                    "chunkHashes or chunks must be provided as an array".into(),
                ))
            }
        };

        if self.wrap_nonce.is_some() && self.wrapped_file_key.is_none() {
            return Err(DmError::InvalidInput(
                "wrapNonce supplied without wrappedFileKey".into(),
            ));
        }

        Ok(NewFile {
            file_name: self.file_name,
            file_size: self.file_size,
            chunks,
            wrapped_file_key: self.wrapped_file_key,
            wrap_nonce: self.wrap_nonce,
            kdf: self.kdf,
            owner_id,
        })
    }
}

/// Validate a hex SHA-256 digest and return it lowercased.
pub fn normalize_hash(hash: &str) -> DmResult<String> {
    if hash.len() != HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DmError::InvalidInput(format!(
            "'{hash}' is not a {HASH_HEX_LEN}-character hex SHA-256 digest"
        )));
    }
    Ok(hash.to_ascii_lowercase())
}

/// Per-chunk verdict returned from a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkVerdict {
    pub hash: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub jobs: Vec<ChunkVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub chunk_hashes: Vec<String>,
}

impl CommitRequest {
    pub fn from_json(body: &[u8]) -> DmResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| DmError::InvalidInput(format!("commit body: {e}")))
    }

    /// Validated, lowercased hashes in request order.
    pub fn normalized_hashes(&self) -> DmResult<Vec<String>> {
        self.chunk_hashes.iter().map(|h| normalize_hash(h)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub ok: bool,
    pub committed: usize,
}

/// Metadata repair/backup request. Owner identity comes from the auth layer, not the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    #[serde(default)]
    pub wrapped_file_key: Option<String>,
    #[serde(default, alias = "wrapNonce")]
    pub wrapped_file_key_iv: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl PatchRequest {
    pub fn from_json(body: &[u8]) -> DmResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| DmError::InvalidInput(format!("patch body: {e}")))
    }

    pub fn into_patch(self) -> FilePatch {
        FilePatch {
            wrapped_file_key: self.wrapped_file_key,
            wrap_nonce: self.wrapped_file_key_iv,
            note: self.note,
            owner_id: None,
        }
    }
}
