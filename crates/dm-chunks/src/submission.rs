//! Building the submission for an encrypted file, and the reverse path:
//! recovering the file key, decrypting chunks, and reassembling plaintext.

use dm_core::api::{SubmitRequest, SubmittedChunk};
use dm_core::types::{ChunkRecord, FileRecord, KdfInfo};
use dm_core::{DmError, DmResult};
use dm_crypto::{
    decrypt_chunk, encoding, unwrap_chunk_key, DerivedKey, FileKey, KeyService, MasterKey,
    WrappedKey,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::hash::sha256_hex;
use crate::producer::{EncryptedChunk, EncryptedFile};

/// A ready-to-send submission plus what the caller must keep locally.
#[derive(Debug)]
pub struct Submission {
    pub request: SubmitRequest,
    /// Set only when no master key was available: the file key is not
    /// wrapped anywhere and must be managed out of band.
    pub raw_file_key: Option<FileKey>,
    /// Ciphertexts in chunk order, for upload
    pub chunks: Vec<EncryptedChunk>,
}

impl EncryptedFile {
    /// Build the chunked submission with the file key wrapped under the
    /// derived master key. The wrap goes through the key service, so it is
    /// bounded by the service's timeout and by `cancel`; on failure nothing
    /// is produced.
    pub async fn into_protected_submission(
        self,
        file_name: Option<String>,
        keys: &KeyService,
        derived: &DerivedKey,
        cancel: &CancellationToken,
    ) -> DmResult<Submission> {
        let wrapped = keys
            .wrap_file_key(&derived.master, &self.file_key, cancel)
            .await?;
        Ok(self.build(file_name, Some((wrapped, derived.kdf_info()))))
    }

    /// Build the chunked submission without wrapping the file key. Chunks are
    /// still encrypted, but the raw key is handed back and must be managed
    /// out of band.
    pub fn into_unprotected_submission(self, file_name: Option<String>) -> Submission {
        warn!(
            file_name = file_name.as_deref().unwrap_or("<unnamed>"),
            "no passphrase: file key is not wrapped and must be managed out of band"
        );
        self.build(file_name, None)
    }

    fn build(self, file_name: Option<String>, protection: Option<(WrappedKey, KdfInfo)>) -> Submission {
        let chunks: Vec<SubmittedChunk> = self
            .chunks
            .iter()
            .map(|c| SubmittedChunk::from(&c.record))
            .collect();

        let (wrapped_file_key, wrap_nonce, kdf, raw_file_key) = match protection {
            Some((wrapped, kdf)) => {
                let (ct, nonce) = wrapped.to_base64();
                (Some(ct), Some(nonce), Some(kdf), None)
            }
            None => (None, None, None, Some(self.file_key.clone())),
        };

        Submission {
            request: SubmitRequest {
                file_name,
                file_size: Some(self.file_size),
                chunks: Some(chunks),
                chunk_hashes: None,
                wrapped_file_key,
                wrap_nonce,
                kdf,
            },
            raw_file_key,
            chunks: self.chunks,
        }
    }
}

/// Unwrap a catalogued file's key with the master key re-derived for it.
/// The unwrap goes through the key service, bounded by its timeout and by
/// `cancel`. Unprotected files have nothing to unwrap.
pub async fn recover_file_key(
    record: &FileRecord,
    master: &MasterKey,
    keys: &KeyService,
    cancel: &CancellationToken,
) -> DmResult<FileKey> {
    let (Some(ct), Some(nonce)) = (&record.wrapped_file_key, &record.wrap_nonce) else {
        return Err(DmError::InvalidInput(format!(
            "file {} has no wrapped file key",
            record.id
        )));
    };
    let wrapped = WrappedKey::from_base64(ct, nonce)?;
    keys.unwrap_file_key(master, &wrapped, cancel).await
}

/// Decrypt one chunk and check it against its recorded plaintext hash.
pub fn decrypt_chunk_record(
    file_key: &FileKey,
    chunk: &ChunkRecord,
    ciphertext: &[u8],
) -> DmResult<Vec<u8>> {
    let (Some(wrapped_key), Some(wrap_nonce), Some(nonce)) = (
        &chunk.wrapped_chunk_key,
        &chunk.wrap_nonce,
        &chunk.ciphertext_nonce,
    ) else {
        return Err(DmError::InvalidInput(format!(
            "chunk {} carries no key material",
            chunk.index
        )));
    };

    let chunk_key = unwrap_chunk_key(file_key, &WrappedKey::from_base64(wrapped_key, wrap_nonce)?)?;
    let nonce = encoding::decode_array(nonce, "ciphertext nonce")?;
    let plaintext = decrypt_chunk(&chunk_key, &nonce, ciphertext)?;

    if sha256_hex(&plaintext) != chunk.hash {
        return Err(DmError::Cipher(format!(
            "chunk {} plaintext does not match hash {}",
            chunk.index, chunk.hash
        )));
    }
    Ok(plaintext)
}

/// Reassemble a file in chunk-index order. `fetch` returns a chunk's ciphertext.
///
/// Indices must form exactly `0..n`.
pub fn reassemble<F>(file_key: &FileKey, chunks: &[ChunkRecord], mut fetch: F) -> DmResult<Vec<u8>>
where
    F: FnMut(&ChunkRecord) -> DmResult<Vec<u8>>,
{
    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    if let Some((expected, chunk)) = ordered
        .iter()
        .enumerate()
        .find(|(i, c)| c.index != *i as u64)
    {
        return Err(DmError::InvalidInput(format!(
            "chunk indices are not contiguous: expected {expected}, found {}",
            chunk.index
        )));
    }

    // recorded sizes come from the submitter and are not trusted for allocation
    let mut out = Vec::new();
    for chunk in ordered {
        let ciphertext = fetch(chunk)?;
        out.extend_from_slice(&decrypt_chunk_record(file_key, chunk, &ciphertext)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::ChunkSizes;
    use crate::producer::ChunkProducer;
    use dm_crypto::{KdfAlgorithm, KdfParams, KEY_SIZE, SALT_SIZE};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::time::Duration;

    const SMALL: ChunkSizes = ChunkSizes {
        min_size: 64,
        avg_size: 256,
        max_size: 1024,
    };

    fn data() -> Vec<u8> {
        (0..9000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect()
    }

    fn derived() -> DerivedKey {
        DerivedKey {
            master: MasterKey::from_bytes([4u8; KEY_SIZE]),
            salt: [1u8; SALT_SIZE],
            algorithm: KdfAlgorithm::Argon2id,
        }
    }

    fn keys() -> KeyService {
        KeyService::spawn(
            KdfParams {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
                pbkdf2_iterations: 1000,
            },
            Duration::from_secs(15),
            Duration::from_secs(15),
        )
    }

    fn file_record(sub: &Submission) -> FileRecord {
        let new = sub.request.clone().into_new_file(None).unwrap();
        FileRecord::from_new("f1".into(), new, 0)
    }

    fn blobs(sub: &Submission) -> HashMap<u64, Vec<u8>> {
        sub.chunks
            .iter()
            .map(|c| (c.record.index, c.ciphertext.clone()))
            .collect()
    }

    async fn encrypt(data: &[u8]) -> EncryptedFile {
        ChunkProducer::new(SMALL, 500)
            .encrypt_reader(Cursor::new(data.to_vec()), None)
            .await
            .unwrap()
    }

    async fn protected(data: &[u8], keys: &KeyService) -> Submission {
        encrypt(data)
            .await
            .into_protected_submission(Some("a.bin".into()), keys, &derived(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn protected_submission_roundtrips_through_master_key() {
        let data = data();
        let keys = keys();
        let sub = protected(&data, &keys).await;

        assert!(sub.raw_file_key.is_none());
        assert_eq!(sub.request.file_size, Some(data.len() as u64));
        assert_eq!(sub.request.kdf.as_ref().unwrap().algorithm, "argon2id");
        assert!(sub.request.wrapped_file_key.is_some());

        let record = file_record(&sub);
        let blobs = blobs(&sub);
        let cancel = CancellationToken::new();
        let file_key = recover_file_key(&record, &derived().master, &keys, &cancel)
            .await
            .unwrap();
        let back = reassemble(&file_key, &record.chunks, |c| Ok(blobs[&c.index].clone())).unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn unprotected_submission_returns_raw_key() {
        let data = data();
        let sub = encrypt(&data).await.into_unprotected_submission(None);

        assert!(sub.request.wrapped_file_key.is_none());
        assert!(sub.request.kdf.is_none());
        let raw = sub.raw_file_key.clone().unwrap();

        let record = file_record(&sub);
        let err = recover_file_key(&record, &derived().master, &keys(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::InvalidInput(_)));

        let mut reversed = record.chunks.clone();
        reversed.reverse();
        let blobs = blobs(&sub);
        let back = reassemble(&raw, &reversed, |c| Ok(blobs[&c.index].clone())).unwrap();
        assert_eq!(back, data, "reassembly follows chunk index, not list order");
    }

    #[tokio::test]
    async fn wrong_master_key_fails_to_unwrap() {
        let keys = keys();
        let sub = protected(&data(), &keys).await;
        let record = file_record(&sub);
        let other = MasterKey::from_bytes([5u8; KEY_SIZE]);
        assert!(matches!(
            recover_file_key(&record, &other, &keys, &CancellationToken::new()).await,
            Err(DmError::UnwrapFailure(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_wrap_produces_no_submission() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = encrypt(&data())
            .await
            .into_protected_submission(None, &keys(), &derived(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::WrapFailure(_)));
    }

    #[tokio::test]
    async fn swapped_ciphertext_is_rejected() {
        let file = encrypt(&data()).await;
        assert!(file.chunks.len() >= 2);
        let key = file.file_key.clone();
        let first = &file.chunks[0];
        let second = &file.chunks[1];
        assert!(decrypt_chunk_record(&key, &first.record, &second.ciphertext).is_err());
    }

    #[tokio::test]
    async fn reassembly_ignores_implausible_recorded_sizes() {
        let data = data();
        let sub = encrypt(&data).await.into_unprotected_submission(None);
        let raw = sub.raw_file_key.clone().unwrap();
        let blobs = blobs(&sub);

        let mut chunks = file_record(&sub).chunks;
        assert!(chunks.len() >= 2);
        chunks[0].size = Some(u64::MAX);
        chunks[1].size = Some(2);
        let back = reassemble(&raw, &chunks, |c| Ok(blobs[&c.index].clone())).unwrap();
        assert_eq!(back, data);

        for c in chunks.iter_mut() {
            c.size = Some(u64::MAX);
        }
        let back = reassemble(&raw, &chunks, |c| Ok(blobs[&c.index].clone())).unwrap();
        assert_eq!(back.len(), data.len());
    }

    #[test]
    fn gap_in_indices_is_rejected() {
        let key = dm_crypto::generate_file_key();
        let chunks = vec![ChunkRecord::bare(0, "a"), ChunkRecord::bare(2, "b")];
        let err = reassemble(&key, &chunks, |_| Ok(Vec::new())).unwrap_err();
        assert!(matches!(err, DmError::InvalidInput(_)));
    }
}
