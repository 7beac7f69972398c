//! Encrypting chunk producer.
//!
//! One producer task per file reads the source in `read_block` sized reads,
//! runs the gear chunker over them, and for each cut chunk:
//!
//! 1. hashes the plaintext (SHA-256, dedup identity)
//! 2. encrypts it under a fresh random [`ChunkKey`](dm_crypto::ChunkKey)
//! 3. wraps that chunk key under the file's [`FileKey`]
//!
//! Results arrive as [`ChunkEvent`]s in stream order. Processing is strictly
//! sequential within a file; the task yields to the scheduler after every
//! read block.

use anyhow::anyhow;
use dm_core::config::ChunkingConfig;
use dm_core::types::ChunkRecord;
use dm_core::{DmError, DmResult};
use dm_crypto::{encoding, encrypt_chunk, generate_chunk_key, generate_file_key, wrap_chunk_key, FileKey};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::cdc::{ChunkSizes, GearChunker, RawChunk};
use crate::hash::sha256_hex;

const EVENT_QUEUE_DEPTH: usize = 16;

/// A chunk's catalog record plus its ciphertext (tag appended).
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    pub record: ChunkRecord,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug)]
pub enum ChunkEvent {
    Progress {
        chunk: EncryptedChunk,
        bytes_processed: u64,
        /// `None` when the total size is unknown
        percent: Option<u8>,
    },
    Done {
        chunk_count: u64,
        total_bytes: u64,
    },
    /// Fatal. No further events follow.
    Error(DmError),
}

/// Everything produced for one file.
#[derive(Debug)]
pub struct EncryptedFile {
    pub file_key: FileKey,
    pub file_size: u64,
    pub chunks: Vec<EncryptedChunk>,
}

impl EncryptedFile {
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.chunks.iter().map(|c| c.record.clone()).collect()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.record.hash.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkProducer {
    sizes: ChunkSizes,
    read_block: usize,
}

impl Default for ChunkProducer {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

impl ChunkProducer {
    pub fn new(sizes: ChunkSizes, read_block: usize) -> Self {
        Self {
            sizes: sizes.normalized(),
            read_block: read_block.max(1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(ChunkSizes::from(config), config.read_block)
    }

    pub fn sizes(&self) -> ChunkSizes {
        self.sizes
    }

    /// Start chunking `reader` with a fresh file key.
    ///
    /// `total_size` only feeds the progress percentage.
    pub fn spawn<R>(&self, reader: R, total_size: Option<u64>) -> ChunkStream
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let file_key = generate_file_key();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let job = Production {
            sizes: self.sizes,
            read_block: self.read_block,
            total_size,
            file_key: file_key.clone(),
        };
        let handle = tokio::spawn(job.run(reader, tx));
        ChunkStream {
            file_key,
            events: rx,
            handle,
        }
    }

    /// Spawn and collect in one step.
    pub async fn encrypt_reader<R>(&self, reader: R, total_size: Option<u64>) -> DmResult<EncryptedFile>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.spawn(reader, total_size).collect().await
    }
}

/// Receiving side of a running producer.
pub struct ChunkStream {
    file_key: FileKey,
    events: mpsc::Receiver<ChunkEvent>,
    handle: JoinHandle<()>,
}

impl ChunkStream {
    pub async fn next_event(&mut self) -> Option<ChunkEvent> {
        self.events.recv().await
    }

    pub async fn collect(self) -> DmResult<EncryptedFile> {
        self.collect_with_progress(|_, _| {}).await
    }

    /// Gather every chunk, calling `on_progress(bytes_processed, percent)` per chunk.
    /// Any error discards everything produced so far.
    pub async fn collect_with_progress<F>(mut self, mut on_progress: F) -> DmResult<EncryptedFile>
    where
        F: FnMut(u64, Option<u8>),
    {
        let mut chunks = Vec::new();
        let outcome = loop {
            match self.events.recv().await {
                Some(ChunkEvent::Progress {
                    chunk,
                    bytes_processed,
                    percent,
                }) => {
                    on_progress(bytes_processed, percent);
                    chunks.push(chunk);
                }
                Some(ChunkEvent::Done {
                    chunk_count,
                    total_bytes,
                }) => break Ok((chunk_count, total_bytes)),
                Some(ChunkEvent::Error(e)) => break Err(e),
                None => {
                    break Err(DmError::Other(anyhow!(
                        "chunk producer stopped without finishing"
                    )))
                }
            }
        };
        let _ = self.handle.await;

        let (chunk_count, total_bytes) = outcome?;
        if chunk_count != chunks.len() as u64 {
            return Err(DmError::Other(anyhow!(
                "chunk producer reported {chunk_count} chunks, received {}",
                chunks.len()
            )));
        }
        Ok(EncryptedFile {
            file_key: self.file_key,
            file_size: total_bytes,
            chunks,
        })
    }
}

struct Production {
    sizes: ChunkSizes,
    read_block: usize,
    total_size: Option<u64>,
    file_key: FileKey,
}

impl Production {
    async fn run<R>(self, mut reader: R, tx: mpsc::Sender<ChunkEvent>)
    where
        R: AsyncRead + Unpin,
    {
        match self.produce(&mut reader, &tx).await {
            Ok(done) => {
                let _ = tx.send(done).await;
            }
            Err(e) => {
                error!(error = %e, "chunk production failed");
                let _ = tx.send(ChunkEvent::Error(e)).await;
            }
        }
    }

    async fn produce<R>(&self, reader: &mut R, tx: &mpsc::Sender<ChunkEvent>) -> DmResult<ChunkEvent>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunker = GearChunker::new(self.sizes);
        let mut buf = vec![0u8; self.read_block];
        let mut index = 0u64;
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            for raw in chunker.push(&buf[..n]) {
                self.emit(index, raw, tx).await?;
                index += 1;
            }
            tokio::task::yield_now().await;
        }

        if let Some(raw) = chunker.finish() {
            self.emit(index, raw, tx).await?;
            index += 1;
        }

        debug!(chunks = index, bytes = total, "chunking finished");
        Ok(ChunkEvent::Done {
            chunk_count: index,
            total_bytes: total,
        })
    }

    async fn emit(&self, index: u64, raw: RawChunk, tx: &mpsc::Sender<ChunkEvent>) -> DmResult<()> {
        let bytes_processed = raw.offset + raw.data.len() as u64;
        let chunk = seal(&self.file_key, index, &raw)?;
        let percent = self.total_size.map(|total| percent_of(bytes_processed, total));

        tx.send(ChunkEvent::Progress {
            chunk,
            bytes_processed,
            percent,
        })
        .await
        .map_err(|_| DmError::Other(anyhow!("chunk event receiver dropped")))
    }
}

/// Hash, encrypt and key-wrap one chunk.
pub(crate) fn seal(file_key: &FileKey, index: u64, raw: &RawChunk) -> DmResult<EncryptedChunk> {
    let hash = sha256_hex(&raw.data);
    let chunk_key = generate_chunk_key();
    let sealed = encrypt_chunk(&chunk_key, &raw.data)?;
    let wrapped = wrap_chunk_key(file_key, &chunk_key)?;
    let (wrapped_chunk_key, wrap_nonce) = wrapped.to_base64();

    Ok(EncryptedChunk {
        record: ChunkRecord {
            index,
            hash,
            size: Some(raw.data.len() as u64),
            ciphertext_nonce: Some(encoding::encode(&sealed.nonce)),
            wrapped_chunk_key: Some(wrapped_chunk_key),
            wrap_nonce: Some(wrap_nonce),
        },
        ciphertext: sealed.ciphertext,
    })
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SMALL: ChunkSizes = ChunkSizes {
        min_size: 64,
        avg_size: 256,
        max_size: 1024,
    };

    fn bytes(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8)
            .collect()
    }

    #[tokio::test]
    async fn produces_records_matching_plain_chunking() {
        let data = bytes(20_000);
        let producer = ChunkProducer::new(SMALL, 333);
        let file = producer
            .encrypt_reader(Cursor::new(data.clone()), Some(data.len() as u64))
            .await
            .unwrap();

        let plain = crate::cdc::chunk_data(&data, SMALL);
        assert_eq!(file.chunks.len(), plain.len());
        assert_eq!(file.file_size, data.len() as u64);
        for (i, (enc, p)) in file.chunks.iter().zip(&plain).enumerate() {
            assert_eq!(enc.record.index, i as u64);
            assert_eq!(enc.record.hash, p.hash);
            assert_eq!(enc.record.size, Some(p.length as u64));
            assert_eq!(enc.ciphertext.len(), p.length + dm_crypto::TAG_SIZE);
            assert!(enc.record.wrapped_chunk_key.is_some());
            assert!(enc.record.wrap_nonce.is_some());
            assert!(enc.record.ciphertext_nonce.is_some());
        }
    }

    #[tokio::test]
    async fn empty_input_yields_done_with_zero_chunks() {
        let mut stream = ChunkProducer::new(SMALL, 64).spawn(Cursor::new(Vec::<u8>::new()), Some(0));
        match stream.next_event().await {
            Some(ChunkEvent::Done {
                chunk_count,
                total_bytes,
            }) => {
                assert_eq!(chunk_count, 0);
                assert_eq!(total_bytes, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_reaches_one_hundred_percent() {
        let data = bytes(5000);
        let mut seen = Vec::new();
        ChunkProducer::new(SMALL, 1000)
            .spawn(Cursor::new(data), Some(5000))
            .collect_with_progress(|bytes, pct| seen.push((bytes, pct)))
            .await
            .unwrap();

        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen.last().copied(), Some((5000, Some(100))));
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.served {
                std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
            } else {
                self.served = true;
                buf.put_slice(&[7u8; 2048]);
                std::task::Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn read_error_is_reported_once_without_partial_output() {
        let result = ChunkProducer::new(SMALL, 4096)
            .encrypt_reader(FailingReader { served: false }, None)
            .await;
        assert!(matches!(result, Err(DmError::Io(_))));
    }

    #[test]
    fn percent_rounding() {
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(10, 10), 100);
    }
}
