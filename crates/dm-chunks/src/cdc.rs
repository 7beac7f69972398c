//! Gear-hash content-defined chunking
//!
//! Rolling hash: `hash = (hash << 1) + GEAR[byte]` (mod 2^32), reset to zero
//! at every cut. A boundary is cut after the current byte when the chunk has
//! reached `min_size` and `hash & mask == 0`, or unconditionally when it has
//! reached `max_size`. `mask` has `round(log2(avg_size))` low bits set.
//!
//! Boundaries depend only on the byte stream and the sizes, never on how
//! the stream is split into reads.

use dm_core::config::ChunkingConfig;

use crate::gear::GEAR;

/// Chunk size configuration (bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkSizes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ChunkSizes {
    pub const DEFAULT: ChunkSizes = ChunkSizes {
        min_size: 16 * 1024,  // 16KB
        avg_size: 64 * 1024,  // 64KB
        max_size: 256 * 1024, // 256KB
    };

    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> Self {
        ChunkSizes {
            min_size,
            avg_size,
            max_size,
        }
        .normalized()
    }

    /// Zero values take the defaults, then `min <= avg <= max` is restored:
    /// `min = max(1, avg / 4)` when `min > avg`, `max = max(2 * avg, avg + 1)`
    /// when `max < avg`.
    pub fn normalized(self) -> Self {
        let or_default = |v: u32, d: u32| if v == 0 { d } else { v };
        let avg = or_default(self.avg_size, Self::DEFAULT.avg_size);
        let mut min = or_default(self.min_size, Self::DEFAULT.min_size);
        let mut max = or_default(self.max_size, Self::DEFAULT.max_size);

        if min > avg {
            min = (avg / 4).max(1);
        }
        if max < avg {
            max = avg.saturating_mul(2).max(avg.saturating_add(1));
        }
        ChunkSizes {
            min_size: min,
            avg_size: avg,
            max_size: max,
        }
    }

    /// Boundary mask with `max(1, round(log2(avg)))` low bits set.
    pub fn mask(&self) -> u32 {
        let bits = (f64::from(self.avg_size.max(1)).log2().round() as u32).max(1);
        if bits >= 32 {
            u32::MAX
        } else {
            (1u32 << bits) - 1
        }
    }
}

impl From<&ChunkingConfig> for ChunkSizes {
    fn from(c: &ChunkingConfig) -> Self {
        ChunkSizes::new(c.min_chunk, c.avg_chunk, c.max_chunk)
    }
}

/// A cut chunk's plaintext and its offset in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Streaming chunker. Feed bytes with [`push`](Self::push), then call
/// [`finish`](Self::finish) for the tail.
#[derive(Debug)]
pub struct GearChunker {
    sizes: ChunkSizes,
    mask: u32,
    hash: u32,
    pending: Vec<u8>,
    offset: u64,
}

impl GearChunker {
    pub fn new(sizes: ChunkSizes) -> Self {
        let sizes = sizes.normalized();
        Self {
            mask: sizes.mask(),
            sizes,
            hash: 0,
            pending: Vec::with_capacity(sizes.avg_size as usize),
            offset: 0,
        }
    }

    pub fn sizes(&self) -> ChunkSizes {
        self.sizes
    }

    /// Consume `data`, returning every chunk completed inside it.
    pub fn push(&mut self, data: &[u8]) -> Vec<RawChunk> {
        let min = self.sizes.min_size as usize;
        let max = self.sizes.max_size as usize;
        let mut out = Vec::new();
        let mut start = 0;

        for (i, &b) in data.iter().enumerate() {
            self.hash = (self.hash << 1).wrapping_add(GEAR[b as usize]);
            let len = self.pending.len() + (i + 1 - start);

            if (len >= min && self.hash & self.mask == 0) || len >= max {
                self.pending.extend_from_slice(&data[start..=i]);
                out.push(self.cut());
                start = i + 1;
            }
        }

        self.pending.extend_from_slice(&data[start..]);
        out
    }

    /// Emit the trailing partial chunk, if any.
    pub fn finish(mut self) -> Option<RawChunk> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.cut())
        }
    }

    fn cut(&mut self) -> RawChunk {
        let data = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.sizes.avg_size as usize),
        );
        let chunk = RawChunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.data.len() as u64;
        self.hash = 0;
        chunk
    }
}

/// A chunk located within an in-memory buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the source
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
    /// SHA-256 of this chunk's data (lowercase hex)
    pub hash: String,
}

/// Split `data` into content-defined chunks.
///
/// For empty data, returns an empty list.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes) -> Vec<Chunk> {
    let mut chunker = GearChunker::new(sizes);
    let mut raw = chunker.push(data);
    raw.extend(chunker.finish());

    raw.into_iter()
        .map(|c| Chunk {
            offset: c.offset,
            length: c.data.len(),
            hash: crate::hash::sha256_hex(&c.data),
        })
        .collect()
}
