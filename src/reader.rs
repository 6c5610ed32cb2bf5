//! Read side of the chunk layout
//!
//! Just enough traversal to prove the on-disk contract: open a finalized
//! output, walk its metadata, and random-access any stored point's payload.
//! Chunk readers come in the same two shapes as build chunks — sparse and
//! contiguous — and an LRU cache keeps recently touched chunks decoded.

use crate::error::{IndexError, Result};
use crate::storage::{compression, Source};
use crate::tree::chunk::{TAG_CONTIGUOUS, TAG_SPARSE};
use crate::types::{Schema, INVALID_ORIGIN};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub enum ChunkReader {
    Sparse(SparseReader),
    Contiguous(ContiguousReader),
}

impl ChunkReader {
    /// Decode one chunk blob. `id` is the chunk's first node index.
    pub fn open(schema: Arc<Schema>, id: u64, max_points: u64, blob: &[u8]) -> Result<Self> {
        let frame = compression::unpack(blob)?;
        let (&tag, body) = frame
            .split_first()
            .ok_or_else(|| IndexError::Chunk("empty chunk frame".into()))?;

        match tag {
            TAG_SPARSE => Ok(Self::Sparse(SparseReader::new(schema, id, body)?)),
            TAG_CONTIGUOUS => Ok(Self::Contiguous(ContiguousReader::new(
                schema, id, max_points, body,
            )?)),
            other => Err(IndexError::Chunk(format!("unknown chunk tag {}", other))),
        }
    }

    /// Payload of the point at absolute node index `raw`, if stored.
    pub fn point_data(&self, raw: u64) -> Option<&[u8]> {
        match self {
            Self::Sparse(reader) => reader.point_data(raw),
            Self::Contiguous(reader) => reader.point_data(raw),
        }
    }

    pub fn num_points(&self) -> u64 {
        match self {
            Self::Sparse(reader) => reader.records.len() as u64,
            Self::Contiguous(reader) => reader.num_points,
        }
    }
}

pub struct SparseReader {
    id: u64,
    records: HashMap<u64, Vec<u8>>,
}

impl SparseReader {
    fn new(schema: Arc<Schema>, id: u64, body: &[u8]) -> Result<Self> {
        let point_size = schema.point_size();
        if body.len() < 8 {
            return Err(IndexError::Chunk("sparse body missing count".into()));
        }
        let (data, tail) = body.split_at(body.len() - 8);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(tail);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let record = 8 + point_size;
        if data.len() != count * record {
            return Err(IndexError::Chunk(format!(
                "sparse body holds {} bytes, expected {} records of {}",
                data.len(),
                count,
                record
            )));
        }

        let mut records = HashMap::with_capacity(count);
        for chunk in data.chunks(record) {
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&chunk[..8]);
            records.insert(u64::from_le_bytes(idx_bytes), chunk[8..].to_vec());
        }
        Ok(Self { id, records })
    }

    fn point_data(&self, raw: u64) -> Option<&[u8]> {
        self.records.get(&(raw - self.id)).map(|v| v.as_slice())
    }
}

pub struct ContiguousReader {
    schema: Arc<Schema>,
    id: u64,
    max_points: u64,
    num_points: u64,
    data: Vec<u8>,
}

impl ContiguousReader {
    fn new(schema: Arc<Schema>, id: u64, max_points: u64, body: &[u8]) -> Result<Self> {
        let point_size = schema.point_size();
        if body.len() != max_points as usize * point_size {
            return Err(IndexError::Chunk(format!(
                "contiguous body holds {} bytes, expected {}",
                body.len(),
                max_points as usize * point_size
            )));
        }
        let num_points = body
            .chunks(point_size)
            .filter(|record| schema.origin_of(record) != INVALID_ORIGIN)
            .count() as u64;
        Ok(Self {
            schema,
            id,
            max_points,
            num_points,
            data: body.to_vec(),
        })
    }

    fn point_data(&self, raw: u64) -> Option<&[u8]> {
        let local = raw.checked_sub(self.id)?;
        if local >= self.max_points {
            return None;
        }
        let point_size = self.schema.point_size();
        let record = &self.data[local as usize * point_size..(local as usize + 1) * point_size];
        // Blank slots carry the invalid-origin sentinel.
        (self.schema.origin_of(record) != INVALID_ORIGIN).then_some(record)
    }
}

/// Decoded-chunk cache for random-access traversal.
pub struct ChunkCache {
    source: Arc<dyn Source>,
    schema: Arc<Schema>,
    readers: Mutex<LruCache<u64, Arc<ChunkReader>>>,
}

impl ChunkCache {
    pub fn new(source: Arc<dyn Source>, schema: Arc<Schema>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped above zero");
        Self {
            source,
            schema,
            readers: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch-and-decode through the cache.
    pub fn chunk(&self, id: u64, max_points: u64) -> Result<Arc<ChunkReader>> {
        if let Some(reader) = self.readers.lock().get(&id) {
            return Ok(Arc::clone(reader));
        }
        let blob = self.source.get(&id.to_string())?;
        let reader = Arc::new(ChunkReader::open(
            Arc::clone(&self.schema),
            id,
            max_points,
            &blob,
        )?);
        self.readers.lock().put(id, Arc::clone(&reader));
        Ok(reader)
    }
}

/// A finalized output: metadata plus cached chunk access.
pub struct Output {
    schema: Arc<Schema>,
    cache: ChunkCache,
    num_points: u64,
    num_ids: u64,
    first_chunk: u64,
    chunk_points: u64,
    ids: Vec<u64>,
}

impl Output {
    pub fn open(source: Arc<dyn Source>) -> Result<Self> {
        let meta: serde_json::Value = serde_json::from_str(&source.get_as_string("cairn")?)?;
        let schema: Schema = serde_json::from_value(meta["schema"].clone())?;
        let schema = Arc::new(schema);

        let field = |key: &str| -> Result<u64> {
            meta[key]
                .as_u64()
                .ok_or_else(|| IndexError::Serialization(format!("output meta missing {}", key)))
        };
        let num_points = field("numPoints")?;
        let num_ids = field("numIds")?;
        let first_chunk = field("firstChunk")?;
        let chunk_points = field("chunkPoints")?;

        let ids: Vec<u64> = serde_json::from_str(&source.get_as_string("ids")?)?;

        Ok(Self {
            cache: ChunkCache::new(source, Arc::clone(&schema), 32),
            schema,
            num_points,
            num_ids,
            first_chunk,
            chunk_points,
            ids,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    pub fn num_ids(&self) -> u64 {
        self.num_ids
    }

    pub fn first_chunk(&self) -> u64 {
        self.first_chunk
    }

    pub fn chunk_points(&self) -> u64 {
        self.chunk_points
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// The always-present base blob covering `[0, first_chunk)`.
    pub fn base(&self) -> Result<Arc<ChunkReader>> {
        self.cache.chunk(0, self.first_chunk)
    }

    /// One of the ids listed in the `ids` blob.
    pub fn chunk(&self, id: u64) -> Result<Arc<ChunkReader>> {
        self.cache.chunk(id, self.chunk_points)
    }

    /// Payload of the point at `index`, wherever it lives.
    pub fn point_data(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let reader = if index < self.first_chunk {
            self.base()?
        } else {
            let id = self.first_chunk
                + ((index - self.first_chunk) / self.chunk_points) * self.chunk_points;
            if !self.ids.contains(&id) {
                return Ok(None);
            }
            self.chunk(id)?
        };
        Ok(reader.point_data(index).map(|d| d.to_vec()))
    }

    /// Every blob the metadata references must resolve.
    pub fn verify(&self) -> Result<()> {
        self.base()?;
        for &id in &self.ids {
            let reader = self.chunk(id)?;
            if reader.num_points() == 0 {
                return Err(IndexError::Chunk(format!("listed chunk {} is empty", id)));
            }
        }
        if self.ids.len() as u64 != self.num_ids {
            return Err(IndexError::Serialization(format!(
                "ids blob lists {} chunks, meta says {}",
                self.ids.len(),
                self.num_ids
            )));
        }
        Ok(())
    }
}
