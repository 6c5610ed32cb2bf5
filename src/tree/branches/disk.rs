//! Disk branch: the lazily resident bottom of the tree
//!
//! Indices map to fixed-width chunks:
//! `chunk_id = offset + ((index − offset) / chunk_points) × chunk_points`.
//! A chunk is resident only while some clipper references it; the first
//! lookup under a chunk id fetches and decompresses its blob (or starts a
//! fresh sparse chunk if none was ever written), and the last clipper release
//! compresses and writes it back out, then drops it from the map.
//!
//! The chunk map is guarded by one mutex, fetches included, so a blob is
//! never loaded twice by racing workers.

use crate::error::Result;
use crate::storage::{compression, Source};
use crate::tree::branches::Clipper;
use crate::tree::chunk::{Chunk, Insertion};
use crate::tree::Roller;
use crate::types::{PointInfo, Schema};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::Arc;

struct ChunkSlot {
    chunk: Arc<Chunk>,
    /// Live clippers referencing this chunk.
    refs: usize,
}

pub struct DiskBranch {
    schema: Arc<Schema>,
    source: Arc<dyn Source>,
    offset: u64,
    end: u64,
    chunk_points: u64,
    /// Shared zero template for full-width chunks; the tail chunk (if the
    /// range is not a multiple of `chunk_points`) builds its own.
    empty: Arc<[u8]>,
    chunks: Mutex<HashMap<u64, ChunkSlot>>,
    /// Every chunk id ever written, with the checksum of its blob.
    written: Mutex<HashMap<u64, u32>>,
}

impl DiskBranch {
    pub fn new(
        schema: Arc<Schema>,
        source: Arc<dyn Source>,
        offset: u64,
        end: u64,
        chunk_points: u64,
    ) -> Self {
        let empty = schema.empty_chunk(chunk_points);
        Self {
            schema,
            source,
            offset,
            end,
            chunk_points,
            empty,
            chunks: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.offset && index < self.end
    }

    pub fn chunk_id_of(&self, index: u64) -> u64 {
        self.offset + ((index - self.offset) / self.chunk_points) * self.chunk_points
    }

    fn chunk_span(&self, chunk_id: u64) -> u64 {
        self.chunk_points.min(self.end - chunk_id)
    }

    pub fn add_point(
        &self,
        info: PointInfo,
        roller: &Roller,
        clipper: &mut Clipper,
    ) -> Result<Insertion> {
        let index = roller.index();
        let chunk = self.acquire(index, clipper)?;
        Ok(chunk.add_point(index, info, roller.bbox().center()))
    }

    /// Resident chunk for `index`, fetched if necessary and pinned through
    /// `clipper`.
    fn acquire(&self, index: u64, clipper: &mut Clipper) -> Result<Arc<Chunk>> {
        let chunk_id = self.chunk_id_of(index);
        let mut map = self.chunks.lock();
        let slot = match map.entry(chunk_id) {
            MapEntry::Occupied(occupied) => occupied.into_mut(),
            MapEntry::Vacant(vacant) => {
                let chunk = self.fetch(chunk_id)?;
                vacant.insert(ChunkSlot {
                    chunk: Arc::new(chunk),
                    refs: 0,
                })
            }
        };
        if clipper.insert(chunk_id) {
            slot.refs += 1;
        }
        Ok(Arc::clone(&slot.chunk))
    }

    fn fetch(&self, chunk_id: u64) -> Result<Chunk> {
        let span = self.chunk_span(chunk_id);
        let empty = if span == self.chunk_points {
            Arc::clone(&self.empty)
        } else {
            self.schema.empty_chunk(span)
        };

        let recorded = self.written.lock().get(&chunk_id).copied();
        match recorded {
            Some(checksum) => {
                let blob = self.source.get(&chunk_id.to_string())?;
                compression::verify(chunk_id, &blob, checksum)?;
                tracing::debug!(chunk = chunk_id, "chunk fetched");
                Chunk::from_blob(Arc::clone(&self.schema), chunk_id, span, empty, &blob)
            }
            None => Ok(Chunk::new_sparse(
                Arc::clone(&self.schema),
                chunk_id,
                span,
                empty,
            )),
        }
    }

    /// One clipper released `chunk_id`. Dropping the last reference evicts
    /// the chunk, writing it out first if it holds anything.
    pub fn clip(&self, chunk_id: u64) -> Result<()> {
        let mut map = self.chunks.lock();
        let evict = match map.get_mut(&chunk_id) {
            Some(slot) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0
            }
            None => false,
        };
        if !evict {
            return Ok(());
        }
        if let Some(slot) = map.remove(&chunk_id) {
            self.store(&slot.chunk)?;
            tracing::debug!(chunk = chunk_id, "chunk evicted");
        }
        Ok(())
    }

    fn store(&self, chunk: &Chunk) -> Result<()> {
        if !chunk.dirty() || chunk.num_points() == 0 {
            return Ok(());
        }
        let blob = chunk.blob(true)?;
        let checksum = compression::checksum(&blob);
        self.source.put(&chunk.id().to_string(), &blob)?;
        self.written.lock().insert(chunk.id(), checksum);
        Ok(())
    }

    /// Read-only view of a chunk for the finalize pass: resident if pinned,
    /// otherwise loaded transiently, `None` if never written.
    pub fn readonly_chunk(&self, chunk_id: u64) -> Result<Option<Arc<Chunk>>> {
        if let Some(slot) = self.chunks.lock().get(&chunk_id) {
            return Ok(Some(Arc::clone(&slot.chunk)));
        }
        let checksum = match self.written.lock().get(&chunk_id).copied() {
            Some(c) => c,
            None => return Ok(None),
        };
        let blob = self.source.get(&chunk_id.to_string())?;
        compression::verify(chunk_id, &blob, checksum)?;
        let span = self.chunk_span(chunk_id);
        let empty = self.schema.empty_chunk(span);
        Ok(Some(Arc::new(Chunk::from_blob(
            Arc::clone(&self.schema),
            chunk_id,
            span,
            empty,
            &blob,
        )?)))
    }

    /// Fill `out` (indexed from `out_base`) with payloads for the slice
    /// `[start, end)` of this branch's range.
    pub fn read_into(
        &self,
        start: u64,
        end: u64,
        out_base: u64,
        out: &mut [Option<Vec<u8>>],
    ) -> Result<()> {
        let lo = start.max(self.offset);
        let hi = end.min(self.end);
        if lo >= hi {
            return Ok(());
        }
        let mut chunk_id = self.chunk_id_of(lo);
        while chunk_id < hi {
            let span_end = chunk_id + self.chunk_span(chunk_id);
            if let Some(chunk) = self.readonly_chunk(chunk_id)? {
                for raw in lo.max(chunk_id)..hi.min(span_end) {
                    out[(raw - out_base) as usize] = chunk.point_data(raw);
                }
            }
            chunk_id += self.chunk_points;
        }
        Ok(())
    }

    /// Write out every resident dirty chunk without evicting it, then report
    /// branch state.
    pub fn save(&self) -> Result<serde_json::Value> {
        {
            let map = self.chunks.lock();
            for slot in map.values() {
                self.store(&slot.chunk)?;
            }
        }

        let written = self.written.lock();
        let mut ids: Vec<u64> = written.keys().copied().collect();
        ids.sort_unstable();
        let checksums: serde_json::Map<String, serde_json::Value> = written
            .iter()
            .map(|(id, crc)| (id.to_string(), json!(crc)))
            .collect();
        Ok(json!({ "ids": ids, "checksums": checksums }))
    }

    pub fn load(
        schema: Arc<Schema>,
        source: Arc<dyn Source>,
        offset: u64,
        end: u64,
        chunk_points: u64,
        state: &serde_json::Value,
    ) -> Result<Self> {
        let branch = Self::new(schema, source, offset, end, chunk_points);
        if let Some(checksums) = state["checksums"].as_object() {
            let mut written = branch.written.lock();
            for (id, crc) in checksums {
                let id: u64 = id.parse().map_err(|_| {
                    crate::error::IndexError::Serialization(format!(
                        "bad chunk id in registry state: {}",
                        id
                    ))
                })?;
                let crc = crc.as_u64().ok_or_else(|| {
                    crate::error::IndexError::Serialization("bad chunk checksum".into())
                })? as u32;
                written.insert(id, crc);
            }
        }
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalSource;
    use crate::tree::{Registry, Roller};
    use crate::types::{BBox, Point};
    use tempfile::TempDir;

    #[test]
    fn test_chunk_id_mapping() {
        let dir = TempDir::new().unwrap();
        let source: Arc<dyn Source> = Arc::new(LocalSource::new(dir.path()));
        let branch = DiskBranch::new(Schema::xyz(), source, 21, 85, 16);

        assert_eq!(branch.chunk_id_of(21), 21);
        assert_eq!(branch.chunk_id_of(36), 21);
        assert_eq!(branch.chunk_id_of(37), 37);
        assert_eq!(branch.chunk_id_of(84), 69);
        assert_eq!(branch.chunk_span(69), 16);
    }

    #[test]
    fn test_refcount_holds_chunk_until_last_release() {
        let dir = TempDir::new().unwrap();
        let source: Arc<dyn Source> = Arc::new(LocalSource::new(dir.path()));
        let schema = Schema::xyz();
        let bbox = BBox::new(Point::new(0.0, 0.0), Point::new(16.0, 16.0));

        // Disk-only registry: one chunk covers nodes [0, 4).
        let registry = Arc::new(
            Registry::new(Arc::clone(&source), Arc::clone(&schema), 4, 0, 0, 2).unwrap(),
        );
        let mut first = Clipper::new(Arc::clone(&registry));
        let mut second = Clipper::new(Arc::clone(&registry));

        let offer = |clipper: &mut Clipper| {
            let p = Point::new(1.0, 1.0);
            let mut data = schema.empty_point();
            schema.write_f64(&mut data, 0, p.x);
            schema.write_f64(&mut data, 1, p.y);
            schema.set_origin(&mut data, 0);
            registry
                .add_point(PointInfo::new(p, data), Roller::new(bbox), clipper)
                .unwrap()
        };

        assert!(offer(&mut first));
        assert!(offer(&mut second));

        // One release keeps the chunk resident and unwritten.
        first.release().unwrap();
        assert!(source.get("0").is_err());

        // The last release evicts and writes.
        second.release().unwrap();
        assert!(source.get("0").is_ok());
    }
}
