//! Chunk storage: per-node entries over sparse or contiguous backing
//!
//! A chunk owns a contiguous range of `max_points` node slots starting at its
//! id. It begins life sparse (a map of touched slots) and converts once, in
//! place, to a contiguous byte buffer when occupancy crosses a fixed
//! threshold. Conversion never reverses.
//!
//! ## Entry protocol
//! Each slot pairs an atomic point cell with a mutex over its payload bytes.
//! Workers read the resident point's identity lock-free to decide a contest,
//! and take the entry lock only to mutate. All point-cell writes happen under
//! the entry lock, so a reader that observes a point and then acquires the
//! lock always sees the matching payload.
//!
//! ## On-disk form
//! The uncompressed blob is one tag byte (0 sparse, 1 contiguous) followed by
//! the body. Sparse body: `n` records of 8-byte LE local index plus payload,
//! then an 8-byte LE record count. Contiguous body: `max_points × point_size`
//! raw bytes in slot order. The whole frame goes through
//! [`compression::pack`] on the way out.

use crate::error::{IndexError, Result};
use crate::storage::compression;
use crate::types::{Point, PointInfo, Schema, INVALID_ORIGIN};
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};

/// Occupancy fraction at which a sparse chunk converts to contiguous.
pub const DENSIFY_THRESHOLD: f64 = 0.25;

pub(crate) const TAG_SPARSE: u8 = 0;
pub(crate) const TAG_CONTIGUOUS: u8 = 1;

/// Outcome of offering a point to a slot.
pub enum Insertion {
    /// The slot was empty and now holds the point.
    Done,
    /// The challenger was nearer to the node center; the old incumbent comes
    /// back out and must descend.
    Swapped(PointInfo),
    /// The incumbent stays (nearer, or tied); the challenger descends.
    Rejected(PointInfo),
}

/// Fixed block of payload bytes addressed through raw pointers held by
/// entries. Slot slices never overlap and each is guarded by its entry's
/// mutex, which is what makes shared access sound.
struct PayloadBuf {
    bytes: Box<[UnsafeCell<u8>]>,
}

unsafe impl Send for PayloadBuf {}
unsafe impl Sync for PayloadBuf {}

impl PayloadBuf {
    fn from_template(template: &[u8]) -> Self {
        Self {
            bytes: template.iter().map(|b| UnsafeCell::new(*b)).collect(),
        }
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        self.bytes[offset].get()
    }

    /// Whole-buffer view.
    ///
    /// # Safety
    /// No entry may be mutating its slot: call only at quiescence (save
    /// barrier, or eviction after the last clipper released the chunk).
    unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.bytes.as_ptr() as *const u8, self.bytes.len())
    }
}

/// Displaced point boxes parked until the chunk goes away. Keeping them
/// alive is what lets the lock-free incumbent read in [`Entry::insert`]
/// stay valid across a concurrent swap.
struct RetireBin {
    points: Mutex<Vec<*mut Point>>,
}

unsafe impl Send for RetireBin {}
unsafe impl Sync for RetireBin {}

impl RetireBin {
    fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
        }
    }

    fn retire(&self, p: *mut Point) {
        self.points.lock().push(p);
    }
}

impl Drop for RetireBin {
    fn drop(&mut self) {
        for p in self.points.get_mut().drain(..) {
            // Retired pointers are uniquely owned by the bin once parked.
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

/// One node slot: atomic point identity plus locked payload bytes.
pub struct Entry {
    point: AtomicPtr<Point>,
    lock: Mutex<()>,
    data: AtomicPtr<u8>,
}

impl Entry {
    fn empty(data: *mut u8) -> Self {
        Self {
            point: AtomicPtr::new(ptr::null_mut()),
            lock: Mutex::new(()),
            data: AtomicPtr::new(data),
        }
    }

    fn occupied(point: Point, data: *mut u8) -> Self {
        Self {
            point: AtomicPtr::new(Box::into_raw(Box::new(point))),
            lock: Mutex::new(()),
            data: AtomicPtr::new(data),
        }
    }

    /// Lock-free snapshot of the resident point, if any.
    pub fn point(&self) -> Option<Point> {
        let p = self.point.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            // Valid for the chunk's lifetime: displaced boxes are retired,
            // never freed, while the chunk lives.
            Some(unsafe { *p })
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Payload bytes of this slot; the entry lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub fn data<'a>(&self, _guard: &'a MutexGuard<'_, ()>, point_size: usize) -> &'a mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.data.load(Ordering::Acquire), point_size)
        }
    }

    /// Retarget the payload location. Both the chunk lock and this entry's
    /// lock must be held (densification only).
    fn set_data(&self, data: *mut u8, _guard: &MutexGuard<'_, ()>) {
        self.data.store(data, Ordering::Release);
    }

    /// Offer `info` to this slot, resolving contention by squared distance
    /// to the node `center` with the incumbent winning ties.
    pub(crate) fn insert(
        &self,
        info: PointInfo,
        center: Point,
        point_size: usize,
        bin: &RetireBin,
    ) -> Insertion {
        debug_assert_eq!(info.data.len(), point_size);
        loop {
            let cur = self.point.load(Ordering::Acquire);

            if cur.is_null() {
                let guard = self.lock.lock();
                // The slot may have been filled while we waited for the lock.
                if !self.point.load(Ordering::Acquire).is_null() {
                    drop(guard);
                    continue;
                }
                let fresh = Box::into_raw(Box::new(info.point));
                let raced = self
                    .point
                    .compare_exchange(
                        ptr::null_mut(),
                        fresh,
                        Ordering::Release,
                        Ordering::Acquire,
                    )
                    .is_err();
                debug_assert!(!raced, "point cell mutated outside the entry lock");
                self.data(&guard, point_size).copy_from_slice(&info.data);
                return Insertion::Done;
            }

            // Contended slot. The pointee stays valid (retire bin), so the
            // identity read needs no lock.
            let incumbent = unsafe { *cur };
            if info.point.sq_dist(center) >= incumbent.sq_dist(center) {
                return Insertion::Rejected(info);
            }

            let guard = self.lock.lock();
            if self.point.load(Ordering::Acquire) != cur {
                // A different challenger won the lock first; re-evaluate
                // against the new incumbent.
                drop(guard);
                continue;
            }
            let fresh = Box::into_raw(Box::new(info.point));
            let old = self.point.swap(fresh, Ordering::AcqRel);
            let slot = self.data(&guard, point_size);
            let displaced = PointInfo::new(incumbent, slot.to_vec());
            slot.copy_from_slice(&info.data);
            drop(guard);
            bin.retire(old);
            return Insertion::Swapped(displaced);
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let p = *self.point.get_mut();
        if !p.is_null() {
            // The current pointer is exclusively owned by this entry;
            // retired predecessors belong to the bin.
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

struct SparseSlot {
    data: PayloadBuf,
    entry: Arc<Entry>,
}

struct SparseChunkData {
    entries: HashMap<u64, SparseSlot>,
}

impl SparseChunkData {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn from_body(schema: &Schema, mut body: Vec<u8>) -> Result<Self> {
        let point_size = schema.point_size();
        if body.len() < 8 {
            return Err(IndexError::Chunk("sparse body missing count".into()));
        }
        let tail = body.split_off(body.len() - 8);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&tail);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let record = 8 + point_size;
        if body.len() != count * record {
            return Err(IndexError::Chunk(format!(
                "sparse body holds {} bytes, expected {} records of {}",
                body.len(),
                count,
                record
            )));
        }

        let mut entries = HashMap::with_capacity(count);
        for chunk in body.chunks(record) {
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&chunk[..8]);
            let local = u64::from_le_bytes(idx_bytes);
            let payload = &chunk[8..];

            let data = PayloadBuf::from_template(payload);
            let entry = Arc::new(Entry::occupied(schema.point_of(payload), data.ptr_at(0)));
            entries.insert(local, SparseSlot { data, entry });
        }
        Ok(Self { entries })
    }

    fn entry(&mut self, local: u64, schema: &Schema) -> Arc<Entry> {
        match self.entries.entry(local) {
            std::collections::hash_map::Entry::Occupied(slot) => Arc::clone(&slot.get().entry),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let data = PayloadBuf::from_template(&schema.empty_point());
                let entry = Arc::new(Entry::empty(data.ptr_at(0)));
                Arc::clone(&vacant.insert(SparseSlot { data, entry }).entry)
            }
        }
    }

    fn peek(&self, local: u64) -> Option<Arc<Entry>> {
        self.entries.get(&local).map(|s| Arc::clone(&s.entry))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn num_points(&self) -> u64 {
        self.entries
            .values()
            .filter(|s| s.entry.point().is_some())
            .count() as u64
    }

    /// Serialize at quiescence. Slots are emitted in local-index order;
    /// touched-but-empty slots are skipped.
    fn body(&self, point_size: usize) -> Vec<u8> {
        let mut locals: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, s)| s.entry.point().is_some())
            .map(|(local, _)| *local)
            .collect();
        locals.sort_unstable();

        let mut body = Vec::with_capacity(locals.len() * (8 + point_size) + 8);
        for local in &locals {
            let slot = &self.entries[local];
            body.extend_from_slice(&local.to_le_bytes());
            let guard = slot.entry.lock();
            body.extend_from_slice(slot.entry.data(&guard, point_size));
        }
        body.extend_from_slice(&(locals.len() as u64).to_le_bytes());
        body
    }
}

struct ContiguousChunkData {
    entries: Vec<Arc<Entry>>,
    data: PayloadBuf,
}

impl ContiguousChunkData {
    fn new(max_points: u64, empty: &[u8]) -> Self {
        let data = PayloadBuf::from_template(empty);
        let point_size = empty.len() / max_points as usize;
        let entries = (0..max_points as usize)
            .map(|i| Arc::new(Entry::empty(data.ptr_at(i * point_size))))
            .collect();
        Self { entries, data }
    }

    fn from_body(schema: &Schema, max_points: u64, body: Vec<u8>) -> Result<Self> {
        let point_size = schema.point_size();
        if body.len() != max_points as usize * point_size {
            return Err(IndexError::Chunk(format!(
                "contiguous body holds {} bytes, expected {}",
                body.len(),
                max_points as usize * point_size
            )));
        }

        let data = PayloadBuf::from_template(&body);
        let entries = (0..max_points as usize)
            .map(|i| {
                let record = &body[i * point_size..(i + 1) * point_size];
                let at = data.ptr_at(i * point_size);
                if schema.origin_of(record) == INVALID_ORIGIN {
                    Arc::new(Entry::empty(at))
                } else {
                    Arc::new(Entry::occupied(schema.point_of(record), at))
                }
            })
            .collect();
        Ok(Self { entries, data })
    }

    /// One-shot densification. Runs under the chunk lock; takes each grafted
    /// entry's lock to move its payload, so in-flight writers either land in
    /// the old buffer before the move or in the new one after it.
    fn from_sparse(sparse: SparseChunkData, point_size: usize, max_points: u64, empty: &[u8]) -> Self {
        let fresh = Self::new(max_points, empty);
        let mut entries = fresh.entries;
        let data = fresh.data;

        for (local, slot) in sparse.entries {
            let dst = data.ptr_at(local as usize * point_size);
            {
                let guard = slot.entry.lock();
                let src = slot.entry.data(&guard, point_size);
                // Disjoint buffers; the destination slot is not yet shared.
                unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, point_size) };
                slot.entry.set_data(dst, &guard);
            }
            // The slot's own buffer is unreferenced from here on.
            entries[local as usize] = slot.entry;
        }

        Self { entries, data }
    }

    fn entry(&self, local: u64) -> Arc<Entry> {
        Arc::clone(&self.entries[local as usize])
    }

    fn num_points(&self) -> u64 {
        self.entries.iter().filter(|e| e.point().is_some()).count() as u64
    }

    /// # Safety
    /// Quiescence required; see [`PayloadBuf::as_slice`].
    unsafe fn body(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// A resident chunk of `max_points` node slots starting at index `id`.
pub struct Chunk {
    schema: Arc<Schema>,
    id: u64,
    max_points: u64,
    empty: Arc<[u8]>,
    sparse: Mutex<Option<SparseChunkData>>,
    dense: OnceLock<ContiguousChunkData>,
    converted: AtomicBool,
    dirty: AtomicBool,
    retired: RetireBin,
}

impl Chunk {
    /// Fresh chunk with no on-disk counterpart.
    pub fn new_sparse(schema: Arc<Schema>, id: u64, max_points: u64, empty: Arc<[u8]>) -> Self {
        Self {
            schema,
            id,
            max_points,
            empty,
            sparse: Mutex::new(Some(SparseChunkData::new())),
            dense: OnceLock::new(),
            converted: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            retired: RetireBin::new(),
        }
    }

    /// Fresh chunk born contiguous (base branch storage).
    pub fn new_contiguous(schema: Arc<Schema>, id: u64, max_points: u64, empty: Arc<[u8]>) -> Self {
        let dense = ContiguousChunkData::new(max_points, &empty);
        let cell = OnceLock::new();
        let _ = cell.set(dense);
        Self {
            schema,
            id,
            max_points,
            empty,
            sparse: Mutex::new(None),
            dense: cell,
            converted: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            retired: RetireBin::new(),
        }
    }

    /// Rebuild a chunk from its on-disk blob; the tag byte picks the
    /// representation.
    pub fn from_blob(
        schema: Arc<Schema>,
        id: u64,
        max_points: u64,
        empty: Arc<[u8]>,
        blob: &[u8],
    ) -> Result<Self> {
        let frame = compression::unpack(blob)?;
        let (&tag, body) = frame
            .split_first()
            .ok_or_else(|| IndexError::Chunk("empty chunk frame".into()))?;

        match tag {
            TAG_SPARSE => {
                let sparse = SparseChunkData::from_body(&schema, body.to_vec())?;
                Ok(Self {
                    schema,
                    id,
                    max_points,
                    empty,
                    sparse: Mutex::new(Some(sparse)),
                    dense: OnceLock::new(),
                    converted: AtomicBool::new(false),
                    dirty: AtomicBool::new(false),
                    retired: RetireBin::new(),
                })
            }
            TAG_CONTIGUOUS => {
                let dense = ContiguousChunkData::from_body(&schema, max_points, body.to_vec())?;
                let cell = OnceLock::new();
                let _ = cell.set(dense);
                Ok(Self {
                    schema,
                    id,
                    max_points,
                    empty,
                    sparse: Mutex::new(None),
                    dense: cell,
                    converted: AtomicBool::new(true),
                    dirty: AtomicBool::new(false),
                    retired: RetireBin::new(),
                })
            }
            other => Err(IndexError::Chunk(format!("unknown chunk tag {}", other))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn is_sparse(&self) -> bool {
        !self.converted.load(Ordering::Acquire)
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Resident slot for `raw` (absolute node index). Sparse lookups create
    /// the slot and may trigger densification; contiguous lookups take no
    /// chunk-level lock.
    pub fn get_entry(&self, raw: u64) -> Arc<Entry> {
        let local = self.normalize(raw);

        if self.converted.load(Ordering::Acquire) {
            if let Some(dense) = self.dense.get() {
                return dense.entry(local);
            }
        }

        let mut guard = self.sparse.lock();
        let mut found = None;
        if let Some(sparse) = guard.as_mut() {
            let entry = sparse.entry(local, &self.schema);
            found = Some((entry, sparse.len() as u64));
        }
        match found {
            None => {
                // Converted while we waited on the chunk lock.
                drop(guard);
                self.dense
                    .get()
                    .expect("sparse chunks convert under the chunk lock")
                    .entry(local)
            }
            Some((entry, occupied)) => {
                if occupied >= self.densify_at() {
                    let taken = guard.take().expect("sparse state present");
                    let dense = ContiguousChunkData::from_sparse(
                        taken,
                        self.schema.point_size(),
                        self.max_points,
                        &self.empty,
                    );
                    let installed = self.dense.set(dense).is_ok();
                    debug_assert!(installed, "densification happens once");
                    self.converted.store(true, Ordering::Release);
                }
                entry
            }
        }
    }

    /// Offer a point to the slot at `raw`, contested by distance to `center`.
    pub fn add_point(&self, raw: u64, info: PointInfo, center: Point) -> Insertion {
        let entry = self.get_entry(raw);
        let result = entry.insert(info, center, self.schema.point_size(), &self.retired);
        if !matches!(result, Insertion::Rejected(_)) {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Existing slot for `raw` without creating one.
    pub fn peek_entry(&self, raw: u64) -> Option<Arc<Entry>> {
        let local = self.normalize(raw);
        if let Some(dense) = self.dense.get() {
            if self.converted.load(Ordering::Acquire) {
                return Some(dense.entry(local));
            }
        }
        let guard = self.sparse.lock();
        if let Some(sparse) = guard.as_ref() {
            return sparse.peek(local);
        }
        drop(guard);
        self.dense.get().map(|d| d.entry(local))
    }

    /// Copy of the payload at `raw` if the slot holds a point.
    pub fn point_data(&self, raw: u64) -> Option<Vec<u8>> {
        let entry = self.peek_entry(raw)?;
        entry.point()?;
        let guard = entry.lock();
        Some(entry.data(&guard, self.schema.point_size()).to_vec())
    }

    pub fn num_points(&self) -> u64 {
        if let Some(dense) = self.dense.get() {
            if self.converted.load(Ordering::Acquire) {
                return dense.num_points();
            }
        }
        let guard = self.sparse.lock();
        if let Some(sparse) = guard.as_ref() {
            return sparse.num_points();
        }
        drop(guard);
        self.dense.get().map(|d| d.num_points()).unwrap_or(0)
    }

    /// On-disk frame of the current state. Call only at quiescence.
    pub fn blob(&self, compress: bool) -> Result<Vec<u8>> {
        let guard = self.sparse.lock();
        if let Some(sparse) = guard.as_ref() {
            let mut frame =
                Vec::with_capacity(1 + sparse.len() * (8 + self.schema.point_size()));
            frame.push(TAG_SPARSE);
            frame.extend_from_slice(&sparse.body(self.schema.point_size()));
            return compression::pack(&frame, compress);
        }
        drop(guard);

        let dense = self
            .dense
            .get()
            .expect("sparse chunks convert under the chunk lock");
        let mut frame = Vec::with_capacity(1 + self.empty.len());
        frame.push(TAG_CONTIGUOUS);
        // Quiescence is the caller's contract.
        frame.extend_from_slice(unsafe { dense.body() });
        compression::pack(&frame, compress)
    }

    fn normalize(&self, raw: u64) -> u64 {
        debug_assert!(
            raw >= self.id && raw < self.id + self.max_points,
            "index {} outside chunk [{}, {})",
            raw,
            self.id,
            self.id + self.max_points
        );
        raw - self.id
    }

    fn densify_at(&self) -> u64 {
        ((self.max_points as f64) * DENSIFY_THRESHOLD).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schema;

    fn record(schema: &Schema, x: f64, y: f64, origin: u64) -> Vec<u8> {
        let mut data = schema.empty_point();
        schema.write_f64(&mut data, 0, x);
        schema.write_f64(&mut data, 1, y);
        schema.set_origin(&mut data, origin);
        data
    }

    fn info(schema: &Schema, x: f64, y: f64) -> PointInfo {
        PointInfo::new(Point::new(x, y), record(schema, x, y, 0))
    }

    fn sparse_chunk(schema: &Arc<Schema>, id: u64, max_points: u64) -> Chunk {
        let empty = schema.empty_chunk(max_points);
        Chunk::new_sparse(Arc::clone(schema), id, max_points, empty)
    }

    #[test]
    fn test_fill_and_coherence() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 0, 16);
        let center = Point::new(8.0, 8.0);

        assert!(matches!(
            chunk.add_point(3, info(&schema, 1.0, 2.0), center),
            Insertion::Done
        ));

        let entry = chunk.peek_entry(3).unwrap();
        assert_eq!(entry.point(), Some(Point::new(1.0, 2.0)));
        let guard = entry.lock();
        let data = entry.data(&guard, schema.point_size());
        assert_eq!(schema.point_of(data), Point::new(1.0, 2.0));
    }

    #[test]
    fn test_nearer_challenger_displaces() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 0, 16);
        let center = Point::new(8.0, 8.0);

        chunk.add_point(0, info(&schema, 1.0, 1.0), center);
        match chunk.add_point(0, info(&schema, 8.1, 8.1), center) {
            Insertion::Swapped(loser) => {
                assert_eq!(loser.point, Point::new(1.0, 1.0));
                assert_eq!(schema.point_of(&loser.data), Point::new(1.0, 1.0));
            }
            _ => panic!("nearer challenger must displace"),
        }
        let entry = chunk.peek_entry(0).unwrap();
        assert_eq!(entry.point(), Some(Point::new(8.1, 8.1)));
    }

    #[test]
    fn test_tie_keeps_incumbent() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 0, 16);
        let center = Point::new(8.0, 8.0);

        chunk.add_point(0, info(&schema, 1.0, 1.0), center);
        // (15, 15) is equidistant from the center; incumbent stays.
        match chunk.add_point(0, info(&schema, 15.0, 15.0), center) {
            Insertion::Rejected(loser) => assert_eq!(loser.point, Point::new(15.0, 15.0)),
            _ => panic!("tie must keep the incumbent"),
        }
        let entry = chunk.peek_entry(0).unwrap();
        assert_eq!(entry.point(), Some(Point::new(1.0, 1.0)));
    }

    #[test]
    fn test_densification_at_threshold() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 0, 16);
        let center = Point::new(8.0, 8.0);

        // Threshold 0.25 of 16: the fourth distinct slot converts the chunk.
        for (i, raw) in [2u64, 5, 9, 13].iter().enumerate() {
            assert!(chunk.is_sparse(), "still sparse before insert {}", i);
            chunk.add_point(*raw, info(&schema, *raw as f64, 1.0), center);
        }
        assert!(!chunk.is_sparse());

        // All four payloads intact after conversion.
        for raw in [2u64, 5, 9, 13] {
            let data = chunk.point_data(raw).unwrap();
            assert_eq!(schema.point_of(&data), Point::new(raw as f64, 1.0));
        }
        assert_eq!(chunk.num_points(), 4);
        assert!(chunk.point_data(3).is_none());
    }

    #[test]
    fn test_entry_identity_survives_densification() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 0, 16);
        let center = Point::new(8.0, 8.0);

        chunk.add_point(7, info(&schema, 3.0, 3.0), center);
        let before = chunk.peek_entry(7).unwrap();
        for raw in [1u64, 4, 11] {
            chunk.add_point(raw, info(&schema, raw as f64, 0.0), center);
        }
        assert!(!chunk.is_sparse());
        let after = chunk.peek_entry(7).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_sparse_blob_round_trip() {
        let schema = Schema::xyz();
        let chunk = sparse_chunk(&schema, 64, 32);
        let center = Point::new(8.0, 8.0);
        chunk.add_point(70, info(&schema, 2.5, 3.5), center);
        chunk.add_point(90, info(&schema, -1.0, 4.0), center);

        let blob = chunk.blob(true).unwrap();
        let loaded = Chunk::from_blob(
            Arc::clone(&schema),
            64,
            32,
            schema.empty_chunk(32),
            &blob,
        )
        .unwrap();

        assert!(loaded.is_sparse());
        assert_eq!(loaded.num_points(), 2);
        assert_eq!(
            schema.point_of(&loaded.point_data(70).unwrap()),
            Point::new(2.5, 3.5)
        );
        assert_eq!(
            schema.point_of(&loaded.point_data(90).unwrap()),
            Point::new(-1.0, 4.0)
        );
        assert!(loaded.point_data(80).is_none());
    }

    #[test]
    fn test_contiguous_blob_round_trip() {
        let schema = Schema::xyz();
        let empty = schema.empty_chunk(8);
        let chunk = Chunk::new_contiguous(Arc::clone(&schema), 8, 8, Arc::clone(&empty));
        let center = Point::new(8.0, 8.0);
        chunk.add_point(9, info(&schema, 6.0, 6.0), center);

        let blob = chunk.blob(true).unwrap();
        let loaded = Chunk::from_blob(Arc::clone(&schema), 8, 8, empty, &blob).unwrap();

        assert!(!loaded.is_sparse());
        assert_eq!(loaded.num_points(), 1);
        assert_eq!(
            schema.point_of(&loaded.point_data(9).unwrap()),
            Point::new(6.0, 6.0)
        );
        // Blank slots come back blank, not as phantom (0, 0) points.
        assert!(loaded.point_data(8).is_none());
        assert!(loaded.peek_entry(10).unwrap().point().is_none());
    }

    #[test]
    fn test_sparse_dense_equivalence() {
        let schema = Schema::xyz();
        let center = Point::new(8.0, 8.0);

        // Same inserts, one chunk starting sparse (and converting), one dense.
        let via_sparse = sparse_chunk(&schema, 0, 16);
        let direct = Chunk::new_contiguous(Arc::clone(&schema), 0, 16, schema.empty_chunk(16));
        for raw in [0u64, 3, 6, 9, 12, 15] {
            let x = raw as f64 * 0.5;
            via_sparse.add_point(raw, info(&schema, x, 2.0), center);
            direct.add_point(raw, info(&schema, x, 2.0), center);
        }
        assert!(!via_sparse.is_sparse());

        for raw in 0..16u64 {
            assert_eq!(via_sparse.point_data(raw), direct.point_data(raw));
        }
    }

    #[test]
    fn test_concurrent_contention_single_slot() {
        use std::thread;

        let schema = Schema::xyz();
        let chunk = Arc::new(sparse_chunk(&schema, 0, 16));
        let center = Point::new(0.0, 0.0);

        let mut handles = Vec::new();
        for t in 0..8u64 {
            let chunk = Arc::clone(&chunk);
            let schema = Arc::clone(&schema);
            handles.push(thread::spawn(move || {
                let mut kept = 0usize;
                let mut displaced = Vec::new();
                for k in 0..100u64 {
                    let x = 1.0 + ((t * 100 + k) % 37) as f64;
                    match chunk.add_point(0, info(&schema, x, 0.0), center) {
                        Insertion::Done => kept += 1,
                        Insertion::Swapped(p) | Insertion::Rejected(p) => displaced.push(p),
                    }
                }
                (kept, displaced.len())
            }));
        }

        let mut filled = 0usize;
        let mut bounced = 0usize;
        for h in handles {
            let (kept, out) = h.join().unwrap();
            filled += kept;
            bounced += out;
        }

        // Exactly one fill; every other offer came back out.
        assert_eq!(filled, 1);
        assert_eq!(bounced, 8 * 100 - 1);

        // Terminal state: resident point is the nearest ever offered, and the
        // payload matches it.
        let entry = chunk.peek_entry(0).unwrap();
        let point = entry.point().unwrap();
        assert_eq!(point, Point::new(1.0, 0.0));
        let guard = entry.lock();
        assert_eq!(schema.point_of(entry.data(&guard, schema.point_size())), point);
    }
}
