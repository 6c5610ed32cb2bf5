//! Registry: index-range dispatch over the storage branches
//!
//! The registry owns the three branches and drives the insertion walk: offer
//! the point at the roller's node, and while a branch hands a loser back,
//! step the roller into the loser's quadrant and offer again. A walk that
//! leaves the deepest branch discards the point.

use crate::error::{IndexError, Result};
use crate::pool::Pool;
use crate::storage::{compression, Source};
use crate::tree::branches::{BaseBranch, Clipper, DiskBranch, FlatBranch};
use crate::tree::chunk::{Insertion, TAG_CONTIGUOUS};
use crate::tree::{calc_offset, Roller};
use crate::types::{PointInfo, Schema};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

pub struct Registry {
    schema: Arc<Schema>,
    base: Option<BaseBranch>,
    flat: Option<FlatBranch>,
    disk: Option<DiskBranch>,
    base_depth: u64,
    flat_depth: u64,
    disk_depth: u64,
    /// One past the last index of the deepest branch.
    end: u64,
}

impl Registry {
    pub fn new(
        source: Arc<dyn Source>,
        schema: Arc<Schema>,
        chunk_points: u64,
        base_depth: u64,
        flat_depth: u64,
        disk_depth: u64,
    ) -> Result<Self> {
        if !(base_depth <= flat_depth && flat_depth <= disk_depth) {
            return Err(IndexError::Config(format!(
                "depths must be non-decreasing: base {} flat {} disk {}",
                base_depth, flat_depth, disk_depth
            )));
        }

        let base_end = calc_offset(base_depth);
        let flat_end = calc_offset(flat_depth);
        let disk_end = calc_offset(disk_depth);

        let base = (base_end > 0).then(|| BaseBranch::new(Arc::clone(&schema), base_end));
        let flat = (flat_end > base_end)
            .then(|| FlatBranch::new(Arc::clone(&schema), base_end, flat_end));
        let disk = (disk_end > flat_end).then(|| {
            DiskBranch::new(
                Arc::clone(&schema),
                Arc::clone(&source),
                flat_end,
                disk_end,
                chunk_points,
            )
        });

        Ok(Self {
            schema,
            base,
            flat,
            disk,
            base_depth,
            flat_depth,
            disk_depth,
            end: disk_end,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Total node capacity of the tree.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Route a point down the tree. Returns true iff it was accepted at some
    /// node; false means the walk fell off the bottom and the point is
    /// discarded.
    pub fn add_point(
        &self,
        info: PointInfo,
        mut roller: Roller,
        clipper: &mut Clipper,
    ) -> Result<bool> {
        let mut info = info;
        loop {
            if roller.index() >= self.end {
                return Ok(false);
            }
            let result = self.offer(info, &roller, clipper)?;
            match result {
                Insertion::Done => return Ok(true),
                Insertion::Swapped(loser) | Insertion::Rejected(loser) => {
                    roller.magnify(loser.point);
                    info = loser;
                }
            }
        }
    }

    fn offer(
        &self,
        info: PointInfo,
        roller: &Roller,
        clipper: &mut Clipper,
    ) -> Result<Insertion> {
        let index = roller.index();
        if let Some(base) = &self.base {
            if base.contains(index) {
                return Ok(base.add_point(info, roller));
            }
        }
        if let Some(flat) = &self.flat {
            if flat.contains(index) {
                return Ok(flat.add_point(info, roller));
            }
        }
        if let Some(disk) = &self.disk {
            if disk.contains(index) {
                return disk.add_point(info, roller, clipper);
            }
        }
        Err(IndexError::Chunk(format!(
            "index {} belongs to no branch",
            index
        )))
    }

    /// Forward a clipper release to the branch owning `chunk_id`.
    pub fn clip(&self, chunk_id: u64) -> Result<()> {
        if let Some(disk) = &self.disk {
            if disk.contains(chunk_id) {
                return disk.clip(chunk_id);
            }
        }
        // Base and flat branches are unconditionally resident.
        Ok(())
    }

    /// Payload of the resident point at `index`, if any.
    pub fn point_data(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let mut out = self.slice(index, index + 1)?;
        Ok(out.pop().flatten())
    }

    /// Payloads for `[start, end)` across all branches. Disk chunks load at
    /// most once per call.
    pub fn slice(&self, start: u64, end: u64) -> Result<Vec<Option<Vec<u8>>>> {
        let end = end.min(self.end);
        if start >= end {
            return Ok(Vec::new());
        }
        let mut out = vec![None; (end - start) as usize];
        if let Some(base) = &self.base {
            for raw in start..end {
                if base.contains(raw) {
                    out[(raw - start) as usize] = base.point_data(raw);
                }
            }
        }
        if let Some(flat) = &self.flat {
            for raw in start..end {
                if flat.contains(raw) {
                    out[(raw - start) as usize] = flat.point_data(raw);
                }
            }
        }
        if let Some(disk) = &self.disk {
            disk.read_into(start, end, start, &mut out)?;
        }
        Ok(out)
    }

    /// Resident points across all branches.
    pub fn num_points(&self) -> u64 {
        let mut n = 0;
        if let Some(base) = &self.base {
            n += base.num_points();
        }
        if let Some(flat) = &self.flat {
            n += flat.num_points();
        }
        // Disk points are counted through their blobs at finalize; the
        // resident subset is transient.
        n
    }

    /// Serialize every branch's state; dirty chunks hit disk here.
    pub fn save(&self, source: &dyn Source) -> Result<serde_json::Value> {
        let base = match &self.base {
            Some(b) => b.save(source)?,
            None => serde_json::Value::Null,
        };
        let flat = match &self.flat {
            Some(f) => f.save(source)?,
            None => serde_json::Value::Null,
        };
        let disk = match &self.disk {
            Some(d) => d.save()?,
            None => serde_json::Value::Null,
        };
        Ok(json!({
            "baseDepth": self.base_depth,
            "flatDepth": self.flat_depth,
            "diskDepth": self.disk_depth,
            "base": base,
            "flat": flat,
            "disk": disk,
        }))
    }

    /// Rebuild a registry from its serialized state.
    pub fn load(
        source: Arc<dyn Source>,
        schema: Arc<Schema>,
        chunk_points: u64,
        state: &serde_json::Value,
    ) -> Result<Self> {
        let depth = |key: &str| -> Result<u64> {
            state[key]
                .as_u64()
                .ok_or_else(|| IndexError::Serialization(format!("registry state missing {}", key)))
        };
        let base_depth = depth("baseDepth")?;
        let flat_depth = depth("flatDepth")?;
        let disk_depth = depth("diskDepth")?;

        let base_end = calc_offset(base_depth);
        let flat_end = calc_offset(flat_depth);
        let disk_end = calc_offset(disk_depth);

        let base = if base_end > 0 {
            Some(BaseBranch::load(
                Arc::clone(&schema),
                base_end,
                source.as_ref(),
                &state["base"],
            )?)
        } else {
            None
        };
        let flat = if flat_end > base_end {
            Some(FlatBranch::load(
                Arc::clone(&schema),
                base_end,
                flat_end,
                source.as_ref(),
                &state["flat"],
            )?)
        } else {
            None
        };
        let disk = if disk_end > flat_end {
            Some(DiskBranch::load(
                Arc::clone(&schema),
                Arc::clone(&source),
                flat_end,
                disk_end,
                chunk_points,
                &state["disk"],
            )?)
        } else {
            None
        };

        Ok(Self {
            schema,
            base,
            flat,
            disk,
            base_depth,
            flat_depth,
            disk_depth,
            end: disk_end,
        })
    }

    /// Rewrite the built tree into the portable output layout: one
    /// contiguous blob for `[0, base_end)` under key "0", then one blob per
    /// non-empty `chunk_points`-wide output chunk, named by its first index.
    /// Returns the ascending ids of the non-base chunks written.
    pub fn finalize(
        this: &Arc<Registry>,
        out: &Arc<dyn Source>,
        pool: &Pool,
        base_end: u64,
        chunk_points: u64,
        compress: bool,
    ) -> Result<Vec<u64>> {
        let total = this.end;

        let slots = this.slice(0, base_end.min(total))?;
        let blob = contiguous_blob(&this.schema, &slots, compress)?;
        out.put("0", &blob)?;

        let ids = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        pool.go();
        let mut start = base_end;
        while start < total {
            let span = chunk_points.min(total - start);
            let registry = Arc::clone(this);
            let out = Arc::clone(out);
            let ids = Arc::clone(&ids);
            let errors = Arc::clone(&errors);
            pool.add(move || {
                let run = (|| -> Result<()> {
                    let slots = registry.slice(start, start + span)?;
                    if slots.iter().all(|s| s.is_none()) {
                        return Ok(());
                    }
                    let blob = contiguous_blob(&registry.schema, &slots, compress)?;
                    out.put(&start.to_string(), &blob)?;
                    ids.lock().push(start);
                    Ok(())
                })();
                if let Err(e) = run {
                    errors.lock().push(e);
                }
            });
            start += span;
        }
        pool.join();

        let mut errors = errors.lock();
        if let Some(e) = errors.drain(..).next() {
            return Err(e);
        }
        let mut ids: Vec<u64> = ids.lock().drain(..).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Contiguous output frame: tag byte plus one record per slot, blanks filled
/// from the empty template.
fn contiguous_blob(
    schema: &Schema,
    slots: &[Option<Vec<u8>>],
    compress: bool,
) -> Result<Vec<u8>> {
    let empty = schema.empty_point();
    let mut frame = Vec::with_capacity(1 + slots.len() * schema.point_size());
    frame.push(TAG_CONTIGUOUS);
    for slot in slots {
        match slot {
            Some(data) => frame.extend_from_slice(data),
            None => frame.extend_from_slice(&empty),
        }
    }
    compression::pack(&frame, compress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, Point};
    use tempfile::TempDir;

    fn root_bbox() -> BBox {
        BBox::new(Point::new(0.0, 0.0), Point::new(16.0, 16.0))
    }

    fn record(schema: &Schema, p: Point) -> Vec<u8> {
        let mut data = schema.empty_point();
        schema.write_f64(&mut data, 0, p.x);
        schema.write_f64(&mut data, 1, p.y);
        schema.set_origin(&mut data, 0);
        data
    }

    fn registry(dir: &TempDir, base: u64, flat: u64, disk: u64) -> Arc<Registry> {
        let source: Arc<dyn Source> =
            Arc::new(crate::storage::LocalSource::new(dir.path()));
        let schema = Schema::xyz();
        Arc::new(Registry::new(source, schema, 16, base, flat, disk).unwrap())
    }

    fn insert(registry: &Arc<Registry>, clipper: &mut Clipper, p: Point) -> bool {
        let schema = Arc::clone(registry.schema());
        let info = PointInfo::new(p, record(&schema, p));
        registry
            .add_point(info, Roller::new(root_bbox()), clipper)
            .unwrap()
    }

    #[test]
    fn test_single_point_lands_at_root() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 2, 2, 2);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        assert!(insert(&registry, &mut clipper, Point::new(3.0, 5.0)));

        let schema = Arc::clone(registry.schema());
        let data = registry.point_data(0).unwrap().unwrap();
        assert_eq!(schema.point_of(&data), Point::new(3.0, 5.0));
        for index in 1..registry.end() {
            assert!(registry.point_data(index).unwrap().is_none());
        }
        clipper.release().unwrap();
    }

    #[test]
    fn test_equidistant_tie_descends_challenger() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 2, 2, 2);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        // Both are √98 from the center (8, 8); the incumbent keeps the root
        // and the newcomer lands in the ne child.
        assert!(insert(&registry, &mut clipper, Point::new(1.0, 1.0)));
        assert!(insert(&registry, &mut clipper, Point::new(15.0, 15.0)));

        let schema = Arc::clone(registry.schema());
        let root = registry.point_data(0).unwrap().unwrap();
        assert_eq!(schema.point_of(&root), Point::new(1.0, 1.0));
        let ne = registry.point_data(2).unwrap().unwrap();
        assert_eq!(schema.point_of(&ne), Point::new(15.0, 15.0));
        clipper.release().unwrap();
    }

    #[test]
    fn test_nearer_challenger_displaces_incumbent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 2, 2, 2);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        assert!(insert(&registry, &mut clipper, Point::new(1.0, 1.0)));
        assert!(insert(&registry, &mut clipper, Point::new(8.1, 8.1)));

        // (8.1, 8.1) takes the root; (1.0, 1.0) descends into sw.
        let schema = Arc::clone(registry.schema());
        let root = registry.point_data(0).unwrap().unwrap();
        assert_eq!(schema.point_of(&root), Point::new(8.1, 8.1));
        let sw = registry.point_data(3).unwrap().unwrap();
        assert_eq!(schema.point_of(&sw), Point::new(1.0, 1.0));
        clipper.release().unwrap();
    }

    #[test]
    fn test_exhaustion_discards_overflow() {
        let dir = TempDir::new().unwrap();
        // Four levels end-to-end: root-to-leaf capacity is 4.
        let registry = registry(&dir, 2, 3, 4);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        // Five identical points share one descent path; ties keep every
        // incumbent, so each new arrival sinks one level deeper.
        let mut accepted = 0;
        let mut tossed = 0;
        for _ in 0..5 {
            if insert(&registry, &mut clipper, Point::new(1.0, 1.0)) {
                accepted += 1;
            } else {
                tossed += 1;
            }
        }
        assert_eq!(accepted, 4);
        assert_eq!(tossed, 1);
        clipper.release().unwrap();
    }

    #[test]
    fn test_walk_spans_branches() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 1, 2, 4);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        // Same point over and over: fills root (base), one flat node, then
        // disk nodes.
        for _ in 0..4 {
            assert!(insert(&registry, &mut clipper, Point::new(1.0, 1.0)));
        }
        assert_eq!(clipper.len(), 2, "two disk chunks touched (nodes 15 and 63)");

        let schema = Arc::clone(registry.schema());
        for index in [0u64, 3, 15, 63] {
            let data = registry.point_data(index).unwrap().unwrap();
            assert_eq!(schema.point_of(&data), Point::new(1.0, 1.0));
        }
        clipper.release().unwrap();

        // Eviction wrote the chunks out; reads reload them transparently,
        // checksum-verified.
        for index in [15u64, 63] {
            let data = registry.point_data(index).unwrap().unwrap();
            assert_eq!(schema.point_of(&data), Point::new(1.0, 1.0));
        }
    }

    #[test]
    fn test_containment_at_every_stored_node() {
        use rand::{Rng, SeedableRng};

        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, 2, 3, 5);
        let mut clipper = Clipper::new(Arc::clone(&registry));

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let p = Point::new(rng.gen_range(0.0..16.0), rng.gen_range(0.0..16.0));
            insert(&registry, &mut clipper, p);
        }
        clipper.release().unwrap();

        // Every stored point sits inside the box its node subtends.
        let schema = Arc::clone(registry.schema());
        let mut seen = 0;
        for index in 0..registry.end() {
            if let Some(data) = registry.point_data(index).unwrap() {
                seen += 1;
                assert!(
                    node_bbox(root_bbox(), index).contains(schema.point_of(&data)),
                    "point at node {} escapes its box",
                    index
                );
            }
        }
        assert!(seen > 0);
    }

    /// Box subtended by `index`, rebuilt by replaying its root path.
    fn node_bbox(root: BBox, index: u64) -> BBox {
        let mut quadrants = Vec::new();
        let mut at = index;
        while at > 0 {
            quadrants.push((at - 1) % 4);
            at = (at - 1) / 4;
        }
        let mut roller = Roller::new(root);
        for q in quadrants.iter().rev() {
            match q {
                0 => roller.go_nw(),
                1 => roller.go_ne(),
                2 => roller.go_sw(),
                _ => roller.go_se(),
            }
        }
        roller.bbox()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let source: Arc<dyn Source> =
            Arc::new(crate::storage::LocalSource::new(dir.path()));
        let schema = Schema::xyz();
        let registry = Arc::new(
            Registry::new(Arc::clone(&source), Arc::clone(&schema), 8, 1, 2, 4).unwrap(),
        );
        let mut clipper = Clipper::new(Arc::clone(&registry));

        let points = [
            Point::new(1.0, 1.0),
            Point::new(15.0, 15.0),
            Point::new(4.0, 12.0),
            Point::new(9.0, 2.0),
            Point::new(1.1, 1.1),
            Point::new(1.2, 1.2),
            Point::new(1.3, 1.3),
        ];
        for p in points {
            let info = PointInfo::new(p, record(&schema, p));
            registry
                .add_point(info, Roller::new(root_bbox()), &mut clipper)
                .unwrap();
        }
        clipper.release().unwrap();

        let state = registry.save(source.as_ref()).unwrap();
        let loaded =
            Registry::load(Arc::clone(&source), Arc::clone(&schema), 8, &state).unwrap();

        for index in 0..registry.end() {
            assert_eq!(
                registry.point_data(index).unwrap(),
                loaded.point_data(index).unwrap(),
                "mismatch at node {}",
                index
            );
        }
    }
}
