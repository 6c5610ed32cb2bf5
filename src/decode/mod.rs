//! Input decoding: format inference, the per-point sink, reprojection seam
//!
//! Decoders turn an input file into a stream of fixed-width records pushed
//! into a [`PointSink`]. The sink batches records in a bounded scratch
//! buffer; each time the buffer fills it applies the optional coordinate
//! transform in place and hands the view to its target for insertion. The
//! sink is the mutable per-file state — decoders stay stateless beyond their
//! own file cursor.

mod xyz;

pub use xyz::XyzDecoder;

use crate::error::{IndexError, Result};
use crate::types::Schema;
use std::path::Path;
use std::sync::Arc;

/// Scratch budget per flush, in bytes.
pub const CHUNK_BYTES: usize = 65536;

/// A recognized input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Xyz,
}

impl DecoderKind {
    pub fn open(&self, local_path: &str, schema: Arc<Schema>) -> Box<dyn Decoder> {
        match self {
            DecoderKind::Xyz => Box::new(XyzDecoder::new(local_path, schema)),
        }
    }
}

/// Pick a decoder for `path` by extension. `None` means the input goes into
/// the manifest as an omission.
pub fn infer(path: &str) -> Option<DecoderKind> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "xyz" | "txt" => Some(DecoderKind::Xyz),
        _ => None,
    }
}

pub trait Decoder {
    /// Decode the whole input, pushing every record into `sink`. The caller
    /// flushes the sink afterwards; leftover records are not lost.
    fn execute(&mut self, sink: &mut PointSink<'_>) -> Result<()>;
}

/// In-place coordinate transform applied between decode and insertion.
/// Reprojection engines implement this; the engine core only needs the
/// seam.
pub trait Transform: Send + Sync {
    fn transform(&self, xyz: &mut [f64; 3]);
}

/// Transform that records the SRS pair and passes coordinates through.
/// Stands in wherever no projection engine is plugged.
pub struct PassThrough {
    pub in_srs: String,
    pub out_srs: String,
}

impl Transform for PassThrough {
    fn transform(&self, _xyz: &mut [f64; 3]) {}
}

/// Receives filled scratch views for insertion.
pub trait ViewTarget {
    fn insert_view(&mut self, view: &mut [u8]) -> Result<()>;
}

/// Bounded record accumulator between a decoder and the insertion path.
pub struct PointSink<'a> {
    schema: Arc<Schema>,
    transform: Option<&'a dyn Transform>,
    target: &'a mut dyn ViewTarget,
    scratch: Vec<u8>,
    x_dim: usize,
    y_dim: usize,
    z_dim: Option<usize>,
}

impl<'a> PointSink<'a> {
    pub fn new(
        schema: Arc<Schema>,
        transform: Option<&'a dyn Transform>,
        target: &'a mut dyn ViewTarget,
    ) -> Self {
        // X and Y are schema invariants; Z is optional payload.
        let x_dim = schema.find_dim("X").unwrap_or(0);
        let y_dim = schema.find_dim("Y").unwrap_or(1);
        let z_dim = schema.find_dim("Z");
        let point_size = schema.point_size();
        Self {
            schema,
            transform,
            target,
            scratch: Vec::with_capacity(CHUNK_BYTES + point_size),
            x_dim,
            y_dim,
            z_dim,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Append one record; flushes when the scratch budget is reached.
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.schema.point_size() {
            return Err(IndexError::Decode(format!(
                "record is {} bytes, schema holds {}",
                record.len(),
                self.schema.point_size()
            )));
        }
        self.scratch.extend_from_slice(record);
        if self.scratch.len() >= CHUNK_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    /// Transform and insert everything accumulated so far.
    pub fn flush(&mut self) -> Result<()> {
        if self.scratch.is_empty() {
            return Ok(());
        }
        if let Some(transform) = self.transform {
            let point_size = self.schema.point_size();
            for record in self.scratch.chunks_mut(point_size) {
                let mut xyz = [
                    read_dim(&self.schema, record, self.x_dim),
                    read_dim(&self.schema, record, self.y_dim),
                    self.z_dim.map_or(0.0, |z| read_dim(&self.schema, record, z)),
                ];
                transform.transform(&mut xyz);
                self.schema.write_f64(record, self.x_dim, xyz[0]);
                self.schema.write_f64(record, self.y_dim, xyz[1]);
                if let Some(z) = self.z_dim {
                    self.schema.write_f64(record, z, xyz[2]);
                }
            }
        }
        self.target.insert_view(&mut self.scratch)?;
        self.scratch.clear();
        Ok(())
    }
}

fn read_dim(schema: &Schema, record: &[u8], dim: usize) -> f64 {
    let at = schema.offset(dim);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[at..at + 8]);
    f64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        views: Vec<Vec<u8>>,
    }

    impl ViewTarget for Collect {
        fn insert_view(&mut self, view: &mut [u8]) -> Result<()> {
            self.views.push(view.to_vec());
            Ok(())
        }
    }

    fn record(schema: &Schema, x: f64, y: f64, z: f64) -> Vec<u8> {
        let mut data = schema.empty_point();
        schema.write_f64(&mut data, 0, x);
        schema.write_f64(&mut data, 1, y);
        schema.write_f64(&mut data, 2, z);
        data
    }

    #[test]
    fn test_infer_by_extension() {
        assert_eq!(infer("/data/cloud.xyz"), Some(DecoderKind::Xyz));
        assert_eq!(infer("/data/CLOUD.XYZ"), Some(DecoderKind::Xyz));
        assert_eq!(infer("/data/notes.md"), None);
        assert_eq!(infer("/data/noext"), None);
    }

    #[test]
    fn test_sink_batches_until_budget() {
        let schema = Schema::xyz();
        let mut target = Collect { views: Vec::new() };
        let mut sink = PointSink::new(Arc::clone(&schema), None, &mut target);

        let per_flush = CHUNK_BYTES / schema.point_size() + 1;
        for i in 0..per_flush {
            sink.push(&record(&schema, i as f64, 0.0, 0.0)).unwrap();
        }
        sink.push(&record(&schema, -1.0, 0.0, 0.0)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(target.views.len(), 2);
        let total: usize = target.views.iter().map(|v| v.len()).sum();
        assert_eq!(total, (per_flush + 1) * schema.point_size());
    }

    #[test]
    fn test_sink_rejects_misshapen_record() {
        let schema = Schema::xyz();
        let mut target = Collect { views: Vec::new() };
        let mut sink = PointSink::new(Arc::clone(&schema), None, &mut target);
        assert!(sink.push(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_transform_applies_in_place() {
        struct Shift;
        impl Transform for Shift {
            fn transform(&self, xyz: &mut [f64; 3]) {
                xyz[0] += 100.0;
                xyz[2] = -xyz[2];
            }
        }

        let schema = Schema::xyz();
        let mut target = Collect { views: Vec::new() };
        let shift = Shift;
        let mut sink = PointSink::new(Arc::clone(&schema), Some(&shift), &mut target);
        sink.push(&record(&schema, 1.0, 2.0, 3.0)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let view = &target.views[0];
        assert_eq!(schema.point_of(view).x, 101.0);
        assert_eq!(schema.point_of(view).y, 2.0);
        let mut z = [0u8; 8];
        z.copy_from_slice(&view[16..24]);
        assert_eq!(f64::from_le_bytes(z), -3.0);
    }
}
