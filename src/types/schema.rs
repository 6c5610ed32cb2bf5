//! Record schema: ordered dimension layout of a point payload
//!
//! Every point carries a fixed-width byte record laid out as the
//! concatenation of its dimensions, little-endian. The engine itself only
//! interprets three of them: `X` and `Y` (the spatial key) and `Origin` (the
//! id of the input file a point came from). Everything else is opaque
//! payload that travels with the point.

use crate::error::{IndexError, Result};
use crate::types::Point;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Origin value marking a slot as never-written. The empty payload template
/// carries it so that a dense chunk read back from disk can tell occupied
/// slots from blank ones.
pub const INVALID_ORIGIN: u64 = u64::MAX;

/// Element type of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimKind {
    Double,
    Float,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl DimKind {
    pub fn size(&self) -> usize {
        match self {
            DimKind::Double | DimKind::Int64 | DimKind::Uint64 => 8,
            DimKind::Float | DimKind::Int32 | DimKind::Uint32 => 4,
            DimKind::Int16 | DimKind::Uint16 => 2,
            DimKind::Int8 | DimKind::Uint8 => 1,
        }
    }
}

/// One named dimension of the record layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimInfo {
    pub name: String,
    pub kind: DimKind,
    pub size: usize,
}

impl DimInfo {
    pub fn new(name: &str, kind: DimKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            size: kind.size(),
        }
    }
}

/// Immutable record layout shared read-only across all workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DimInfo>", into = "Vec<DimInfo>")]
pub struct Schema {
    dims: Vec<DimInfo>,
    offsets: Vec<usize>,
    point_size: usize,
    x_offset: usize,
    y_offset: usize,
    origin_offset: usize,
}

impl Schema {
    /// Build a schema from an ordered dimension list. `X` and `Y` must be
    /// doubles and an 8-byte `Origin` dimension must be present.
    pub fn new(dims: Vec<DimInfo>) -> Result<Self> {
        let mut offsets = Vec::with_capacity(dims.len());
        let mut at = 0usize;
        for dim in &dims {
            if dim.size != dim.kind.size() {
                return Err(IndexError::Schema(format!(
                    "dimension {} declares size {} but kind holds {}",
                    dim.name,
                    dim.size,
                    dim.kind.size()
                )));
            }
            offsets.push(at);
            at += dim.size;
        }

        let find = |name: &str| dims.iter().position(|d| d.name == name);

        let x = find("X").ok_or_else(|| IndexError::Schema("missing X dimension".into()))?;
        let y = find("Y").ok_or_else(|| IndexError::Schema("missing Y dimension".into()))?;
        let origin =
            find("Origin").ok_or_else(|| IndexError::Schema("missing Origin dimension".into()))?;

        if dims[x].kind != DimKind::Double || dims[y].kind != DimKind::Double {
            return Err(IndexError::Schema("X and Y must be double".into()));
        }
        if dims[origin].kind != DimKind::Uint64 {
            return Err(IndexError::Schema("Origin must be uint64".into()));
        }

        Ok(Self {
            x_offset: offsets[x],
            y_offset: offsets[y],
            origin_offset: offsets[origin],
            offsets,
            point_size: at,
            dims,
        })
    }

    /// The conventional layout: X/Y/Z doubles followed by Origin.
    pub fn xyz() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                DimInfo::new("X", DimKind::Double),
                DimInfo::new("Y", DimKind::Double),
                DimInfo::new("Z", DimKind::Double),
                DimInfo::new("Origin", DimKind::Uint64),
            ])
            .expect("builtin layout is valid"),
        )
    }

    pub fn dims(&self) -> &[DimInfo] {
        &self.dims
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    pub fn find_dim(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn offset(&self, dim: usize) -> usize {
        self.offsets[dim]
    }

    /// Spatial key of a serialized record.
    pub fn point_of(&self, record: &[u8]) -> Point {
        Point::new(
            read_f64(record, self.x_offset),
            read_f64(record, self.y_offset),
        )
    }

    pub fn origin_of(&self, record: &[u8]) -> u64 {
        read_u64(record, self.origin_offset)
    }

    pub fn set_origin(&self, record: &mut [u8], origin: u64) {
        record[self.origin_offset..self.origin_offset + 8].copy_from_slice(&origin.to_le_bytes());
    }

    pub fn write_f64(&self, record: &mut [u8], dim: usize, value: f64) {
        let at = self.offsets[dim];
        record[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Zeroed payload with the invalid-origin sentinel. Blank slots in a
    /// dense chunk hold exactly these bytes.
    pub fn empty_point(&self) -> Vec<u8> {
        let mut record = vec![0u8; self.point_size];
        self.set_origin(&mut record, INVALID_ORIGIN);
        record
    }

    /// Template buffer for a whole chunk of blank slots.
    pub fn empty_chunk(&self, max_points: u64) -> Arc<[u8]> {
        let one = self.empty_point();
        let mut buf = Vec::with_capacity(one.len() * max_points as usize);
        for _ in 0..max_points {
            buf.extend_from_slice(&one);
        }
        buf.into()
    }
}

impl TryFrom<Vec<DimInfo>> for Schema {
    type Error = IndexError;

    fn try_from(dims: Vec<DimInfo>) -> Result<Self> {
        Schema::new(dims)
    }
}

impl From<Schema> for Vec<DimInfo> {
    fn from(s: Schema) -> Self {
        s.dims
    }
}

fn read_f64(record: &[u8], at: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[at..at + 8]);
    f64::from_le_bytes(bytes)
}

fn read_u64(record: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[at..at + 8]);
    u64::from_le_bytes(bytes)
}
