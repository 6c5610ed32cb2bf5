//! Flat branch: one disk-backed region below the base
//!
//! A single chunk covering `[offset, end)`, loaded whole at open and written
//! at save. It starts sparse and densifies like any other chunk, so a mostly
//! empty middle tier stays cheap on disk.

use crate::error::Result;
use crate::storage::{compression, Source};
use crate::tree::chunk::{Chunk, Insertion};
use crate::tree::Roller;
use crate::types::{PointInfo, Schema};
use serde_json::json;
use std::sync::Arc;

pub struct FlatBranch {
    offset: u64,
    end: u64,
    chunk: Chunk,
}

impl FlatBranch {
    pub fn new(schema: Arc<Schema>, offset: u64, end: u64) -> Self {
        let empty = schema.empty_chunk(end - offset);
        Self {
            offset,
            end,
            chunk: Chunk::new_sparse(schema, offset, end - offset, empty),
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.offset && index < self.end
    }

    pub fn add_point(&self, info: PointInfo, roller: &Roller) -> Insertion {
        self.chunk
            .add_point(roller.index(), info, roller.bbox().center())
    }

    pub fn point_data(&self, index: u64) -> Option<Vec<u8>> {
        self.chunk.point_data(index)
    }

    pub fn num_points(&self) -> u64 {
        self.chunk.num_points()
    }

    pub fn save(&self, source: &dyn Source) -> Result<serde_json::Value> {
        let num_points = self.chunk.num_points();
        if num_points == 0 {
            return Ok(json!({ "numPoints": 0 }));
        }
        let blob = self.chunk.blob(true)?;
        let checksum = compression::checksum(&blob);
        source.put(&self.offset.to_string(), &blob)?;
        Ok(json!({ "numPoints": num_points, "checksum": checksum }))
    }

    pub fn load(
        schema: Arc<Schema>,
        offset: u64,
        end: u64,
        source: &dyn Source,
        state: &serde_json::Value,
    ) -> Result<Self> {
        let Some(checksum) = state["checksum"].as_u64() else {
            return Ok(Self::new(schema, offset, end));
        };
        let blob = source.get(&offset.to_string())?;
        compression::verify(offset, &blob, checksum as u32)?;
        let empty = schema.empty_chunk(end - offset);
        let chunk = Chunk::from_blob(schema, offset, end - offset, empty, &blob)?;
        Ok(Self { offset, end, chunk })
    }
}
