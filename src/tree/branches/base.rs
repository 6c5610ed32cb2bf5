//! Base branch: the always-resident top of the tree
//!
//! Covers `[0, end)` with a single contiguous in-memory chunk. No clipper
//! interaction: the branch is resident for the life of the build.

use crate::error::Result;
use crate::storage::{compression, Source};
use crate::tree::chunk::{Chunk, Insertion};
use crate::tree::Roller;
use crate::types::{PointInfo, Schema};
use serde_json::json;
use std::sync::Arc;

pub struct BaseBranch {
    end: u64,
    chunk: Chunk,
}

impl BaseBranch {
    pub fn new(schema: Arc<Schema>, end: u64) -> Self {
        let empty = schema.empty_chunk(end);
        Self {
            end,
            chunk: Chunk::new_contiguous(schema, 0, end, empty),
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.end
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
        source.put("0", &blob)?;
        Ok(json!({ "numPoints": num_points, "checksum": checksum }))
    }

    pub fn load(
        schema: Arc<Schema>,
        end: u64,
        source: &dyn Source,
        state: &serde_json::Value,
    ) -> Result<Self> {
        let Some(checksum) = state["checksum"].as_u64() else {
            return Ok(Self::new(schema, end));
        };
        let blob = source.get("0")?;
        compression::verify(0, &blob, checksum as u32)?;
        let empty = schema.empty_chunk(end);
        let chunk = Chunk::from_blob(schema, 0, end, empty, &blob)?;
        Ok(Self { end, chunk })
    }
}
