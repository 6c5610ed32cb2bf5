//! Build configuration
//!
//! Everything a build needs up front: where it lives, the root bounds, the
//! record layout, pool width, and the three branch depths that shape the
//! tree. Validation is fatal at construction; nothing here is revisited
//! mid-build.

use crate::error::{IndexError, Result};
use crate::storage::is_remote_path;
use crate::types::{BBox, DimInfo, DimKind};
use serde::{Deserialize, Serialize};

/// Input/output spatial reference pair handed to the reprojection seam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reprojection {
    #[serde(rename = "in")]
    pub in_srs: String,
    #[serde(rename = "out")]
    pub out_srs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Where build state and chunks land. Local directory, or a remote root
    /// when a remote source is plugged in.
    pub build_path: String,

    /// Scratch space for staging remote inputs. Must be local.
    pub tmp_path: String,

    pub reprojection: Option<Reprojection>,

    /// Root bounds; points outside are tossed.
    pub bbox: BBox,

    /// Record layout. Must carry X/Y doubles and a uint64 Origin.
    pub dimensions: Vec<DimInfo>,

    pub num_threads: usize,

    /// Spatial dimensionality of the subdivision. Only 2 (planar xy) is
    /// supported.
    pub num_dimensions: u64,

    /// Slot count per disk chunk.
    pub chunk_points: u64,

    pub base_depth: u64,
    pub flat_depth: u64,
    pub disk_depth: u64,
}

impl BuildConfig {
    pub fn new(build_path: &str, tmp_path: &str, bbox: BBox) -> Self {
        Self {
            build_path: build_path.to_string(),
            tmp_path: tmp_path.to_string(),
            reprojection: None,
            bbox,
            dimensions: default_dimensions(),
            num_threads: 4,
            num_dimensions: 2,
            chunk_points: 4096,
            base_depth: 6,
            flat_depth: 8,
            disk_depth: 12,
        }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_chunk_points(mut self, chunk_points: u64) -> Self {
        self.chunk_points = chunk_points;
        self
    }

    pub fn with_depths(mut self, base: u64, flat: u64, disk: u64) -> Self {
        self.base_depth = base;
        self.flat_depth = flat;
        self.disk_depth = disk;
        self
    }

    pub fn with_dimensions(mut self, dimensions: Vec<DimInfo>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_reprojection(mut self, in_srs: &str, out_srs: &str) -> Self {
        self.reprojection = Some(Reprojection {
            in_srs: in_srs.to_string(),
            out_srs: out_srs.to_string(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_dimensions != 2 {
            return Err(IndexError::Config(format!(
                "only planar (xy) subdivision is supported, got {} dimensions",
                self.num_dimensions
            )));
        }
        if is_remote_path(&self.tmp_path) {
            return Err(IndexError::Config("tmp path must be local".into()));
        }
        if self.chunk_points == 0 {
            return Err(IndexError::Config("chunk_points must be positive".into()));
        }
        if self.num_threads == 0 {
            return Err(IndexError::Config("num_threads must be positive".into()));
        }
        if !(self.base_depth <= self.flat_depth && self.flat_depth <= self.disk_depth) {
            return Err(IndexError::Config(format!(
                "depths must be non-decreasing: base {} flat {} disk {}",
                self.base_depth, self.flat_depth, self.disk_depth
            )));
        }
        if self.disk_depth == 0 {
            return Err(IndexError::Config("tree must have at least one level".into()));
        }
        Ok(())
    }
}

/// X/Y/Z doubles plus the Origin tag.
pub fn default_dimensions() -> Vec<DimInfo> {
    vec![
        DimInfo::new("X", DimKind::Double),
        DimInfo::new("Y", DimKind::Double),
        DimInfo::new("Z", DimKind::Double),
        DimInfo::new("Origin", DimKind::Uint64),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn config() -> BuildConfig {
        BuildConfig::new(
            "/tmp/build",
            "/tmp/scratch",
            BBox::new(Point::new(0.0, 0.0), Point::new(16.0, 16.0)),
        )
    }

    #[test]
    fn test_defaults_validate() {
        config().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_planar() {
        let mut cfg = config();
        cfg.num_dimensions = 3;
        assert!(matches!(cfg.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn test_rejects_remote_tmp() {
        let mut cfg = config();
        cfg.tmp_path = "s3://bucket/tmp".to_string();
        assert!(matches!(cfg.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn test_rejects_decreasing_depths() {
        let cfg = config().with_depths(6, 4, 8);
        assert!(matches!(cfg.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = config().with_reprojection("EPSG:26915", "EPSG:3857");
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"in\":\"EPSG:26915\""));
        let back: BuildConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reprojection, cfg.reprojection);
        assert_eq!(back.chunk_points, cfg.chunk_points);
    }
}
