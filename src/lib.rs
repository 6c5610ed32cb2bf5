//! cairn — hierarchical point-cloud indexing engine
//!
//! cairn ingests streams of 3D points and builds a persistent, hierarchical,
//! spatial index suited to random-access streaming reads. Every point
//! descends a complete quadtree until it wins a node: nearer to a node's
//! center beats the resident point, losers sink one level deeper, and
//! whatever falls off the bottom of the tree is counted and dropped.
//!
//! ## Architecture
//! - Tree layer: [`tree::Roller`] descent cursor, [`tree::Registry`]
//!   branch dispatch, base/flat/disk storage tiers, chunked entries with
//!   one-way sparse→dense conversion
//! - Ingest layer: per-file worker tasks, format-inferred decoders, a
//!   bounded point sink with an in-place reprojection seam
//! - Persistence: Snappy-framed chunk blobs with CRC32 verification, JSON
//!   `meta` state, and the finalize rewrite into the portable output layout
//!
//! ## Example
//! ```no_run
//! use cairn::{BBox, BuildConfig, Builder, Point};
//!
//! # fn main() -> cairn::Result<()> {
//! let bbox = BBox::new(Point::new(0.0, 0.0), Point::new(1024.0, 1024.0));
//! let config = BuildConfig::new("/data/build", "/tmp/cairn", bbox)
//!     .with_threads(8)
//!     .with_depths(6, 8, 12);
//!
//! let builder = Builder::new(config)?;
//! builder.insert("/data/input/tile-a.xyz")?;
//! builder.insert("/data/input/tile-b.xyz")?;
//! builder.save()?;
//! builder.finalize("/data/out", 4096, 6, true)?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod decode;
pub mod manifest;
pub mod pool;
pub mod reader;
pub mod storage;
pub mod tree;
pub mod types;

mod error;

pub use builder::Builder;
pub use config::{BuildConfig, Reprojection};
pub use error::{IndexError, Result};
pub use manifest::{FileStatus, Manifest};
pub use tree::{calc_offset, Clipper, Registry, Roller};
pub use types::{BBox, DimInfo, DimKind, Point, PointInfo, Schema};
