//! Core value types: points, bounding boxes, record schema

mod bbox;
mod point;
mod schema;

pub use bbox::{BBox, Quadrant};
pub use point::{Point, PointInfo};
pub use schema::{DimInfo, DimKind, Schema, INVALID_ORIGIN};
