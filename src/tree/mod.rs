//! The spatial tree: descent cursor, chunked storage, branches, registry

pub mod branches;
pub mod chunk;
mod registry;
mod roller;

pub use branches::Clipper;
pub use registry::Registry;
pub use roller::{calc_offset, Roller};
