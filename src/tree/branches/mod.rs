//! Storage branches: the three residency tiers of the tree

mod base;
mod clipper;
mod disk;
mod flat;

pub use base::BaseBranch;
pub use clipper::Clipper;
pub use disk::DiskBranch;
pub use flat::FlatBranch;
