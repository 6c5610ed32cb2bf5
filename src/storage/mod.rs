//! Persistence plumbing: blob transport, compression framing, checksums

pub mod compression;
mod source;

pub use source::{is_remote_path, LocalSource, Source};
