//! Clipper: per-task chunk residency handle
//!
//! Each ingest task carries one clipper. The first time the task touches a
//! disk chunk, the owning branch registers the chunk id here and bumps the
//! chunk's reference count; the chunk stays resident until every clipper
//! that touched it has released. Holding ids instead of chunk references is
//! what keeps a worker off the global chunk map on repeat visits, and keeps
//! ownership a strict tree.
//!
//! Release is explicit because the eviction it triggers may write chunks,
//! and a failed chunk write must surface to the task. `Drop` is only a
//! backstop for early exits and can do no more than log.

use crate::error::Result;
use crate::tree::Registry;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Clipper {
    registry: Arc<Registry>,
    ids: HashSet<u64>,
}

impl Clipper {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            ids: HashSet::new(),
        }
    }

    /// Register a touched chunk. Returns true on first contact, which is the
    /// branch's cue to take a reference on the task's behalf.
    pub(crate) fn insert(&mut self, chunk_id: u64) -> bool {
        self.ids.insert(chunk_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Release every touched chunk. All ids are released even if one fails;
    /// the first error comes back.
    pub fn release(mut self) -> Result<()> {
        let mut first_err = None;
        for chunk_id in std::mem::take(&mut self.ids) {
            if let Err(e) = self.registry.clip(chunk_id) {
                tracing::error!(chunk = chunk_id, error = %e, "chunk release failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for Clipper {
    fn drop(&mut self) {
        for chunk_id in self.ids.drain() {
            if let Err(e) = self.registry.clip(chunk_id) {
                tracing::error!(
                    chunk = chunk_id,
                    error = %e,
                    "chunk eviction failed during clipper teardown"
                );
            }
        }
    }
}
