//! Manifest: input bookkeeping
//!
//! Maps origin ids to source paths and records what happened to each input:
//! fully inserted, partially inserted before a decode error, failed outright,
//! or omitted because no decoder recognized it. Origin ids are dense indexes
//! into the origin list and are stamped into every stored point's payload.
//!
//! Append-only, guarded by a single mutex; serialized with the build meta at
//! save.

use crate::error::Result;
use crate::types::INVALID_ORIGIN;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Task submitted, outcome pending.
    Inserting,
    Inserted,
    /// Some points landed before the file errored.
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OriginRecord {
    path: String,
    status: FileStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestData {
    origins: Vec<OriginRecord>,
    omissions: Vec<String>,
}

#[derive(Default)]
pub struct Manifest {
    data: Mutex<ManifestData>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin id that no stored point can carry.
    pub fn invalid_origin() -> u64 {
        INVALID_ORIGIN
    }

    /// Allocate the next origin id for `path`.
    pub fn add_origin(&self, path: &str) -> u64 {
        let mut data = self.data.lock();
        data.origins.push(OriginRecord {
            path: path.to_string(),
            status: FileStatus::Inserting,
        });
        (data.origins.len() - 1) as u64
    }

    /// Record an input no decoder recognized.
    pub fn add_omission(&self, path: &str) {
        self.data.lock().omissions.push(path.to_string());
    }

    pub fn set_status(&self, origin: u64, status: FileStatus) {
        let mut data = self.data.lock();
        if let Some(record) = data.origins.get_mut(origin as usize) {
            record.status = status;
        }
    }

    pub fn status_of(&self, origin: u64) -> Option<FileStatus> {
        self.data
            .lock()
            .origins
            .get(origin as usize)
            .map(|r| r.status)
    }

    pub fn path_of(&self, origin: u64) -> Option<String> {
        self.data
            .lock()
            .origins
            .get(origin as usize)
            .map(|r| r.path.clone())
    }

    pub fn num_origins(&self) -> usize {
        self.data.lock().origins.len()
    }

    pub fn num_omissions(&self) -> usize {
        self.data.lock().omissions.len()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&*self.data.lock())?)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let data: ManifestData = serde_json::from_value(json.clone())?;
        Ok(Self {
            data: Mutex::new(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_ids_are_dense() {
        let manifest = Manifest::new();
        assert_eq!(manifest.add_origin("a.xyz"), 0);
        assert_eq!(manifest.add_origin("b.xyz"), 1);
        assert_eq!(manifest.add_origin("c.xyz"), 2);
        assert_eq!(manifest.num_origins(), 3);
        assert_eq!(manifest.path_of(1).as_deref(), Some("b.xyz"));
    }

    #[test]
    fn test_status_lifecycle() {
        let manifest = Manifest::new();
        let origin = manifest.add_origin("a.xyz");
        assert_eq!(manifest.status_of(origin), Some(FileStatus::Inserting));
        manifest.set_status(origin, FileStatus::Partial);
        assert_eq!(manifest.status_of(origin), Some(FileStatus::Partial));
    }

    #[test]
    fn test_json_round_trip() {
        let manifest = Manifest::new();
        let a = manifest.add_origin("a.xyz");
        manifest.add_origin("b.xyz");
        manifest.set_status(a, FileStatus::Inserted);
        manifest.add_omission("readme.md");

        let json = manifest.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.num_origins(), 2);
        assert_eq!(back.num_omissions(), 1);
        assert_eq!(back.status_of(a), Some(FileStatus::Inserted));
        assert_eq!(back.to_json().unwrap(), json);
    }
}
