//! Planar point key and the owned insertion token

use serde::{Deserialize, Serialize};

/// 2D spatial key of a record. The z coordinate takes no part in tree
/// placement; it rides along in the payload like any other dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared euclidean distance. Tree placement only ever compares
    /// distances, so the square root is never taken.
    pub fn sq_dist(&self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// An owned point on its way into the tree: the spatial key plus the full
/// serialized record.
///
/// A `PointInfo` is consumed when a branch accepts it. When it loses a slot
/// contest it travels one level deeper; when an incumbent is displaced the
/// winner wraps the old key and payload into a fresh `PointInfo` and hands it
/// back to the caller for descent.
#[derive(Debug, Clone)]
pub struct PointInfo {
    pub point: Point,
    pub data: Vec<u8>,
}

impl PointInfo {
    pub fn new(point: Point, data: Vec<u8>) -> Self {
        Self { point, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sq_dist() {
        let a = Point::new(1.0, 1.0);
        let b = Point::new(4.0, 5.0);
        assert_eq!(a.sq_dist(b), 25.0);
        assert_eq!(b.sq_dist(a), 25.0);
        assert_eq!(a.sq_dist(a), 0.0);
    }
}
