//! Axis-aligned planar bounding box
//!
//! The box is the unit of spatial subdivision: every tree node corresponds to
//! one box, and stepping to a child quadrant halves it in both axes. Points
//! exactly on the center split line belong to the `>=` side (ne/se), which
//! keeps quadrant assignment deterministic and the output stable.

use crate::types::Point;
use serde::{Deserialize, Serialize};

/// One of the four child quadrants of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    Nw,
    Ne,
    Sw,
    Se,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 4]", from = "[f64; 4]")]
pub struct BBox {
    min: Point,
    max: Point,
}

impl BBox {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn min(&self) -> Point {
        self.min
    }

    pub fn max(&self) -> Point {
        self.max
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.min.x + (self.max.x - self.min.x) / 2.0,
            self.min.y + (self.max.y - self.min.y) / 2.0,
        )
    }

    /// Closed containment on all edges. The root box must admit points lying
    /// exactly on its maximum edge; interior splits are disambiguated by
    /// [`BBox::quadrant_of`], not by containment.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Quadrant of `p` relative to the box center. Center ties go to the
    /// `>=` side: ne over nw, se over sw.
    pub fn quadrant_of(&self, p: Point) -> Quadrant {
        let c = self.center();
        match (p.x >= c.x, p.y >= c.y) {
            (false, true) => Quadrant::Nw,
            (true, true) => Quadrant::Ne,
            (false, false) => Quadrant::Sw,
            (true, false) => Quadrant::Se,
        }
    }

    pub fn quadrant(&self, q: Quadrant) -> BBox {
        let c = self.center();
        match q {
            Quadrant::Nw => BBox::new(Point::new(self.min.x, c.y), Point::new(c.x, self.max.y)),
            Quadrant::Ne => BBox::new(c, self.max),
            Quadrant::Sw => BBox::new(self.min, c),
            Quadrant::Se => BBox::new(Point::new(c.x, self.min.y), Point::new(self.max.x, c.y)),
        }
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.min.x, b.min.y, b.max.x, b.max.y]
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        BBox::new(Point::new(v[0], v[1]), Point::new(v[2], v[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit16() -> BBox {
        BBox::new(Point::new(0.0, 0.0), Point::new(16.0, 16.0))
    }

    #[test]
    fn test_contains_edges() {
        let b = unit16();
        assert!(b.contains(Point::new(0.0, 0.0)));
        assert!(b.contains(Point::new(16.0, 16.0)));
        assert!(b.contains(Point::new(8.0, 0.0)));
        assert!(!b.contains(Point::new(16.1, 8.0)));
        assert!(!b.contains(Point::new(-0.1, 8.0)));
    }

    #[test]
    fn test_quadrant_ties_go_to_ge_side() {
        let b = unit16();
        // Center is (8, 8); exact-center ties land in ne.
        assert_eq!(b.quadrant_of(Point::new(8.0, 8.0)), Quadrant::Ne);
        assert_eq!(b.quadrant_of(Point::new(8.0, 1.0)), Quadrant::Se);
        assert_eq!(b.quadrant_of(Point::new(1.0, 8.0)), Quadrant::Nw);
        assert_eq!(b.quadrant_of(Point::new(1.0, 1.0)), Quadrant::Sw);
    }

    #[test]
    fn test_quadrant_boxes_tile_the_parent() {
        let b = unit16();
        let ne = b.quadrant(Quadrant::Ne);
        assert_eq!(ne.min(), Point::new(8.0, 8.0));
        assert_eq!(ne.max(), Point::new(16.0, 16.0));
        let sw = b.quadrant(Quadrant::Sw);
        assert_eq!(sw.min(), Point::new(0.0, 0.0));
        assert_eq!(sw.max(), Point::new(8.0, 8.0));
        let nw = b.quadrant(Quadrant::Nw);
        assert_eq!(nw.min(), Point::new(0.0, 8.0));
        assert_eq!(nw.max(), Point::new(8.0, 16.0));
        let se = b.quadrant(Quadrant::Se);
        assert_eq!(se.min(), Point::new(8.0, 0.0));
        assert_eq!(se.max(), Point::new(16.0, 8.0));
    }

    #[test]
    fn test_json_round_trip() {
        let b = unit16();
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[0.0,0.0,16.0,16.0]");
        let back: BBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
