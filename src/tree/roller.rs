//! Descent cursor over the complete quadtree
//!
//! Nodes are numbered breadth-first: the children of node `i` are
//! `4i + 1 .. 4i + 4` in nw/ne/sw/se order. The roller tracks the pair of
//! (node index, node bounding box) while walking down, so callers never
//! materialize tree nodes — the index alone addresses storage.

use crate::types::{BBox, Point, Quadrant};

#[derive(Debug, Clone, Copy)]
pub struct Roller {
    bbox: BBox,
    index: u64,
}

impl Roller {
    /// Cursor positioned at the root.
    pub fn new(bbox: BBox) -> Self {
        Self { bbox, index: 0 }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// Tree depth of the current node: `⌊log₄(3i + 1)⌋`.
    pub fn depth(&self) -> u32 {
        (3 * self.index + 1).ilog2() / 2
    }

    pub fn go_nw(&mut self) {
        self.step(Quadrant::Nw)
    }

    pub fn go_ne(&mut self) {
        self.step(Quadrant::Ne)
    }

    pub fn go_sw(&mut self) {
        self.step(Quadrant::Sw)
    }

    pub fn go_se(&mut self) {
        self.step(Quadrant::Se)
    }

    /// Step into the quadrant containing `p`.
    pub fn magnify(&mut self, p: Point) {
        self.step(self.bbox.quadrant_of(p))
    }

    fn step(&mut self, q: Quadrant) {
        self.index = self.index * 4
            + match q {
                Quadrant::Nw => 1,
                Quadrant::Ne => 2,
                Quadrant::Sw => 3,
                Quadrant::Se => 4,
            };
        self.bbox = self.bbox.quadrant(q);
    }
}

/// Number of nodes strictly above `depth` in a complete 4-ary tree:
/// `(4^depth − 1) / 3`. Branch ranges and the finalize partition point are
/// both expressed through it.
pub fn calc_offset(depth: u64) -> u64 {
    (4u64.pow(depth as u32) - 1) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> BBox {
        BBox::new(Point::new(0.0, 0.0), Point::new(16.0, 16.0))
    }

    #[test]
    fn test_numbering() {
        let mut r = Roller::new(root());
        assert_eq!(r.index(), 0);
        r.go_ne();
        assert_eq!(r.index(), 2);
        r.go_sw();
        assert_eq!(r.index(), 4 * 2 + 3);
        r.go_se();
        assert_eq!(r.index(), 4 * 11 + 4);
    }

    #[test]
    fn test_bbox_tracks_descent() {
        let mut r = Roller::new(root());
        r.go_ne();
        assert_eq!(r.bbox().min(), Point::new(8.0, 8.0));
        assert_eq!(r.bbox().max(), Point::new(16.0, 16.0));
        r.go_sw();
        assert_eq!(r.bbox().min(), Point::new(8.0, 8.0));
        assert_eq!(r.bbox().max(), Point::new(12.0, 12.0));
    }

    #[test]
    fn test_magnify_follows_point() {
        let mut r = Roller::new(root());
        r.magnify(Point::new(15.0, 15.0));
        assert_eq!(r.index(), 2);
        r.magnify(Point::new(15.0, 15.0));
        assert_eq!(r.index(), 4 * 2 + 2);
    }

    #[test]
    fn test_depth() {
        let mut r = Roller::new(root());
        assert_eq!(r.depth(), 0);
        r.go_nw();
        assert_eq!(r.depth(), 1);
        r.go_se();
        assert_eq!(r.depth(), 2);
        r.go_se();
        assert_eq!(r.depth(), 3);
    }

    #[test]
    fn test_calc_offset() {
        assert_eq!(calc_offset(0), 0);
        assert_eq!(calc_offset(1), 1);
        assert_eq!(calc_offset(2), 5);
        assert_eq!(calc_offset(3), 21);
        assert_eq!(calc_offset(4), 85);
    }
}
