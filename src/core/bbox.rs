//! Axis-aligned boxes around detected blobs, and the overlap merge that turns
//! a set of per-component boxes into a set of disjoint maximal boxes.
//!
//! Coordinates are pixel coordinates of a single tile with (0, 0) in the upper
//! left corner. `(x1, y1)` is inclusive, `(x2, y2)` is one past the last pixel.
//!
//! Merging is done with a disjoint-set forest over box indices. Each set keeps
//! a running bounding box, so a merge is visible to every member of the set
//! without sharing mutable boxes between owners.

use serde::{Deserialize, Serialize};
use std::cmp::{max, min};

/// A rectangle in tile pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    /// Creates a box from two opposite corners, reordering them so that
    /// `x1 <= x2` and `y1 <= y2`.
    #[inline]
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: min(x1, x2),
            y1: min(y1, y2),
            x2: max(x1, x2),
            y2: max(y1, y2),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Taxicab distance from `(x1, y1)` to `(x2, y2)`.
    #[inline]
    pub fn taxicab_diagonal(&self) -> u32 {
        self.width() + self.height()
    }

    /// Separating-axis test with inclusive edges: boxes that only touch count
    /// as overlapping.
    #[inline]
    pub fn overlaps(&self, other: &BBox) -> bool {
        !(self.x1 > other.x2 || self.x2 < other.x1 || self.y1 > other.y2 || self.y2 < other.y1)
    }

    /// Minimal box containing both `self` and `other`.
    #[inline]
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x1: min(self.x1, other.x1),
            y1: min(self.y1, other.y1),
            x2: max(self.x2, other.x2),
            y2: max(self.y2, other.y2),
        }
    }

    /// Expands the shorter side of the box to match the longer one, centered on
    /// the original box and shifted as needed to stay inside a
    /// `width × height` tile.
    ///
    /// The side lengths entering the computation are `x2 - x1 - 1` and
    /// `y2 - y1 - 1`; the resulting square has raw extent one more than the
    /// longer of the two, capped at the tile dimension.
    pub fn square_within(&self, width: u32, height: u32) -> BBox {
        if self.is_empty() {
            return *self;
        }

        let bw = self.x2 as i64 - self.x1 as i64 - 1;
        let bh = self.y2 as i64 - self.y1 as i64 - 1;
        let mut squared = *self;

        if bw > bh {
            let side = (bw + 1).min(height as i64);
            let y1 = (self.y1 as i64 + self.y2 as i64 - bw)
                .div_euclid(2)
                .clamp(0, height as i64 - side);
            squared.y1 = y1 as u32;
            squared.y2 = (y1 + side) as u32;
        } else {
            let side = (bh + 1).min(width as i64);
            let x1 = (self.x1 as i64 + self.x2 as i64 - bh)
                .div_euclid(2)
                .clamp(0, width as i64 - side);
            squared.x1 = x1 as u32;
            squared.x2 = (x1 + side) as u32;
        }

        squared
    }
}

/// How thoroughly [`remove_overlaps`] merges overlapping boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// One pass per box in input order. Candidates are boxes with an original
    /// corner within the taxicab diagonal of the current box, measured from its
    /// upper-left corner. Chains of three or more boxes may stay unmerged.
    SinglePass,

    /// Merge any two overlapping sets until nothing changes. The result is
    /// transitively closed.
    #[default]
    FixedPoint,
}

/// Disjoint-set forest over box indices with a running bounding box per set.
struct BoxSets {
    parent: Vec<usize>,
    bounds: Vec<BBox>,
}

impl BoxSets {
    fn new(boxes: &[BBox]) -> Self {
        Self {
            parent: (0..boxes.len()).collect(),
            bounds: boxes.to_vec(),
        }
    }

    fn find(&mut self, mut index: usize) -> usize {
        while self.parent[index] != index {
            self.parent[index] = self.parent[self.parent[index]];
            index = self.parent[index];
        }
        index
    }

    /// Joins the sets of `a` and `b` and returns the surviving root.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        self.bounds[root] = self.bounds[root].union(&self.bounds[child]);
        root
    }

    fn bounds_of(&mut self, index: usize) -> BBox {
        let root = self.find(index);
        self.bounds[root]
    }

    /// Distinct set bounds, sorted and de-duplicated by value.
    fn into_boxes(mut self) -> Vec<BBox> {
        let roots: Vec<usize> = (0..self.parent.len())
            .filter(|&i| self.find(i) == i)
            .collect();
        let mut out: Vec<BBox> = roots.into_iter().map(|i| self.bounds[i]).collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Returns boxes that contain the given boxes, replacing every group of
/// overlapping boxes by their minimal enclosing box.
pub fn remove_overlaps(boxes: &[BBox], strategy: MergeStrategy) -> Vec<BBox> {
    let mut sets = BoxSets::new(boxes);

    match strategy {
        MergeStrategy::SinglePass => single_pass(boxes, &mut sets),
        MergeStrategy::FixedPoint => fixed_point(boxes.len(), &mut sets),
    }

    sets.into_boxes()
}

fn single_pass(boxes: &[BBox], sets: &mut BoxSets) {
    // Corners are indexed at their original positions; the boxes they point
    // to grow as sets merge.
    let corners: Vec<(i64, i64, usize)> = boxes
        .iter()
        .enumerate()
        .flat_map(|(i, b)| {
            [
                (b.x1 as i64, b.y1 as i64, i),
                (b.x2 as i64, b.y2 as i64, i),
            ]
        })
        .collect();

    for (i, origin) in boxes.iter().enumerate() {
        let (ox, oy) = (origin.x1 as i64, origin.y1 as i64);
        let radius = sets.bounds_of(i).taxicab_diagonal() as i64;

        for &(cx, cy, j) in &corners {
            if (cx - ox).abs() + (cy - oy).abs() > radius {
                continue;
            }

            let current = sets.bounds_of(i);
            let near = sets.bounds_of(j);
            if current != near && current.overlaps(&near) {
                sets.union(i, j);
            }
        }
    }
}

fn fixed_point(len: usize, sets: &mut BoxSets) {
    loop {
        let mut merged = false;

        for i in 0..len {
            for j in (i + 1)..len {
                if sets.find(i) == sets.find(j) {
                    continue;
                }
                if sets.bounds_of(i).overlaps(&sets.bounds_of(j)) {
                    sets.union(i, j);
                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }
}

/// Picks the box with the largest area. Ties go to the lowest `x1`, then the
/// lowest `y1`.
pub fn largest(boxes: &[BBox]) -> Option<BBox> {
    boxes.iter().copied().min_by(|a, b| {
        b.area()
            .cmp(&a.area())
            .then(a.x1.cmp(&b.x1))
            .then(a.y1.cmp(&b.y1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_reorders_corners() {
        let b = BBox::new(10, 20, 2, 4);
        assert_eq!(b, BBox { x1: 2, y1: 4, x2: 10, y2: 20 });
        assert_eq!(b.taxicab_diagonal(), 8 + 16);
    }

    #[test]
    fn test_overlaps_is_inclusive() {
        let a = BBox::new(0, 0, 10, 10);
        assert!(a.overlaps(&BBox::new(10, 0, 20, 10)));
        assert!(!a.overlaps(&BBox::new(11, 0, 20, 10)));
        assert!(!a.overlaps(&BBox::new(0, 11, 10, 20)));
    }

    #[test]
    fn test_two_overlapping_boxes_merge_to_union() {
        let boxes = [BBox::new(0, 0, 10, 10), BBox::new(5, 5, 15, 15)];
        for strategy in [MergeStrategy::SinglePass, MergeStrategy::FixedPoint] {
            assert_eq!(
                remove_overlaps(&boxes, strategy),
                vec![BBox::new(0, 0, 15, 15)]
            );
        }
    }

    #[test]
    fn test_disjoint_boxes_are_unchanged() {
        let boxes = [
            BBox::new(0, 0, 5, 5),
            BBox::new(20, 20, 30, 30),
            BBox::new(40, 0, 45, 8),
        ];
        assert_eq!(
            remove_overlaps(&boxes, MergeStrategy::FixedPoint),
            boxes.to_vec()
        );
        assert_eq!(
            remove_overlaps(&boxes, MergeStrategy::SinglePass),
            boxes.to_vec()
        );
    }

    #[test]
    fn test_fixed_point_closes_chains() {
        // The merged union of the first two reaches the third only after the
        // first merge has happened.
        let boxes = [
            BBox::new(0, 0, 4, 4),
            BBox::new(3, 3, 12, 6),
            BBox::new(11, 0, 14, 2),
        ];
        assert_eq!(
            remove_overlaps(&boxes, MergeStrategy::FixedPoint),
            vec![BBox::new(0, 0, 14, 6)]
        );
    }

    #[test]
    fn test_single_pass_can_leave_overlaps() {
        let boxes = [
            BBox::new(30, 17, 37, 27),
            BBox::new(52, 17, 65, 36),
            BBox::new(22, 32, 42, 43),
            BBox::new(16, 23, 19, 30),
            BBox::new(41, 8, 61, 24),
        ];

        let single = remove_overlaps(&boxes, MergeStrategy::SinglePass);
        assert_eq!(
            single,
            vec![
                BBox::new(16, 23, 19, 30),
                BBox::new(22, 8, 65, 43),
                BBox::new(30, 17, 37, 27),
            ]
        );
        assert!(single[1].overlaps(&single[2]));

        assert_eq!(
            remove_overlaps(&boxes, MergeStrategy::FixedPoint),
            vec![BBox::new(16, 23, 19, 30), BBox::new(22, 8, 65, 43)]
        );
    }

    #[test]
    fn test_single_box_and_empty_input() {
        assert!(remove_overlaps(&[], MergeStrategy::FixedPoint).is_empty());
        let one = [BBox::new(1, 2, 3, 4)];
        assert_eq!(remove_overlaps(&one, MergeStrategy::SinglePass), one.to_vec());
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let b = BBox::new(1, 1, 5, 5);
        assert_eq!(remove_overlaps(&[b, b], MergeStrategy::FixedPoint), vec![b]);
    }

    #[test]
    fn test_largest_breaks_ties_by_position() {
        let boxes = [
            BBox::new(10, 0, 20, 10),
            BBox::new(0, 30, 10, 40),
            BBox::new(0, 0, 5, 5),
        ];
        assert_eq!(largest(&boxes), Some(BBox::new(0, 30, 10, 40)));
        assert_eq!(largest(&[]), None);
    }

    #[test]
    fn test_square_expands_height_centered() {
        // bw = 19, bh = 9 -> y1 = (40 + 50 - 19) div 2 = 35, y2 = 35 + 20.
        let squared = BBox::new(10, 40, 30, 50).square_within(100, 100);
        assert_eq!(squared, BBox::new(10, 35, 30, 55));
        assert_eq!(squared.width(), squared.height());
    }

    #[test]
    fn test_square_shifts_inside_tile() {
        let squared = BBox::new(80, 95, 100, 100).square_within(100, 100);
        assert_eq!(squared, BBox::new(80, 80, 100, 100));

        let squared = BBox::new(0, 0, 3, 30).square_within(100, 100);
        assert_eq!(squared, BBox::new(0, 0, 30, 30));
    }

    #[test]
    fn test_square_caps_at_tile_dimension() {
        let squared = BBox::new(0, 0, 100, 10).square_within(100, 40);
        assert_eq!(squared, BBox::new(0, 0, 100, 40));
    }
}
