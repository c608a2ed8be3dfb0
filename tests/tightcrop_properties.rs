//! Property-based tests for the tight-crop engine.

use image::{Rgb, RgbImage};
use proptest::prelude::*;
use unitseg_rs::core::{
    bbox::{remove_overlaps, BBox, MergeStrategy},
    tightcrop::{best_tight_crop, biggest_square_bbox, TightCropParams},
};

// ============================================================================
// Strategies
// ============================================================================

/// A tile size and a non-empty box inside it.
fn box_in_tile() -> impl Strategy<Value = (u32, u32, BBox)> {
    (1u32..200, 1u32..200).prop_flat_map(|(w, h)| {
        (0..w, 0..h).prop_flat_map(move |(x1, y1)| {
            (x1 + 1..=w, y1 + 1..=h).prop_map(move |(x2, y2)| (w, h, BBox::new(x1, y1, x2, y2)))
        })
    })
}

/// Boxes placed in distinct 20x20 grid cells, never touching each other.
fn disjoint_boxes() -> impl Strategy<Value = Vec<BBox>> {
    prop::collection::btree_set((0u32..6, 0u32..6), 0..12).prop_flat_map(|cells| {
        let cells: Vec<_> = cells.into_iter().collect();
        let n = cells.len();
        prop::collection::vec((0u32..5, 0u32..5, 1u32..10, 1u32..10), n).prop_map(move |dims| {
            cells
                .iter()
                .zip(dims)
                .map(|(&(cx, cy), (dx, dy, w, h))| {
                    let (x1, y1) = (cx * 20 + dx, cy * 20 + dy);
                    BBox::new(x1, y1, x1 + w, y1 + h)
                })
                .collect()
        })
    })
}

fn random_tile() -> impl Strategy<Value = RgbImage> {
    (1u32..48, 1u32..48).prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<u8>(), (w * h) as usize).prop_map(move |values| {
            RgbImage::from_fn(w, h, |x, y| {
                let v = values[(y * w + x) as usize];
                Rgb([v, v / 2, 255 - v])
            })
        })
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn squared_box_stays_inside_tile((w, h, bbox) in box_in_tile()) {
        let squared = bbox.square_within(w, h);
        prop_assert!(squared.x1 <= squared.x2 && squared.x2 <= w);
        prop_assert!(squared.y1 <= squared.y2 && squared.y2 <= h);
    }

    #[test]
    fn squared_box_never_shrinks_in_square_tiles((w, h, bbox) in box_in_tile()) {
        let side = w.max(h);
        let squared = bbox.square_within(side, side);
        prop_assert_eq!(squared.width(), squared.height());
        prop_assert!(squared.width() >= bbox.width().max(bbox.height()));
    }

    #[test]
    fn disjoint_boxes_are_returned_unchanged(boxes in disjoint_boxes()) {
        let mut expected = boxes.clone();
        expected.sort();
        prop_assert_eq!(remove_overlaps(&boxes, MergeStrategy::FixedPoint), expected.clone());
        prop_assert_eq!(remove_overlaps(&boxes, MergeStrategy::SinglePass), expected);
    }

    #[test]
    fn fixed_point_merge_is_disjoint_and_covering(
        raw in prop::collection::vec((0u32..60, 0u32..60, 0u32..60, 0u32..60), 0..10)
    ) {
        let boxes: Vec<BBox> = raw.iter().map(|&(a, b, c, d)| BBox::new(a, b, c, d)).collect();
        let merged = remove_overlaps(&boxes, MergeStrategy::FixedPoint);

        for (i, a) in merged.iter().enumerate() {
            for b in &merged[i + 1..] {
                prop_assert!(!a.overlaps(b));
            }
        }
        for b in &boxes {
            prop_assert!(merged.iter().any(|m| m.union(b) == *m));
        }
        prop_assert_eq!(remove_overlaps(&merged, MergeStrategy::FixedPoint), merged.clone());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn crop_preserves_dimensions(tile in random_tile()) {
        let params = TightCropParams::default();
        let out = best_tight_crop(&tile, &params);
        prop_assert_eq!(out.dimensions(), tile.dimensions());

        let bbox = biggest_square_bbox(&tile, &params);
        prop_assert!(bbox.x2 <= tile.width() && bbox.y2 <= tile.height());
    }

    #[test]
    fn background_tile_is_unchanged(w in 1u32..64, h in 1u32..64) {
        let tile = RgbImage::new(w, h);
        prop_assert_eq!(best_tight_crop(&tile, &TightCropParams::default()), tile);
    }
}

#[test]
fn non_square_region_crops_back_to_tile_size() {
    // A wide bar: the crop box is non-square before squaring.
    let tile = RgbImage::from_fn(100, 100, |x, y| {
        if (20..80).contains(&x) && (45..55).contains(&y) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    });
    let params = TightCropParams::default();
    let bbox = biggest_square_bbox(&tile, &params);
    assert_eq!(bbox.width(), bbox.height());
    assert!(bbox.width() >= params.min_crop_size);

    let out = best_tight_crop(&tile, &params);
    assert_eq!(out.dimensions(), (100, 100));
    assert_ne!(out, tile);
}
