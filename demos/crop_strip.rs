//! Builds a synthetic montage strip, tight-crops each tile and saves three
//! images: the strip, the strip with the detected square boxes drawn in red,
//! and the cropped strip.
//!
//! cargo run --example crop_strip -- [output_dir]

use anyhow::{Context, Result};
use image::{imageops, Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::PathBuf;
use unitseg_rs::core::{
    montage::concat_tiles,
    tightcrop::{biggest_square_bbox, crop_tiled_image, TileSpans, TightCropParams},
};

const TILE: u32 = 100;
const MARGIN: u32 = 4;
const NUM_TILES: usize = 6;

/// A dark tile with a few bright blobs of random size, some overlapping.
fn random_tile(rng: &mut StdRng) -> RgbImage {
    let mut tile = RgbImage::new(TILE, TILE);
    let blobs = rng.random_range(0..4);

    for _ in 0..blobs {
        let w = rng.random_range(4..50);
        let h = rng.random_range(4..50);
        let x = rng.random_range(0..TILE - w);
        let y = rng.random_range(0..TILE - h);
        let color = Rgb([rng.random_range(120..=255), rng.random_range(60..=255), 90]);

        for py in y..y + h {
            for px in x..x + w {
                tile.put_pixel(px, py, color);
            }
        }
    }

    tile
}

fn main() -> Result<()> {
    let out_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)?;

    let mut rng = StdRng::from_seed([42u8; 32]);
    let tiles: Vec<RgbImage> = (0..NUM_TILES).map(|_| random_tile(&mut rng)).collect();
    let strip = concat_tiles(&tiles, TILE, MARGIN);
    let params = TightCropParams::default();

    let mut annotated = strip.clone();
    for (x, width) in TileSpans::new(strip.width(), TILE, MARGIN) {
        let tile = imageops::crop_imm(&strip, x, 0, width, strip.height()).to_image();
        let bbox = biggest_square_bbox(&tile, &params);

        if bbox.width() < params.min_crop_size {
            println!("tile at x={x}: kept as is");
            continue;
        }

        println!("tile at x={x}: crop {bbox:?}");
        let rect = Rect::at((x + bbox.x1) as i32, bbox.y1 as i32).of_size(bbox.width(), bbox.height());
        draw_hollow_rect_mut(&mut annotated, rect, Rgb([255, 0, 0]));
    }

    let cropped = crop_tiled_image(&strip, TILE, MARGIN, &params);

    for (name, img) in [("strip.jpg", &strip), ("strip_boxes.jpg", &annotated), ("strip_crop.jpg", &cropped)] {
        let path = out_dir.join(name);
        img.save(&path).with_context(|| format!("saving {}", path.display()))?;
        println!("Saved {}", path.display());
    }

    Ok(())
}
