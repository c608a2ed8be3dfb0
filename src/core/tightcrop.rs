//! The tight-crop engine.
//!
//! Given a montage strip made of equal-width tiles separated by blank margins,
//! each tile is tightened on its own:
//! - the tile's intensity is box-blurred so speckled detections form solid blobs,
//! - the blurred field is thresholded, holes are filled and blobs are labelled,
//! - the blob boxes are merged where they overlap and the largest one is squared,
//! - the tile is cropped to that square and resampled back to its own size.
//!
//! A tile with no foreground, or whose square would be too small to be worth
//! zooming into, is returned unchanged.

use super::{
    bbox::{largest, remove_overlaps, BBox, MergeStrategy},
    error::{Error, Result},
};
use fxhash::FxHashSet;
use image::{
    imageops::{self, FilterType},
    GrayImage, Luma, RgbImage,
};
use imageproc::{
    filter::box_filter,
    region_labelling::{connected_components, Connectivity},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Parameters of the blob detection and cropping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TightCropParams {
    /// Window size of the uniform blur applied before thresholding.
    pub smooth_radius: u32,

    /// Blurred intensity (0-255) a pixel must exceed to count as foreground.
    pub blob_threshold: u8,

    /// Squares narrower than this are not worth zooming into.
    pub min_crop_size: u32,

    pub strategy: MergeStrategy,
}

impl Default for TightCropParams {
    fn default() -> Self {
        Self {
            smooth_radius: 10,
            blob_threshold: 50,
            min_crop_size: 10,
            strategy: MergeStrategy::FixedPoint,
        }
    }
}

/// Mean of the three colour channels of every pixel.
pub fn intensity(tile: &RgbImage) -> GrayImage {
    GrayImage::from_fn(tile.width(), tile.height(), |x, y| {
        let [r, g, b] = tile.get_pixel(x, y).0;
        Luma([((r as u16 + g as u16 + b as u16) / 3) as u8])
    })
}

/// Sets every background region that does not touch the image border.
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let inverted = GrayImage::from_fn(width, height, |x, y| {
        Luma([if mask.get_pixel(x, y)[0] == 0 { 255 } else { 0 }])
    });
    let labels = connected_components(&inverted, Connectivity::Four, Luma([0u8]));

    let mut exterior = FxHashSet::default();
    for x in 0..width {
        exterior.insert(labels.get_pixel(x, 0)[0]);
        exterior.insert(labels.get_pixel(x, height - 1)[0]);
    }
    for y in 0..height {
        exterior.insert(labels.get_pixel(0, y)[0]);
        exterior.insert(labels.get_pixel(width - 1, y)[0]);
    }

    GrayImage::from_fn(width, height, |x, y| {
        let label = labels.get_pixel(x, y)[0];
        let hole = label != 0 && !exterior.contains(&label);
        Luma([if mask.get_pixel(x, y)[0] != 0 || hole { 255 } else { 0 }])
    })
}

/// Detects contiguous foreground regions of a tile and returns one box per
/// region, with `x2`/`y2` one past the region's last column/row.
pub fn find_blobs(tile: &RgbImage, params: &TightCropParams) -> Vec<BBox> {
    if tile.width() == 0 || tile.height() == 0 {
        return Vec::new();
    }

    let radius = params.smooth_radius / 2;
    let smoothed = box_filter(&intensity(tile), radius, radius);
    let mask = GrayImage::from_fn(tile.width(), tile.height(), |x, y| {
        Luma([if smoothed.get_pixel(x, y)[0] > params.blob_threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&fill_holes(&mask), Connectivity::Four, Luma([0u8]));

    // Extents per label as (min_x, min_y, max_x, max_y).
    let mut extents: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if extents.len() < label {
            extents.resize(label, None);
        }
        let extent = extents[label - 1].get_or_insert((x, y, x, y));
        extent.0 = extent.0.min(x);
        extent.1 = extent.1.min(y);
        extent.2 = extent.2.max(x);
        extent.3 = extent.3.max(y);
    }

    extents
        .into_iter()
        .flatten()
        .map(|(x1, y1, x2, y2)| BBox::new(x1, y1, x2 + 1, y2 + 1))
        .collect()
}

/// The squared, merged box around the dominant blob of a tile, or an empty
/// box when the tile has no foreground.
pub fn biggest_square_bbox(tile: &RgbImage, params: &TightCropParams) -> BBox {
    let blobs = find_blobs(tile, params);
    if blobs.is_empty() {
        return BBox::default();
    }

    let merged = remove_overlaps(&blobs, params.strategy);
    match largest(&merged) {
        Some(bbox) => bbox.square_within(tile.width(), tile.height()),
        None => BBox::default(),
    }
}

/// Crops a tile to its dominant blob and resamples it back to the tile's size.
pub fn best_tight_crop(tile: &RgbImage, params: &TightCropParams) -> RgbImage {
    let bbox = biggest_square_bbox(tile, params);

    if bbox.width() < params.min_crop_size {
        debug!(?bbox, "crop too small, keeping tile");
        return tile.clone();
    }

    debug!(?bbox, "cropping tile");
    let cropped = imageops::crop_imm(tile, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image();
    imageops::resize(&cropped, tile.width(), tile.height(), FilterType::Triangle)
}

/// Iterates the `(x, width)` column spans of the tiles of a strip. Tiles start
/// every `tile_width + margin` columns; the last one is clipped to the strip.
#[derive(Debug, Clone)]
pub struct TileSpans {
    strip_width: u32,
    tile_width: u32,
    stride: u32,
    next: u32,
}

impl TileSpans {
    #[inline]
    pub fn new(strip_width: u32, tile_width: u32, margin: u32) -> Self {
        Self {
            strip_width,
            tile_width,
            stride: tile_width + margin,
            next: 0,
        }
    }
}

impl Iterator for TileSpans {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.tile_width == 0 || self.next >= self.strip_width {
            return None;
        }

        let x = self.next;
        self.next = self.next.saturating_add(self.stride);

        Some((x, self.tile_width.min(self.strip_width - x)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = if self.tile_width == 0 || self.next >= self.strip_width {
            0
        } else {
            ((self.strip_width - self.next - 1) / self.stride + 1) as usize
        };

        (count, Some(count))
    }
}

/// Tight-crops every tile of a strip independently and writes the results
/// into a copy of the strip. Margin columns are left untouched.
pub fn crop_tiled_image(
    strip: &RgbImage,
    tile_width: u32,
    margin: u32,
    params: &TightCropParams,
) -> RgbImage {
    let spans: Vec<(u32, u32)> = TileSpans::new(strip.width(), tile_width, margin).collect();

    let tiles: Vec<(u32, RgbImage)> = spans
        .par_iter()
        .map(|&(x, width)| {
            let tile = imageops::crop_imm(strip, x, 0, width, strip.height()).to_image();
            (x, best_tight_crop(&tile, params))
        })
        .collect();

    let mut out = strip.clone();
    for (x, tile) in &tiles {
        imageops::replace(&mut out, tile, *x as i64, 0);
    }
    out
}

/// Loads a montage, tight-crops its tiles and saves the result. Without an
/// explicit tile width the tiles are taken to be square, as wide as the
/// strip is tall.
pub fn crop_montage_file(
    input: &Path,
    output: &Path,
    tile_width: Option<u32>,
    margin: u32,
    params: &TightCropParams,
) -> Result<()> {
    let strip = image::open(input)
        .map_err(|source| Error::ImageLoadFailure {
            path: input.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let tile_width = tile_width.unwrap_or(strip.height());
    crop_tiled_image(&strip, tile_width, margin, params).save(output)?;

    Ok(())
}

/// Name of the tight-cropped counterpart of a montage file, or `None` if the
/// file is not an uncropped `*-unitNNN.jpg` montage.
pub fn cropped_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".jpg")?;
    let (_, unit) = stem.rsplit_once("-unit")?;

    if unit.is_empty() || !unit.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(format!("{stem}_crop.jpg"))
}

/// Tight-crops every montage in `dir` whose cropped version does not exist
/// yet. Returns how many files were written.
pub fn crop_directory(dir: &Path, margin: u32, params: &TightCropParams) -> Result<usize> {
    let mut inputs: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            cropped_name(&name).map(|out| (entry.path(), dir.join(out)))
        })
        .collect();
    inputs.sort();

    let mut written = 0;
    for (input, output) in inputs {
        if output.exists() {
            debug!(?output, "already cropped");
            continue;
        }
        info!(?input, "processing");
        crop_montage_file(&input, &output, None, margin, params)?;
        written += 1;
    }

    Ok(written)
}
