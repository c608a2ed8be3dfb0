//! The montage builder.
//!
//! For each unit of a layer, the top-ranked images are run through the
//! classifier again to recover the unit's full feature maps. Each map is
//! normalized, upsampled to the tile size and binarized into a mask. The mask
//! is then applied to the image, and the masked tiles are laid side by side
//! with white separators.
//!
//! The normalization reference is the first non-zero maximum among the unit's
//! top images and is shared by all of them. Activations of one unit across its
//! top images are on a comparable scale, so later tiles are not renormalized.

use super::{
    activation::ActivationMatrix,
    classifier::Classifier,
    config::VisualizerConfig,
    dataset::{load_rgb, Dataset},
    error::{Error, Result},
    tightcrop::crop_tiled_image,
};
use image::{
    imageops::{self, FilterType},
    ImageBuffer, Luma, Rgb, RgbImage,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of a unit's montage, e.g. `layer4-unit007.jpg`.
pub fn montage_file_name(layer: &str, unit: usize, cropped: bool) -> String {
    if cropped {
        format!("{layer}-unit{unit:03}_crop.jpg")
    } else {
        format!("{layer}-unit{unit:03}.jpg")
    }
}

/// Scales a `height × width` map by `1 / max_value`, resizes it to a
/// `tile × tile` grid and binarizes it: 1 above `threshold`, 0 below. Values
/// exactly at `threshold` keep their scaled value.
pub fn unit_mask(
    map: &[f32],
    (height, width): (usize, usize),
    max_value: f32,
    tile: u32,
    threshold: f32,
) -> Result<Vec<f32>> {
    let pixels = (tile * tile) as usize;
    if max_value == 0.0 || !max_value.is_finite() {
        return Ok(vec![0.0; pixels]);
    }

    let scaled: Vec<f32> = map.iter().map(|v| v / max_value).collect();
    let grid: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(width as u32, height as u32, scaled).ok_or_else(|| {
            Error::InvalidShape {
                expected: format!("{height}x{width} map"),
                got: format!("{} values", map.len()),
            }
        })?;
    let resized = imageops::resize(&grid, tile, tile, FilterType::Triangle);

    Ok(resized
        .into_raw()
        .into_iter()
        .map(|v| {
            if v > threshold {
                1.0
            } else if v < threshold {
                0.0
            } else {
                v
            }
        })
        .collect())
}

/// Resizes `img` to a `tile × tile` square, stretches its values to [0, 1]
/// over all channels and multiplies every pixel by the mask.
pub fn masked_tile(img: &RgbImage, mask: &[f32], tile: u32) -> RgbImage {
    let resized = imageops::resize(img, tile, tile, FilterType::Triangle);

    let (lo, hi) = resized
        .pixels()
        .flat_map(|p| p.0)
        .fold((u8::MAX, u8::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let range = hi.saturating_sub(lo) as f32;

    RgbImage::from_fn(tile, tile, |x, y| {
        let weight = mask[(y * tile + x) as usize];
        let p = resized.get_pixel(x, y);
        Rgb(p.0.map(|v| {
            let normalized = if range > 0.0 { (v - lo) as f32 / range } else { 0.0 };
            (normalized * weight * 255.0) as u8
        }))
    })
}

/// Lays tiles out left to right, each followed by a white separator `margin`
/// pixels wide.
pub fn concat_tiles(tiles: &[RgbImage], tile: u32, margin: u32) -> RgbImage {
    let width = tiles.len() as u32 * (tile + margin);
    let mut montage = RgbImage::from_pixel(width, tile, Rgb([255, 255, 255]));

    for (i, t) in tiles.iter().enumerate() {
        imageops::replace(&mut montage, t, (i as u32 * (tile + margin)) as i64, 0);
    }

    montage
}

/// Builds the montage of one unit from the images ranked highest on it.
pub fn build_unit_montage(
    dataset: &Dataset,
    classifier: &mut dyn Classifier,
    matrix: &ActivationMatrix,
    unit: usize,
    config: &VisualizerConfig,
) -> Result<RgbImage> {
    let ranking = matrix.ranking(unit);
    let top: Vec<PathBuf> = ranking
        .top_k(config.num_top)
        .iter()
        .map(|&i| dataset.paths()[i].clone())
        .collect();

    let batch = dataset.load_batch(&top)?;
    let activations = classifier.embed(&batch, &[matrix.layer.as_str()])?;
    let maps = activations
        .get(&matrix.layer)
        .ok_or_else(|| Error::MissingLayer(matrix.layer.clone()))?;

    let mut max_value = 0.0;
    let mut tiles = Vec::with_capacity(top.len());

    for (i, path) in top.iter().enumerate() {
        if max_value == 0.0 {
            max_value = maps.spatial_max(i, unit);
        }

        let mask = unit_mask(
            maps.map(i, unit),
            maps.spatial(),
            max_value,
            config.tile_size,
            config.threshold_scale,
        )?;
        tiles.push(masked_tile(&load_rgb(path)?, &mask, config.tile_size));
    }

    if max_value == 0.0 {
        warn!(layer = %matrix.layer, unit, "unit never activates on its top images");
    }

    Ok(concat_tiles(&tiles, config.tile_size, config.margin))
}

/// Builds, saves and optionally tight-crops the montage of every unit of the
/// matrix's layer. Returns the written files.
pub fn visualize_layer(
    dataset: &Dataset,
    classifier: &mut dyn Classifier,
    matrix: &ActivationMatrix,
    config: &VisualizerConfig,
    image_dir: &Path,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(image_dir)?;

    let num_units = matrix.cols();
    let mut written = Vec::with_capacity(num_units * 2);

    for unit in 0..num_units {
        info!("{} / {}", unit + 1, num_units);

        let montage = build_unit_montage(dataset, classifier, matrix, unit, config)?;
        let path = image_dir.join(montage_file_name(&matrix.layer, unit, false));
        montage.save(&path)?;
        written.push(path);

        if config.tight_crop {
            let cropped = crop_tiled_image(&montage, config.tile_size, config.margin, &config.crop);
            let path = image_dir.join(montage_file_name(&matrix.layer, unit, true));
            cropped.save(&path)?;
            debug!(?path, "saved tight crop");
            written.push(path);
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_montage_file_name() {
        assert_eq!(montage_file_name("layer4", 7, false), "layer4-unit007.jpg");
        assert_eq!(montage_file_name("pool", 123, true), "pool-unit123_crop.jpg");
    }

    #[test]
    fn test_unit_mask_thresholds_relative_to_max() {
        let mask = unit_mask(&[4.0, 4.0, 4.0, 4.0], (2, 2), 4.0, 3, 0.2).unwrap();
        assert_eq!(mask, vec![1.0; 9]);

        let mask = unit_mask(&[0.4; 4], (2, 2), 4.0, 3, 0.2).unwrap();
        assert_eq!(mask, vec![0.0; 9]);
    }

    #[test]
    fn test_unit_mask_keeps_values_at_threshold() {
        let mask = unit_mask(&[2.0, 2.0, 1.0, 0.5], (2, 2), 2.0, 2, 0.5).unwrap();
        assert_eq!(mask, vec![1.0, 1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_unit_mask_with_zero_max_is_empty() {
        let mask = unit_mask(&[0.0; 4], (2, 2), 0.0, 5, 0.2).unwrap();
        assert_eq!(mask, vec![0.0; 25]);
    }

    #[test]
    fn test_unit_mask_rejects_bad_shape() {
        assert!(matches!(
            unit_mask(&[1.0; 3], (2, 2), 1.0, 4, 0.2),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_masked_tile_stretches_and_masks() {
        let img = RgbImage::from_fn(4, 4, |x, _| if x < 2 { Rgb([50, 50, 50]) } else { Rgb([150, 150, 150]) });
        let mut mask = vec![1.0; 16];
        mask[15] = 0.0;

        let tile = masked_tile(&img, &mask, 4);
        assert_eq!(tile.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(tile.get_pixel(3, 0), &Rgb([255, 255, 255]));
        assert_eq!(tile.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_concat_tiles_adds_white_separators() {
        let tiles = vec![RgbImage::new(5, 5), RgbImage::new(5, 5)];
        let montage = concat_tiles(&tiles, 5, 2);
        assert_eq!(montage.dimensions(), (14, 5));
        assert_eq!(montage.get_pixel(4, 0), &Rgb([0, 0, 0]));
        assert_eq!(montage.get_pixel(5, 0), &Rgb([255, 255, 255]));
        assert_eq!(montage.get_pixel(7, 0), &Rgb([0, 0, 0]));
        assert_eq!(montage.get_pixel(13, 4), &Rgb([255, 255, 255]));
    }
}
