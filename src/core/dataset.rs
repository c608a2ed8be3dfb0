//! Image lists, preprocessing and deterministic batching.
//!
//! Batches are produced strictly in list order: the scanner relies on batch
//! `i` covering rows `i * batch_size ..` of the activation matrix. Within a
//! batch, images are decoded in parallel and collected back in order.

use super::error::{Error, Result};
use image::{imageops::FilterType, RgbImage};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// A batch of preprocessed images, `[len, 3, height, width]`, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    len: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageBatch {
    pub fn new(len: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != len * 3 * height * width {
            return Err(Error::InvalidShape {
                expected: format!("{len}x3x{height}x{width}"),
                got: format!("{} values", data.len()),
            });
        }

        Ok(Self {
            len,
            height,
            width,
            data,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Channel-major pixels of one image.
    #[inline]
    pub fn image(&self, index: usize) -> &[f32] {
        let size = 3 * self.height * self.width;
        &self.data[index * size..(index + 1) * size]
    }
}

/// Reads a newline-delimited image list and resolves every entry against
/// `root`. Blank lines are ignored.
pub fn read_image_list(list: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(list).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => Error::MissingResource {
            path: list.to_path_buf(),
        },
        _ => Error::Io(err),
    })?;

    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| root.join(line))
        .collect())
}

/// Opens an image as 8-bit RGB, reporting the offending path on failure.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| Error::ImageLoadFailure {
            path: path.to_path_buf(),
            source,
        })
}

/// Resize to a fixed size, then per-channel `(v - mean) / std` on [0, 1]
/// pixel values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub width: u32,
    pub height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Transform {
    /// ImageNet statistics.
    pub fn imagenet(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// Channel-major normalized pixels of `img`.
    pub fn apply(&self, img: &RgbImage) -> Vec<f32> {
        let resized = image::imageops::resize(img, self.width, self.height, FilterType::Triangle);
        let plane = (self.width * self.height) as usize;
        let mut out = vec![0.0; 3 * plane];

        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..3 {
                out[c * plane + i] = (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        out
    }
}

/// An ordered list of images with the transform applied when batching.
#[derive(Debug, Clone)]
pub struct Dataset {
    paths: Vec<PathBuf>,
    transform: Transform,
}

impl Dataset {
    pub fn new(paths: Vec<PathBuf>, transform: Transform) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::EmptyDataset);
        }

        Ok(Self { paths, transform })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[inline]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    #[inline]
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Number of batches of `batch_size`, counting a final partial batch.
    #[inline]
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.paths.len().div_ceil(batch_size.max(1))
    }

    /// Loads and transforms the images at `paths` into one batch.
    pub fn load_batch(&self, paths: &[PathBuf]) -> Result<ImageBatch> {
        let pixels = paths
            .par_iter()
            .map(|path| load_rgb(path).map(|img| self.transform.apply(&img)))
            .collect::<Result<Vec<_>>>()?;

        ImageBatch::new(
            paths.len(),
            self.transform.height as usize,
            self.transform.width as usize,
            pixels.concat(),
        )
    }

    /// Iterates consecutive batches in list order. The last batch holds the
    /// remainder and may be smaller.
    pub fn batches(&self, batch_size: usize) -> Batches<'_> {
        Batches {
            dataset: self,
            chunks: self.paths.chunks(batch_size.max(1)),
        }
    }
}

/// Iterator over the batches of a [`Dataset`].
pub struct Batches<'a> {
    dataset: &'a Dataset,
    chunks: std::slice::Chunks<'a, PathBuf>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Result<(ImageBatch, &'a [PathBuf])>;

    fn next(&mut self) -> Option<Self::Item> {
        let paths = self.chunks.next()?;
        Some(self.dataset.load_batch(paths).map(|batch| (batch, paths)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
