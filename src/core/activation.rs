//! Activation storage.
//!
//! `FeatureMaps` holds the full channel-major activations a classifier returns
//! for one batch, `[images, units, height, width]`, in a single flat vec. Each
//! `(image, unit)` map occupies a contiguous subrange of that vec.
//!
//! `ActivationMatrix` keeps only what ranking needs: the spatial maximum of
//! every unit for every image of the dataset, one row per image. It is filled
//! batch by batch during a scan and read-only afterwards.

use super::error::{Error, Result};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    ops::Range,
    path::{Path, PathBuf},
};

/// Channel-major activations of one layer for a batch of images.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMaps {
    images: usize,
    units: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl FeatureMaps {
    pub fn new(images: usize, units: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        let expected = images * units * height * width;
        if data.len() != expected {
            return Err(Error::InvalidShape {
                expected: format!("{images}x{units}x{height}x{width} = {expected} values"),
                got: format!("{} values", data.len()),
            });
        }

        Ok(Self {
            images,
            units,
            height,
            width,
            data,
        })
    }

    pub fn zeros(images: usize, units: usize, height: usize, width: usize) -> Self {
        Self {
            images,
            units,
            height,
            width,
            data: vec![0.0; images * units * height * width],
        }
    }

    #[inline]
    pub fn images(&self) -> usize {
        self.images
    }

    #[inline]
    pub fn units(&self) -> usize {
        self.units
    }

    /// Spatial size `(height, width)` of each map.
    #[inline]
    pub fn spatial(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn map_range(&self, image: usize, unit: usize) -> Range<usize> {
        let size = self.height * self.width;
        let start = (image * self.units + unit) * size;
        start..start + size
    }

    /// The row-major `height × width` map of one unit for one image.
    #[inline]
    pub fn map(&self, image: usize, unit: usize) -> &[f32] {
        &self.data[self.map_range(image, unit)]
    }

    #[inline]
    pub fn map_mut(&mut self, image: usize, unit: usize) -> &mut [f32] {
        let range = self.map_range(image, unit);
        &mut self.data[range]
    }

    /// Maximum of one map over both spatial axes.
    #[inline]
    pub fn spatial_max(&self, image: usize, unit: usize) -> f32 {
        self.map(image, unit)
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    /// Mean of one map over both spatial axes.
    #[inline]
    pub fn spatial_mean(&self, image: usize, unit: usize) -> f32 {
        let map = self.map(image, unit);
        map.iter().sum::<f32>() / map.len().max(1) as f32
    }
}

/// Activations of every requested layer for one batch, keyed by layer name.
pub type LayerActivations = FxHashMap<String, FeatureMaps>;

/// Weights of a classifier's final linear layer, `[classes × units]`, used to
/// rank units per class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub classes: usize,
    pub units: usize,
    pub data: Vec<f32>,
}

impl ClassWeights {
    #[inline]
    pub fn row(&self, class: usize) -> &[f32] {
        &self.data[class * self.units..(class + 1) * self.units]
    }

    /// Units sorted by weight for `class`, strongest first, truncated to `n`.
    pub fn top_units(&self, class: usize, n: usize) -> Vec<usize> {
        let mut ranking = UnitRanking::from_values(self.row(class));
        ranking.order.truncate(n);
        ranking.order
    }
}

/// How a unit's map is collapsed to one value per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Spatial maximum, used for ranking.
    #[default]
    Max,
    /// Global average pooling, used for feature extraction.
    Mean,
}

impl Reduction {
    #[inline]
    pub fn apply(&self, maps: &FeatureMaps, image: usize, unit: usize) -> f32 {
        match self {
            Reduction::Max => maps.spatial_max(image, unit),
            Reduction::Mean => maps.spatial_mean(image, unit),
        }
    }
}

/// Per-image, per-unit reduced activations (normally spatial maxima) of one
/// layer over a whole dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationMatrix {
    pub layer: String,
    pub images: Vec<PathBuf>,
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl ActivationMatrix {
    pub fn new(layer: &str, images: Vec<PathBuf>, cols: usize) -> Self {
        let rows = images.len();
        Self {
            layer: layer.to_string(),
            images,
            rows,
            cols,
            values: vec![0.0; rows * cols],
        }
    }

    /// Number of images.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of units.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, image: usize, unit: usize) -> f32 {
        self.values[image * self.cols + unit]
    }

    #[inline]
    pub fn row(&self, image: usize) -> &[f32] {
        &self.values[image * self.cols..(image + 1) * self.cols]
    }

    /// Activations of one unit over all images.
    pub fn column(&self, unit: usize) -> Vec<f32> {
        (0..self.rows).map(|image| self.get(image, unit)).collect()
    }

    /// Writes the spatially reduced `maps` into rows starting at `start`. Only
    /// as many rows as remain in the matrix are written, so a final partial
    /// batch cannot run past the end.
    pub fn write_rows(&mut self, start: usize, maps: &FeatureMaps, reduction: Reduction) -> Result<usize> {
        if maps.units() != self.cols {
            return Err(Error::InvalidShape {
                expected: format!("{} units", self.cols),
                got: format!("{} units", maps.units()),
            });
        }

        let end = (start + maps.images()).min(self.rows);
        for (image, row) in (start..end).enumerate() {
            for unit in 0..self.cols {
                self.values[row * self.cols + unit] = reduction.apply(maps, image, unit);
            }
        }

        Ok(end.saturating_sub(start))
    }

    /// Images ranked by their activation on `unit`.
    pub fn ranking(&self, unit: usize) -> UnitRanking {
        UnitRanking::from_values(&self.column(unit))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::MissingResource {
                path: path.to_path_buf(),
            },
            _ => Error::Io(err),
        })?;
        let matrix: Self = bincode::deserialize_from(BufReader::new(file))?;

        if matrix.values.len() != matrix.rows * matrix.cols || matrix.images.len() != matrix.rows {
            return Err(Error::InvalidShape {
                expected: format!("{}x{} matrix", matrix.rows, matrix.cols),
                got: format!("{} values, {} images", matrix.values.len(), matrix.images.len()),
            });
        }

        Ok(matrix)
    }
}

/// Image indices ordered by descending activation. Ties keep index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRanking {
    order: Vec<usize>,
}

impl UnitRanking {
    pub fn from_values(values: &[f32]) -> Self {
        let mut order: Vec<usize> = (0..values.len()).collect();
        // Stable sort, NaN ranks last.
        order.sort_by(|&a, &b| {
            let (va, vb) = (values[a], values[b]);
            match (va.is_nan(), vb.is_nan()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => vb.total_cmp(&va),
            }
        });
        Self { order }
    }

    #[inline]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// The first `k` image indices (fewer if the dataset is smaller).
    #[inline]
    pub fn top_k(&self, k: usize) -> &[usize] {
        &self.order[..k.min(self.order.len())]
    }
}
