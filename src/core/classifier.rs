//! The classifier service.
//!
//! A classifier maps a batch of preprocessed images to the activations of the
//! layers asked for. Activations come back as an explicit map from layer name
//! to `FeatureMaps`; nothing is captured through side channels.
//!
//! Two small built-in backends are provided, selected through
//! [`ClassifierKind`]. Both are deterministic so runs are reproducible.

use super::{
    activation::{ClassWeights, FeatureMaps, LayerActivations},
    dataset::ImageBatch,
    error::{Error, Result},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Anything that can embed a batch of images into per-layer activations.
pub trait Classifier: Send {
    /// Short name used for output folders.
    fn name(&self) -> &str;

    /// Layers this classifier can report, in network order.
    fn layer_names(&self) -> Vec<&str>;

    /// Runs one forward pass and returns the activations of `layers`.
    fn embed(&mut self, batch: &ImageBatch, layers: &[&str]) -> Result<LayerActivations>;

    /// Weights of the final linear layer, if the classifier has one.
    fn class_weights(&self) -> Option<&ClassWeights> {
        None
    }
}

/// The supported classifier backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Seeded random 3x3 convolution, ReLU and 2x2 max pooling, topped by a
    /// random linear head.
    RandomFilters { filters: usize, classes: usize, seed: u64 },

    /// Rectified colour channels, average pooled 4x.
    ColorChannels,
}

impl Default for ClassifierKind {
    fn default() -> Self {
        ClassifierKind::RandomFilters {
            filters: 32,
            classes: 10,
            seed: 42,
        }
    }
}

impl ClassifierKind {
    pub fn build(&self) -> Box<dyn Classifier> {
        match *self {
            ClassifierKind::RandomFilters {
                filters,
                classes,
                seed,
            } => Box::new(RandomFilters::new(filters, classes, seed)),
            ClassifierKind::ColorChannels => Box::new(ColorChannels),
        }
    }

    /// The layer visualized when none is named explicitly.
    pub fn default_layer(&self) -> &'static str {
        match self {
            ClassifierKind::RandomFilters { .. } => "pool",
            ClassifierKind::ColorChannels => "color",
        }
    }
}

/// Output size of a stride-`stride` window sweep that keeps partial windows.
#[inline]
fn ceil_div(size: usize, stride: usize) -> usize {
    size.div_ceil(stride)
}

/// Average pooling with square `window`, partial windows at the far edges.
fn avg_pool(input: &[f32], height: usize, width: usize, window: usize, out: &mut [f32]) {
    let out_w = ceil_div(width, window);
    for (i, value) in out.iter_mut().enumerate() {
        let (oy, ox) = (i / out_w, i % out_w);
        let ys = oy * window..((oy + 1) * window).min(height);
        let mut sum = 0.0;
        let mut count = 0;
        for y in ys {
            for x in ox * window..((ox + 1) * window).min(width) {
                sum += input[y * width + x];
                count += 1;
            }
        }
        *value = sum / count.max(1) as f32;
    }
}

/// Max pooling with square `window`, partial windows at the far edges.
fn max_pool(input: &[f32], height: usize, width: usize, window: usize, out: &mut [f32]) {
    let out_w = ceil_div(width, window);
    for (i, value) in out.iter_mut().enumerate() {
        let (oy, ox) = (i / out_w, i % out_w);
        *value = f32::NEG_INFINITY;
        for y in oy * window..((oy + 1) * window).min(height) {
            for x in ox * window..((ox + 1) * window).min(width) {
                *value = value.max(input[y * width + x]);
            }
        }
    }
}

fn check_layers(known: &[&str], layers: &[&str]) -> Result<()> {
    match layers.iter().find(|layer| !known.contains(*layer)) {
        Some(layer) => Err(Error::MissingLayer(layer.to_string())),
        None => Ok(()),
    }
}

/// A one-block convolutional network with random weights.
pub struct RandomFilters {
    filters: usize,
    /// `[filter][channel][ky][kx]`, flattened.
    kernels: Vec<f32>,
    head: ClassWeights,
}

impl RandomFilters {
    const KERNEL: usize = 3;
    const STRIDE: usize = 2;

    pub fn new(filters: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let kernels = (0..filters * 3 * Self::KERNEL * Self::KERNEL)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let head = ClassWeights {
            classes,
            units: filters,
            data: (0..classes * filters)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect(),
        };

        Self {
            filters,
            kernels,
            head,
        }
    }

    /// Zero-padded stride-2 convolution followed by ReLU.
    fn conv1(&self, batch: &ImageBatch) -> FeatureMaps {
        let (h, w) = (batch.height(), batch.width());
        let (oh, ow) = (ceil_div(h, Self::STRIDE), ceil_div(w, Self::STRIDE));
        let k = Self::KERNEL;
        let mut maps = FeatureMaps::zeros(batch.len(), self.filters, oh, ow);

        for image in 0..batch.len() {
            let pixels = batch.image(image);
            for filter in 0..self.filters {
                let weights = &self.kernels[filter * 3 * k * k..(filter + 1) * 3 * k * k];
                let out = maps.map_mut(image, filter);

                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut sum = 0.0;
                        for c in 0..3 {
                            for ky in 0..k {
                                let y = (oy * Self::STRIDE + ky) as isize - 1;
                                if y < 0 || y >= h as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let x = (ox * Self::STRIDE + kx) as isize - 1;
                                    if x < 0 || x >= w as isize {
                                        continue;
                                    }
                                    sum += weights[(c * k + ky) * k + kx]
                                        * pixels[(c * h + y as usize) * w + x as usize];
                                }
                            }
                        }
                        out[oy * ow + ox] = sum.max(0.0);
                    }
                }
            }
        }

        maps
    }
}

impl Classifier for RandomFilters {
    fn name(&self) -> &str {
        "random_filters"
    }

    fn layer_names(&self) -> Vec<&str> {
        vec!["conv1", "pool"]
    }

    fn embed(&mut self, batch: &ImageBatch, layers: &[&str]) -> Result<LayerActivations> {
        check_layers(&self.layer_names(), layers)?;

        let conv = self.conv1(batch);
        let mut out = LayerActivations::default();

        if layers.contains(&"pool") {
            let (h, w) = conv.spatial();
            let (ph, pw) = (ceil_div(h, 2), ceil_div(w, 2));
            let mut pooled = FeatureMaps::zeros(conv.images(), conv.units(), ph, pw);
            for image in 0..conv.images() {
                for unit in 0..conv.units() {
                    max_pool(conv.map(image, unit), h, w, 2, pooled.map_mut(image, unit));
                }
            }
            out.insert("pool".to_string(), pooled);
        }

        if layers.contains(&"conv1") {
            out.insert("conv1".to_string(), conv);
        }

        Ok(out)
    }

    fn class_weights(&self) -> Option<&ClassWeights> {
        Some(&self.head)
    }
}

/// Rectified colour channels, one unit per channel.
pub struct ColorChannels;

impl ColorChannels {
    const POOL: usize = 4;
}

impl Classifier for ColorChannels {
    fn name(&self) -> &str {
        "color_channels"
    }

    fn layer_names(&self) -> Vec<&str> {
        vec!["color"]
    }

    fn embed(&mut self, batch: &ImageBatch, layers: &[&str]) -> Result<LayerActivations> {
        check_layers(&self.layer_names(), layers)?;

        let (h, w) = (batch.height(), batch.width());
        let (oh, ow) = (ceil_div(h, Self::POOL), ceil_div(w, Self::POOL));
        let mut maps = FeatureMaps::zeros(batch.len(), 3, oh, ow);

        for image in 0..batch.len() {
            let pixels = batch.image(image);
            for c in 0..3 {
                let rectified: Vec<f32> = pixels[c * h * w..(c + 1) * h * w]
                    .iter()
                    .map(|v| v.max(0.0))
                    .collect();
                avg_pool(&rectified, h, w, Self::POOL, maps.map_mut(image, c));
            }
        }

        let mut out = LayerActivations::default();
        if !layers.is_empty() {
            out.insert("color".to_string(), maps);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(len: usize, size: usize, value: f32) -> ImageBatch {
        ImageBatch::new(len, size, size, vec![value; len * 3 * size * size]).unwrap()
    }

    #[test]
    fn test_random_filters_shapes() {
        let mut net = RandomFilters::new(4, 3, 7);
        let out = net.embed(&batch(2, 9, 0.5), &["conv1", "pool"]).unwrap();

        let conv = &out["conv1"];
        assert_eq!((conv.images(), conv.units(), conv.spatial()), (2, 4, (5, 5)));
        let pool = &out["pool"];
        assert_eq!((pool.images(), pool.units(), pool.spatial()), (2, 4, (3, 3)));
        assert!(conv.map(1, 3).iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_random_filters_are_seeded() {
        let input = batch(1, 8, 0.3);
        let mut a = RandomFilters::new(4, 2, 1);
        let mut b = RandomFilters::new(4, 2, 1);
        assert_eq!(
            a.embed(&input, &["pool"]).unwrap()["pool"],
            b.embed(&input, &["pool"]).unwrap()["pool"]
        );
        assert_eq!(a.class_weights().unwrap().data.len(), 8);
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        let mut net = ColorChannels;
        assert!(matches!(
            net.embed(&batch(1, 4, 0.0), &["layer4"]),
            Err(Error::MissingLayer(name)) if name == "layer4"
        ));
    }

    #[test]
    fn test_color_channels_pool() {
        let mut net = ColorChannels;
        let out = net.embed(&batch(1, 8, -1.0), &["color"]).unwrap();
        let color = &out["color"];
        assert_eq!(color.spatial(), (2, 2));
        assert_eq!(color.spatial_max(0, 2), 0.0);

        let out = net.embed(&batch(1, 8, 2.0), &["color"]).unwrap();
        assert_eq!(out["color"].map(0, 1), &[2.0; 4]);
        assert!(net.class_weights().is_none());
    }

    #[test]
    fn test_kind_builds_backend() {
        let kind = ClassifierKind::default();
        let net = kind.build();
        assert_eq!(net.name(), "random_filters");
        assert!(net.layer_names().contains(&kind.default_layer()));
        assert_eq!(ClassifierKind::ColorChannels.build().layer_names(), vec!["color"]);
    }
}
