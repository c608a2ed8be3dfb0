//! The activation scanner.
//!
//! Runs the whole dataset through the classifier once, batch by batch and in
//! list order, and collapses every unit map to a single value per image. The
//! full maps are dropped right after each batch to bound memory; the montage
//! builder recomputes them for the few images it needs.

use super::{
    activation::{ActivationMatrix, Reduction},
    classifier::Classifier,
    dataset::Dataset,
    error::{Error, Result},
};
use fxhash::FxHashMap;
use tracing::{debug, info};

/// What a scan processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Number of images in each batch, in order.
    pub batch_sizes: Vec<usize>,
}

impl ScanReport {
    pub fn images(&self) -> usize {
        self.batch_sizes.iter().sum()
    }
}

/// Scans `dataset` and returns one matrix of spatial maxima per layer.
pub fn scan(
    dataset: &Dataset,
    classifier: &mut dyn Classifier,
    layers: &[&str],
    batch_size: usize,
) -> Result<(FxHashMap<String, ActivationMatrix>, ScanReport)> {
    scan_with(dataset, classifier, layers, batch_size, Reduction::Max)
}

/// Scans `dataset` and returns one matrix of global-average-pooled features
/// per layer.
pub fn extract_features(
    dataset: &Dataset,
    classifier: &mut dyn Classifier,
    layers: &[&str],
    batch_size: usize,
) -> Result<(FxHashMap<String, ActivationMatrix>, ScanReport)> {
    scan_with(dataset, classifier, layers, batch_size, Reduction::Mean)
}

/// Scans `dataset`, reducing every unit map with `reduction`.
pub fn scan_with(
    dataset: &Dataset,
    classifier: &mut dyn Classifier,
    layers: &[&str],
    batch_size: usize,
    reduction: Reduction,
) -> Result<(FxHashMap<String, ActivationMatrix>, ScanReport)> {
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let batch_size = batch_size.max(1);
    let num_batches = dataset.num_batches(batch_size);
    let mut matrices: FxHashMap<String, ActivationMatrix> = FxHashMap::default();
    let mut report = ScanReport::default();

    for (batch_idx, batch) in dataset.batches(batch_size).enumerate() {
        let (batch, _paths) = batch?;
        info!("{} / {}", batch_idx + 1, num_batches);

        let activations = classifier.embed(&batch, layers)?;
        let start = batch_idx * batch_size;

        for &layer in layers {
            let maps = activations
                .get(layer)
                .ok_or_else(|| Error::MissingLayer(layer.to_string()))?;
            if maps.images() != batch.len() {
                return Err(Error::InvalidShape {
                    expected: format!("{} maps for layer {layer}", batch.len()),
                    got: format!("{} maps", maps.images()),
                });
            }

            let matrix = matrices.entry(layer.to_string()).or_insert_with(|| {
                debug!(layer, units = maps.units(), "allocating activation matrix");
                ActivationMatrix::new(layer, dataset.paths().to_vec(), maps.units())
            });

            matrix.write_rows(start, maps, reduction)?;
        }

        report.batch_sizes.push(batch.len());
    }

    Ok((matrices, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        activation::{FeatureMaps, LayerActivations},
        dataset::{ImageBatch, Transform},
    };
    use image::{Rgb, RgbImage};

    /// Reports each image's mean normalized red value as a 1x1 map.
    struct RedProbe;

    impl Classifier for RedProbe {
        fn name(&self) -> &str {
            "red_probe"
        }

        fn layer_names(&self) -> Vec<&str> {
            vec!["red"]
        }

        fn embed(&mut self, batch: &ImageBatch, _layers: &[&str]) -> Result<LayerActivations> {
            let plane = batch.height() * batch.width();
            let data = (0..batch.len())
                .map(|i| batch.image(i)[..plane].iter().sum::<f32>() / plane as f32)
                .collect();
            let mut out = LayerActivations::default();
            out.insert("red".into(), FeatureMaps::new(batch.len(), 1, 1, 1, data)?);
            Ok(out)
        }
    }

    #[test]
    fn test_scan_keeps_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let reds = [10u8, 200, 90, 250, 0];
        let paths: Vec<_> = reds
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                let path = dir.path().join(format!("{i}.png"));
                RgbImage::from_pixel(4, 4, Rgb([r, 0, 0])).save(&path).unwrap();
                path
            })
            .collect();
        let dataset = Dataset::new(paths, Transform::imagenet(4, 4)).unwrap();

        let (matrices, report) = scan(&dataset, &mut RedProbe, &["red"], 2).unwrap();
        assert_eq!(report.batch_sizes, vec![2, 2, 1]);

        let matrix = &matrices["red"];
        assert_eq!(matrix.rows(), 5);
        assert_eq!(matrix.ranking(0).top_k(3), &[3, 1, 2]);
    }

    /// Drops the last image of every batch.
    struct ShortBatches;

    impl Classifier for ShortBatches {
        fn name(&self) -> &str {
            "short_batches"
        }

        fn layer_names(&self) -> Vec<&str> {
            vec!["red"]
        }

        fn embed(&mut self, batch: &ImageBatch, _layers: &[&str]) -> Result<LayerActivations> {
            let images = batch.len() - 1;
            let mut out = LayerActivations::default();
            out.insert("red".into(), FeatureMaps::new(images, 1, 1, 1, vec![5.0; images])?);
            Ok(out)
        }
    }

    #[test]
    fn test_short_classifier_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..4)
            .map(|i| {
                let path = dir.path().join(format!("{i}.png"));
                RgbImage::new(4, 4).save(&path).unwrap();
                path
            })
            .collect();
        let dataset = Dataset::new(paths, Transform::imagenet(4, 4)).unwrap();

        assert!(matches!(
            scan(&dataset, &mut ShortBatches, &["red"], 2),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_missing_layer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        RgbImage::new(4, 4).save(&path).unwrap();
        let dataset = Dataset::new(vec![path], Transform::imagenet(4, 4)).unwrap();

        assert!(matches!(
            scan(&dataset, &mut RedProbe, &["blue"], 4),
            Err(Error::MissingLayer(_))
        ));
    }
}
