//! Run-wide settings. They are fixed when a run starts and never change
//! during it.

use super::{
    classifier::ClassifierKind,
    dataset::Transform,
    error::{Error, Result},
    tightcrop::TightCropParams,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Side length images are resized to before entering the classifier.
    pub image_size: u32,

    /// Side length of one montage tile.
    pub tile_size: u32,

    /// How many top-activating images go into each unit's montage.
    pub num_top: usize,

    /// Width of the white separator after each tile.
    pub margin: u32,

    /// Fraction of the unit's maximum activation the mask is cut at. Smaller
    /// values give larger segments.
    pub threshold_scale: f32,

    pub batch_size: usize,

    /// Also save a tight-cropped copy of every montage.
    pub tight_crop: bool,

    pub crop: TightCropParams,

    pub classifier: ClassifierKind,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            tile_size: 100,
            num_top: 15,
            margin: 4,
            threshold_scale: 0.2,
            batch_size: 64,
            tight_crop: true,
            crop: TightCropParams::default(),
            classifier: ClassifierKind::default(),
        }
    }
}

impl VisualizerConfig {
    /// Loads a JSON config; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::MissingResource {
                path: path.to_path_buf(),
            },
            _ => Error::Io(err),
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("image_size", self.image_size as usize),
            ("tile_size", self.tile_size as usize),
            ("num_top", self.num_top),
            ("batch_size", self.batch_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }

        if !(0.0..=1.0).contains(&self.threshold_scale) {
            return Err(Error::InvalidConfig(format!(
                "threshold_scale must lie in [0, 1], got {}",
                self.threshold_scale
            )));
        }

        if let ClassifierKind::RandomFilters { filters: 0, .. } = self.classifier {
            return Err(Error::InvalidConfig("classifier needs at least one filter".into()));
        }

        Ok(())
    }

    pub fn transform(&self) -> Transform {
        Transform::imagenet(self.image_size, self.image_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bbox::MergeStrategy;

    #[test]
    fn test_defaults_are_valid() {
        assert!(VisualizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "num_top": 5, "crop": { "strategy": "single_pass" }, "classifier": { "kind": "color_channels" } }"#,
        )
        .unwrap();

        let config = VisualizerConfig::from_file(&path).unwrap();
        assert_eq!(config.num_top, 5);
        assert_eq!(config.tile_size, 100);
        assert_eq!(config.crop.strategy, MergeStrategy::SinglePass);
        assert_eq!(config.crop.smooth_radius, 10);
        assert_eq!(config.classifier, ClassifierKind::ColorChannels);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = VisualizerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = VisualizerConfig {
            threshold_scale: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
