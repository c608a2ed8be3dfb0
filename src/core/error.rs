//! Error types shared by the scanner, montage builder and tight-crop engine.
//!
//! Every error is terminal for the current run. These are offline batch jobs,
//! so nothing is retried or skipped.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An image in the dataset could not be opened or decoded.
    #[error("failed to load image {path:?}: {source}")]
    ImageLoadFailure {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The image list resolved to zero images.
    #[error("dataset is empty")]
    EmptyDataset,

    /// A file the run depends on (image list, category labels) is missing,
    /// or the classifier lacks a capability the requested mode needs.
    #[error("missing resource: {path:?}")]
    MissingResource { path: PathBuf },

    /// The classifier did not return the requested layer.
    #[error("classifier produced no activations for layer `{0}`")]
    MissingLayer(String),

    #[error("invalid shape: expected {expected}, got {got}")]
    InvalidShape { expected: String, got: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
