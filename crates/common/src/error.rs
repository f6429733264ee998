//! Error types shared by every stage of the detector

use thiserror::Error;

/// Errors raised while building or running the detector.
///
/// Configuration problems surface at construction time. Shape and alignment
/// problems surface from the forward pass and are never recovered.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Point cloud {index} is empty")]
    EmptyPointCloud { index: usize },

    #[error("Image {image} has {available} candidate points, {requested} requested for stage 2")]
    InsufficientPoints {
        image: usize,
        available: usize,
        requested: usize,
    },

    #[error("Image backbone error: {0}")]
    ImageBackbone(String),

    #[error("Weight import failed: {0}")]
    WeightImport(String),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DetectionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DetectionError::InvalidConfig(msg.into())
    }

    /// Convenience constructor for shape/alignment failures
    pub fn shape(msg: impl Into<String>) -> Self {
        DetectionError::Shape(msg.into())
    }
}

/// Result type used across the workspace
pub type Result<T> = std::result::Result<T, DetectionError>;
