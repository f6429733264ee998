//! Shared types for the voxel 3D detector
//!
//! This crate holds everything the other detector crates agree on:
//! - `DetectorConfig` and its sections, loaded from YAML and validated eagerly
//! - `DetectionError`, the error taxonomy of every forward pass
//! - `Box3D` with face distances, centerness and rotated BEV `IoU`
//! - `BBoxResult`, the per-image inference output
//! - `ImageMeta`, the camera projection used by the image branch

pub mod boxes;
pub mod config;
pub mod error;
pub mod meta;

pub use boxes::{centerness, min_distance, BBoxResult, Box3D};
pub use config::{
    resnet_arch, AssignerConfig, BackboneConfig, BlockKind, DetectorConfig, FusionGateConfig,
    HeadConfig, ImageBranchConfig, LossConfig, NormKind, Stage2Config, TestConfig,
    IMAGE_PYRAMID_LEVELS,
};
pub use error::{DetectionError, Result};
pub use meta::ImageMeta;

/// Label of points not assigned to any ground-truth box
pub const BACKGROUND_LABEL: i64 = -1;
