//! Image branch of the voxel detector
//!
//! A 2D [`ImageFeatureExtractor`] produces a four-level pyramid, each level
//! is refined by its own [`modulation::ModulationBlock`], and the result is
//! wrapped in an [`ImageContext`] that projects 3D points into the images.
//! [`ImageFusionGate`] uses that context to inject image features into the
//! sparse backbone between its stem and residual stages.

pub mod branch;
pub mod extractor;
pub mod gate;
pub mod modulation;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod projection;

pub use branch::ImageBranch;
pub use extractor::{ConvPyramid, ImageFeatureExtractor};
pub use gate::{BoundFusionGate, ImageFusionGate};
pub use modulation::{adaptive_max_pool2d, ModulationBlock, PyramidModulation};
#[cfg(feature = "onnx")]
pub use onnx::OnnxImageBackbone;
pub use projection::{sample_feature_map, visible_points, ImageContext};
