//! Sparse voxel backbone
//!
//! Point clouds are quantized by [`VoxelCollator`] into a batched
//! [`SparseVoxelTensor`], then [`MinkResNet`] turns it into a pyramid of
//! sparse feature maps. A [`FeatureFusion`] implementation may rewrite the
//! stem features before the residual stages run.

pub mod collate;
pub mod conv;
pub mod fusion;
pub mod resnet;
pub mod tensor;

pub use collate::VoxelCollator;
pub use conv::{SparseConv3d, SparseMaxPool, SparseNorm};
pub use fusion::{FeatureFusion, IdentityFusion};
pub use resnet::MinkResNet;
pub use tensor::SparseVoxelTensor;
