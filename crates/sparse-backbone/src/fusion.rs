//! Injection point between the backbone stem and its residual stages

use crate::tensor::SparseVoxelTensor;
use voxel_det3d_common::Result;

/// Transforms stem features before the residual stages see them.
///
/// Implementations must keep the coordinates and channel width of the
/// input; only feature values may change.
pub trait FeatureFusion {
    fn fuse(&self, x: SparseVoxelTensor) -> Result<SparseVoxelTensor>;
}

/// Passes stem features through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFusion;

impl FeatureFusion for IdentityFusion {
    fn fuse(&self, x: SparseVoxelTensor) -> Result<SparseVoxelTensor> {
        Ok(x)
    }
}
