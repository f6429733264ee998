//! Image-to-voxel fusion gate

use crate::projection::ImageContext;
use candle_core::Tensor;
use candle_nn::{linear, linear_no_bias, ops, Linear, Module, VarBuilder};
use tracing::debug;
use voxel_det3d_common::{DetectionError, Result};
use voxel_det3d_sparse::{FeatureFusion, SparseVoxelTensor};

/// Learned gate adding projected image features to stem voxel features:
/// `x + sigmoid(gate([x, img])) * proj(img)`.
///
/// `proj` has no bias, so voxels that project outside the image are left
/// unchanged.
#[derive(Debug, Clone)]
pub struct ImageFusionGate {
    proj: Linear,
    gate: Linear,
    image_level: usize,
    voxel_channels: usize,
}

impl ImageFusionGate {
    pub fn new(
        vb: VarBuilder,
        voxel_channels: usize,
        image_channels: usize,
        image_level: usize,
    ) -> Result<Self> {
        Ok(Self {
            proj: linear_no_bias(image_channels, voxel_channels, vb.pp("proj"))?,
            gate: linear(voxel_channels + image_channels, voxel_channels, vb.pp("gate"))?,
            image_level,
            voxel_channels,
        })
    }

    /// Pair the gate with the image features of the current batch
    pub fn bind<'a>(&'a self, context: &'a ImageContext, voxel_size: f32) -> BoundFusionGate<'a> {
        BoundFusionGate {
            gate: self,
            context,
            voxel_size,
        }
    }
}

/// [`ImageFusionGate`] bound to one batch of image features
#[derive(Debug, Clone, Copy)]
pub struct BoundFusionGate<'a> {
    gate: &'a ImageFusionGate,
    context: &'a ImageContext,
    voxel_size: f32,
}

impl FeatureFusion for BoundFusionGate<'_> {
    fn fuse(&self, x: SparseVoxelTensor) -> Result<SparseVoxelTensor> {
        if x.channels() != self.gate.voxel_channels {
            return Err(DetectionError::shape(format!(
                "fusion gate expects {} voxel channels, got {}",
                self.gate.voxel_channels,
                x.channels()
            )));
        }
        if x.batch_size() != self.context.batch_size() {
            return Err(DetectionError::shape(format!(
                "{} point clouds but {} images",
                x.batch_size(),
                self.context.batch_size()
            )));
        }

        let per_image = x
            .decomposed_points(self.voxel_size)
            .iter()
            .enumerate()
            .map(|(b, points)| self.context.sample(self.gate.image_level, b, points))
            .collect::<Result<Vec<_>>>()?;
        let image = Tensor::cat(&per_image, 0)?;

        let joint = Tensor::cat(&[x.features(), &image], 1)?;
        let weight = ops::sigmoid(&self.gate.gate.forward(&joint)?)?;
        let injected = (weight * self.gate.proj.forward(&image)?)?;
        debug!("Fusion gate injected image features into {} voxels", x.num_points());
        x.with_features((x.features() + injected)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use voxel_det3d_common::ImageMeta;

    fn voxels() -> SparseVoxelTensor {
        let coords = vec![[0, 1, 1, 10], [0, 100, 1, 10], [1, 2, 2, 10]];
        let features = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        SparseVoxelTensor::new(coords, features, 2, 2).unwrap()
    }

    fn context() -> ImageContext {
        let level = Tensor::ones((2, 6, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let meta = ImageMeta::pinhole([16, 16], 10.0, 0.0, 0.0);
        ImageContext::new(vec![level], vec![meta.clone(), meta], [16, 16]).unwrap()
    }

    #[test]
    fn test_out_of_view_voxels_unchanged() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gate = ImageFusionGate::new(vb, 4, 6, 0).unwrap();
        let ctx = context();
        let fused = gate.bind(&ctx, 0.1).fuse(voxels()).unwrap();

        assert_eq!(fused.coords(), voxels().coords());
        let rows = fused.features().to_vec2::<f32>().unwrap();
        // voxel 1 projects to u = 100, outside the 16-pixel image
        assert_eq!(rows[1], vec![1.0; 4]);
        assert_ne!(rows[0], vec![1.0; 4]);
    }

    #[test]
    fn test_batch_mismatch_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gate = ImageFusionGate::new(vb, 4, 6, 0).unwrap();
        let level = Tensor::ones((1, 6, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let ctx = ImageContext::new(
            vec![level],
            vec![ImageMeta::pinhole([16, 16], 10.0, 0.0, 0.0)],
            [16, 16],
        )
        .unwrap();
        let err = gate.bind(&ctx, 0.1).fuse(voxels()).unwrap_err();
        assert!(matches!(err, DetectionError::Shape(_)));
    }
}
