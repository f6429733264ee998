//! 2D feature pyramid extraction

use candle_core::Tensor;
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};
use voxel_det3d_common::{DetectionError, Result, IMAGE_PYRAMID_LEVELS};

/// Produces a dense feature pyramid from a batch of images.
///
/// `images` is `(B, C_in, H, W)`; the result holds
/// [`IMAGE_PYRAMID_LEVELS`] maps `(B, C, H_l, W_l)` of decreasing resolution.
pub trait ImageFeatureExtractor {
    fn extract(&self, images: &Tensor) -> Result<Vec<Tensor>>;

    /// Channels of every pyramid level
    fn out_channels(&self) -> usize;
}

/// Stack of stride-2 convolutions; levels at strides 4, 8, 16, 32
#[derive(Debug, Clone)]
pub struct ConvPyramid {
    stem: Conv2d,
    levels: Vec<Conv2d>,
    channels: usize,
}

impl ConvPyramid {
    pub fn new(vb: VarBuilder, in_channels: usize, channels: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let stem = conv2d(in_channels, channels, 3, cfg, vb.pp("stem"))?;
        let levels = (0..IMAGE_PYRAMID_LEVELS)
            .map(|i| conv2d(channels, channels, 3, cfg, vb.pp("levels").pp(i.to_string())))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            stem,
            levels,
            channels,
        })
    }
}

impl ImageFeatureExtractor for ConvPyramid {
    fn extract(&self, images: &Tensor) -> Result<Vec<Tensor>> {
        if images.rank() != 4 {
            return Err(DetectionError::shape(format!(
                "images must be (B, C, H, W), got {:?}",
                images.dims()
            )));
        }
        let mut x = self.stem.forward(images)?.relu()?;
        let mut pyramid = Vec::with_capacity(self.levels.len());
        for conv in &self.levels {
            x = conv.forward(&x)?.relu()?;
            pyramid.push(x.clone());
        }
        Ok(pyramid)
    }

    fn out_channels(&self) -> usize {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_pyramid_levels_halve_resolution() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pyramid = ConvPyramid::new(vb, 3, 8).unwrap();
        let images = Tensor::zeros((2, 3, 64, 96), DType::F32, &Device::Cpu).unwrap();
        let levels = pyramid.extract(&images).unwrap();
        assert_eq!(levels.len(), IMAGE_PYRAMID_LEVELS);
        let shapes: Vec<_> = levels.iter().map(|l| l.dims().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 8, 16, 24],
                vec![2, 8, 8, 12],
                vec![2, 8, 4, 6],
                vec![2, 8, 2, 3],
            ]
        );
    }

    #[test]
    fn test_rank_checked() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pyramid = ConvPyramid::new(vb, 3, 8).unwrap();
        let images = Tensor::zeros((3, 64, 96), DType::F32, &Device::Cpu).unwrap();
        assert!(pyramid.extract(&images).is_err());
    }
}
