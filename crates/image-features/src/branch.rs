//! Image feature path: extractor, per-level modulation, optional freezing

use crate::extractor::{ConvPyramid, ImageFeatureExtractor};
use crate::modulation::PyramidModulation;
use crate::projection::ImageContext;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, info};
use voxel_det3d_common::{DetectionError, ImageBranchConfig, ImageMeta, Result, IMAGE_PYRAMID_LEVELS};

/// 2D extractor followed by one modulation block per pyramid level
pub struct ImageBranch {
    extractor: Box<dyn ImageFeatureExtractor>,
    modulation: PyramidModulation,
    frozen: bool,
}

impl std::fmt::Debug for ImageBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBranch")
            .field("channels", &self.extractor.out_channels())
            .field("frozen", &self.frozen)
            .finish_non_exhaustive()
    }
}

impl ImageBranch {
    /// Branch with the built-in convolutional pyramid under `img_backbone`
    /// and modulation blocks under `img_modulation`.
    pub fn new(vb: VarBuilder, config: &ImageBranchConfig, frozen: bool) -> Result<Self> {
        let extractor = ConvPyramid::new(vb.pp("img_backbone"), config.in_channels, config.channels)?;
        Self::with_extractor(vb, Box::new(extractor), config, frozen)
    }

    /// Branch around an external extractor (e.g. an ONNX backbone)
    pub fn with_extractor(
        vb: VarBuilder,
        extractor: Box<dyn ImageFeatureExtractor>,
        config: &ImageBranchConfig,
        frozen: bool,
    ) -> Result<Self> {
        if extractor.out_channels() != config.channels {
            return Err(DetectionError::InvalidConfig(format!(
                "image extractor yields {} channels, configuration expects {}",
                extractor.out_channels(),
                config.channels
            )));
        }
        let modulation = PyramidModulation::new(
            vb.pp("img_modulation"),
            IMAGE_PYRAMID_LEVELS,
            config.channels,
            config.ffn_scale,
            config.sa_levels,
        )?;
        info!(
            "Image branch: {} channels, {} modulation levels{}",
            config.channels,
            IMAGE_PYRAMID_LEVELS,
            if frozen { " (frozen)" } else { "" }
        );
        Ok(Self {
            extractor,
            modulation,
            frozen,
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn channels(&self) -> usize {
        self.extractor.out_channels()
    }

    /// Extract and modulate the pyramid of `images` `(B, C, H, W)`
    pub fn forward(&self, images: &Tensor, metas: &[ImageMeta]) -> Result<ImageContext> {
        let (batch, _, h, w) = images.dims4()?;
        if batch != metas.len() {
            return Err(DetectionError::shape(format!(
                "{batch} images but {} metas",
                metas.len()
            )));
        }
        let pyramid = self.extractor.extract(images)?;
        let pyramid = self.modulation.forward(&pyramid)?;
        debug!(
            "Image pyramid: {:?}",
            pyramid.iter().map(|l| l.dims().to_vec()).collect::<Vec<_>>()
        );
        let context = ImageContext::new(pyramid, metas.to_vec(), [h, w])?;
        Ok(if self.frozen { context.detach() } else { context })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config() -> ImageBranchConfig {
        ImageBranchConfig {
            channels: 8,
            ..ImageBranchConfig::default()
        }
    }

    #[test]
    fn test_forward_builds_context() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let branch = ImageBranch::new(vb, &config(), false).unwrap();
        let images = Tensor::rand(0f32, 1.0, (2, 3, 32, 48), &Device::Cpu).unwrap();
        let meta = ImageMeta::pinhole([32, 48], 20.0, 24.0, 16.0);
        let ctx = branch.forward(&images, &[meta.clone(), meta]).unwrap();
        assert_eq!(ctx.num_levels(), IMAGE_PYRAMID_LEVELS);
        assert_eq!(ctx.input_shape(), [32, 48]);
        assert_eq!(ctx.pyramid()[0].dims(), &[2, 8, 8, 12]);

        let names = varmap.data().lock().unwrap();
        assert!(names.contains_key("img_backbone.stem.weight"));
        assert!(names.contains_key("img_modulation.3.sa.mfr.2.weight"));
    }

    #[test]
    fn test_meta_count_must_match() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let branch = ImageBranch::new(vb, &config(), true).unwrap();
        let images = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let meta = ImageMeta::pinhole([16, 16], 1.0, 0.0, 0.0);
        assert!(branch.forward(&images, &[meta]).is_err());
    }
}
