//! Pretrained 2D backbone + neck exported to ONNX
//!
//! The model takes a `(B, C, H, W)` float image batch and returns the four
//! pyramid levels as its first four outputs.

use crate::extractor::ImageFeatureExtractor;
use candle_core::{Device, Tensor};
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use voxel_det3d_common::{DetectionError, Result, IMAGE_PYRAMID_LEVELS};

/// ONNX Runtime image feature extractor
pub struct OnnxImageBackbone {
    session: Mutex<Session>,
    channels: usize,
    device: Device,
}

impl OnnxImageBackbone {
    pub fn new<P: AsRef<Path>>(model_path: P, channels: usize, device: Device) -> Result<Self> {
        info!("Loading image backbone from {:?}", model_path.as_ref());
        let session = Session::builder()
            .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?;
        Ok(Self {
            session: Mutex::new(session),
            channels,
            device,
        })
    }
}

impl ImageFeatureExtractor for OnnxImageBackbone {
    fn extract(&self, images: &Tensor) -> Result<Vec<Tensor>> {
        let (b, c, h, w) = images.dims4()?;
        let data = images
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let input = Array4::from_shape_vec((b, c, h, w), data)
            .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?;
        let input = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectionError::ImageBackbone("session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?;
        if outputs.len() < IMAGE_PYRAMID_LEVELS {
            return Err(DetectionError::ImageBackbone(format!(
                "model returned {} outputs, {} pyramid levels required",
                outputs.len(),
                IMAGE_PYRAMID_LEVELS
            )));
        }

        (0..IMAGE_PYRAMID_LEVELS)
            .map(|i| {
                let (shape, data) = outputs[i]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectionError::ImageBackbone(e.to_string()))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                debug!("ONNX pyramid level {}: {:?}", i, dims);
                if dims.len() != 4 || dims[1] != self.channels {
                    return Err(DetectionError::ImageBackbone(format!(
                        "level {i} has shape {dims:?}, expected (B, {}, H, W)",
                        self.channels
                    )));
                }
                Ok(Tensor::from_slice(data, dims.as_slice(), &self.device)?)
            })
            .collect()
    }

    fn out_channels(&self) -> usize {
        self.channels
    }
}
