//! Point cloud to sparse voxel collation

use crate::tensor::SparseVoxelTensor;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use tracing::debug;
use voxel_det3d_common::{DetectionError, Result};

/// Maximum raw colour/intensity value
const FEATURE_SCALE: f32 = 255.0;

/// Quantizes a batch of point clouds into one sparse voxel tensor.
///
/// Each input is an `(N_i, 3 + C)` matrix of `x y z` followed by raw
/// features in `[0, 255]`. Coordinates become `floor(xyz / voxel_size)`,
/// features are scaled to `[0, 1]`, and points falling into the same voxel
/// of one image are merged by averaging their features.
#[derive(Debug, Clone)]
pub struct VoxelCollator {
    voxel_size: f32,
    device: Device,
}

impl VoxelCollator {
    pub fn new(voxel_size: f32, device: Device) -> Self {
        Self { voxel_size, device }
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn collate(&self, points: &[Tensor]) -> Result<SparseVoxelTensor> {
        let mut width = None;
        let mut voxels: BTreeMap<[i32; 4], (Vec<f32>, u32)> = BTreeMap::new();

        for (index, cloud) in points.iter().enumerate() {
            let (rows, cols) = cloud.dims2().map_err(|_| {
                DetectionError::shape(format!(
                    "point cloud {index} must be a (N, 3 + C) matrix, got {:?}",
                    cloud.dims()
                ))
            })?;
            if rows == 0 {
                return Err(DetectionError::EmptyPointCloud { index });
            }
            if cols < 3 {
                return Err(DetectionError::shape(format!(
                    "point cloud {index} has {cols} columns, at least 3 required"
                )));
            }
            match width {
                None => width = Some(cols - 3),
                Some(w) if w != cols - 3 => {
                    return Err(DetectionError::shape(format!(
                        "point cloud {index} has {} feature channels, expected {w}",
                        cols - 3
                    )));
                }
                Some(_) => {}
            }

            let batch = i32::try_from(index)
                .map_err(|_| DetectionError::shape("batch too large for voxel coordinates"))?;
            for row in cloud.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()? {
                let key = [
                    batch,
                    (row[0] / self.voxel_size).floor() as i32,
                    (row[1] / self.voxel_size).floor() as i32,
                    (row[2] / self.voxel_size).floor() as i32,
                ];
                let entry = voxels
                    .entry(key)
                    .or_insert_with(|| (vec![0.0; cols - 3], 0));
                for (acc, value) in entry.0.iter_mut().zip(&row[3..]) {
                    *acc += value / FEATURE_SCALE;
                }
                entry.1 += 1;
            }
        }

        let channels = width.unwrap_or(0);
        let n = voxels.len();
        let mut coords = Vec::with_capacity(n);
        let mut features = Vec::with_capacity(n * channels);
        for (key, (sum, count)) in voxels {
            coords.push(key);
            features.extend(sum.into_iter().map(|v| v / count as f32));
        }
        debug!(
            "Collated {} point clouds into {} voxels ({} channels)",
            points.len(),
            n,
            channels
        );

        let features = Tensor::from_vec(features, (n, channels), &self.device)?;
        SparseVoxelTensor::new(coords, features, 1, points.len())
    }
}
