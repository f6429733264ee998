//! Batched sparse voxel tensor

use candle_core::{Device, Tensor};
use std::ops::Range;
use voxel_det3d_common::{DetectionError, Result};

/// Occupied voxels of a batch with one feature row per voxel.
///
/// Coordinates are `(batch, x, y, z)` in input-voxel units, unique and sorted
/// lexicographically, so every image owns one contiguous block of rows. At
/// tensor stride `s` every spatial coordinate is a multiple of `s`.
#[derive(Debug, Clone)]
pub struct SparseVoxelTensor {
    coords: Vec<[i32; 4]>,
    features: Tensor,
    tensor_stride: i32,
    batch_offsets: Vec<usize>,
}

impl SparseVoxelTensor {
    /// Build from sorted unique coordinates and a `(N, C)` feature matrix
    pub fn new(
        coords: Vec<[i32; 4]>,
        features: Tensor,
        tensor_stride: i32,
        batch_size: usize,
    ) -> Result<Self> {
        let (rows, _) = features.dims2()?;
        if rows != coords.len() {
            return Err(DetectionError::shape(format!(
                "{} coordinates but {} feature rows",
                coords.len(),
                rows
            )));
        }
        if coords.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DetectionError::shape(
                "sparse coordinates must be sorted and unique",
            ));
        }
        let mut batch_offsets = vec![0usize; batch_size + 1];
        for c in &coords {
            let b = usize::try_from(c[0]).ok().filter(|&b| b < batch_size).ok_or_else(|| {
                DetectionError::shape(format!(
                    "batch index {} outside batch of {batch_size}",
                    c[0]
                ))
            })?;
            batch_offsets[b + 1] += 1;
        }
        for b in 0..batch_size {
            batch_offsets[b + 1] += batch_offsets[b];
        }
        Ok(Self {
            coords,
            features,
            tensor_stride,
            batch_offsets,
        })
    }

    /// Same coordinates with new features
    pub fn with_features(&self, features: Tensor) -> Result<Self> {
        let (rows, _) = features.dims2()?;
        if rows != self.coords.len() {
            return Err(DetectionError::shape(format!(
                "replacement features have {rows} rows, expected {}",
                self.coords.len()
            )));
        }
        Ok(Self {
            coords: self.coords.clone(),
            features,
            tensor_stride: self.tensor_stride,
            batch_offsets: self.batch_offsets.clone(),
        })
    }

    pub fn coords(&self) -> &[[i32; 4]] {
        &self.coords
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn tensor_stride(&self) -> i32 {
        self.tensor_stride
    }

    pub fn device(&self) -> &Device {
        self.features.device()
    }

    pub fn num_points(&self) -> usize {
        self.coords.len()
    }

    pub fn channels(&self) -> usize {
        self.features.dims().get(1).copied().unwrap_or(0)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_offsets.len() - 1
    }

    pub fn batch_offsets(&self) -> &[usize] {
        &self.batch_offsets
    }

    /// Rows owned by image `b`
    pub fn batch_rows(&self, b: usize) -> Range<usize> {
        self.batch_offsets[b]..self.batch_offsets[b + 1]
    }

    /// Feature rows of every image
    pub fn decomposed_features(&self) -> Result<Vec<Tensor>> {
        (0..self.batch_size())
            .map(|b| -> Result<Tensor> {
                let rows = self.batch_rows(b);
                Ok(self.features.narrow(0, rows.start, rows.len())?)
            })
            .collect()
    }

    /// Continuous voxel positions `coords * voxel_size` of every image
    pub fn decomposed_points(&self, voxel_size: f32) -> Vec<Vec<[f32; 3]>> {
        (0..self.batch_size())
            .map(|b| {
                self.coords[self.batch_rows(b)]
                    .iter()
                    .map(|c| {
                        [
                            c[1] as f32 * voxel_size,
                            c[2] as f32 * voxel_size,
                            c[3] as f32 * voxel_size,
                        ]
                    })
                    .collect()
            })
            .collect()
    }
}
