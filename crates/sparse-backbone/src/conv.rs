//! Generalized sparse convolution, pooling and normalization
//!
//! Convolutions follow the kernel-map formulation: for every kernel offset
//! the pairs `(input row, output row)` whose coordinates differ by that
//! offset are gathered, multiplied by the offset's weight matrix and
//! scattered into the output. Only occupied voxels are ever touched.

use crate::tensor::SparseVoxelTensor;
use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use rustc_hash::FxHashMap;
use voxel_det3d_common::{NormKind, Result};

/// Fill value for kernel positions without an input voxel
const POOL_FILL: f64 = -1e30;

/// Kaiming normal, fan-out, ReLU gain
pub(crate) const KAIMING_FAN_OUT: Init = Init::Kaiming {
    dist: candle_nn::init::NormalOrUniform::Normal,
    fan: candle_nn::init::FanInOut::FanOut,
    non_linearity: candle_nn::init::NonLinearity::ReLU,
};

/// Spatial offsets of a cubic kernel in kernel-index order (z fastest)
pub fn kernel_offsets(kernel_size: usize) -> Vec<[i32; 3]> {
    let k = kernel_size as i32;
    let lo = -((k - 1) / 2);
    let mut offsets = Vec::with_capacity(kernel_size.pow(3));
    for x in lo..lo + k {
        for y in lo..lo + k {
            for z in lo..lo + k {
                offsets.push([x, y, z]);
            }
        }
    }
    offsets
}

/// Unique coarse coordinates at `new_stride`, sorted
pub fn downsample_coords(coords: &[[i32; 4]], new_stride: i32) -> Vec<[i32; 4]> {
    let mut out: Vec<[i32; 4]> = coords
        .iter()
        .map(|c| {
            [
                c[0],
                c[1].div_euclid(new_stride) * new_stride,
                c[2].div_euclid(new_stride) * new_stride,
                c[3].div_euclid(new_stride) * new_stride,
            ]
        })
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Row pairs per kernel offset
struct KernelMap {
    out_coords: Vec<[i32; 4]>,
    pairs: Vec<(Vec<u32>, Vec<u32>)>,
}

impl KernelMap {
    fn build(x: &SparseVoxelTensor, kernel_size: usize, stride: usize) -> Self {
        let ts = x.tensor_stride();
        let out_coords = if stride == 1 {
            x.coords().to_vec()
        } else {
            downsample_coords(x.coords(), ts * stride as i32)
        };
        let index: FxHashMap<[i32; 4], u32> = x
            .coords()
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32))
            .collect();

        let pairs = kernel_offsets(kernel_size)
            .into_iter()
            .map(|off| {
                let mut input_rows = Vec::new();
                let mut output_rows = Vec::new();
                for (o, c) in out_coords.iter().enumerate() {
                    let key = [
                        c[0],
                        c[1] + off[0] * ts,
                        c[2] + off[1] * ts,
                        c[3] + off[2] * ts,
                    ];
                    if let Some(&i) = index.get(&key) {
                        input_rows.push(i);
                        output_rows.push(o as u32);
                    }
                }
                (input_rows, output_rows)
            })
            .collect();
        Self { out_coords, pairs }
    }
}

/// Sparse 3D convolution with a `(K, C_in, C_out)` kernel
#[derive(Debug, Clone)]
pub struct SparseConv3d {
    kernel: Tensor,
    kernel_size: usize,
    stride: usize,
}

impl SparseConv3d {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Result<Self> {
        let kernel = vb.get_with_hints(
            (kernel_size.pow(3), in_channels, out_channels),
            "kernel",
            KAIMING_FAN_OUT,
        )?;
        Ok(Self {
            kernel,
            kernel_size,
            stride,
        })
    }

    pub fn forward(&self, x: &SparseVoxelTensor) -> Result<SparseVoxelTensor> {
        let map = KernelMap::build(x, self.kernel_size, self.stride);
        let device = x.device();
        let (_, _, out_channels) = self.kernel.dims3()?;

        let mut contributions = Vec::new();
        let mut targets = Vec::new();
        for (k, (input_rows, output_rows)) in map.pairs.iter().enumerate() {
            if input_rows.is_empty() {
                continue;
            }
            let idx = Tensor::new(input_rows.as_slice(), device)?;
            let gathered = x.features().index_select(&idx, 0)?;
            contributions.push(gathered.matmul(&self.kernel.get(k)?)?);
            targets.extend_from_slice(output_rows);
        }

        let n_out = map.out_coords.len();
        let mut out = Tensor::zeros((n_out, out_channels), x.features().dtype(), device)?;
        if !contributions.is_empty() {
            let source = Tensor::cat(&contributions, 0)?;
            let targets = Tensor::new(targets.as_slice(), device)?;
            out = out.index_add(&targets, &source, 0)?;
        }
        SparseVoxelTensor::new(
            map.out_coords,
            out,
            x.tensor_stride() * self.stride as i32,
            x.batch_size(),
        )
    }
}

/// Sparse max pooling; every output voxel covers at least one input
#[derive(Debug, Clone, Copy)]
pub struct SparseMaxPool {
    kernel_size: usize,
    stride: usize,
}

impl SparseMaxPool {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }

    pub fn forward(&self, x: &SparseVoxelTensor) -> Result<SparseVoxelTensor> {
        let map = KernelMap::build(x, self.kernel_size, self.stride);
        let device = x.device();
        let n_out = map.out_coords.len();
        let shape = (n_out, x.channels());
        let zeros = Tensor::zeros(shape, x.features().dtype(), device)?;
        let fill = Tensor::full(POOL_FILL, shape, device)?.to_dtype(x.features().dtype())?;

        let mut pooled = fill.clone();
        for (input_rows, output_rows) in &map.pairs {
            if input_rows.is_empty() {
                continue;
            }
            let mut present = vec![0u8; n_out];
            for &o in output_rows {
                present[o as usize] = 1;
            }
            let gathered = x
                .features()
                .index_select(&Tensor::new(input_rows.as_slice(), device)?, 0)?;
            let scattered =
                zeros.index_add(&Tensor::new(output_rows.as_slice(), device)?, &gathered, 0)?;
            let mask = Tensor::from_vec(present, (n_out, 1), device)?.broadcast_as(shape)?;
            let candidate = mask.where_cond(&scattered, &fill)?;
            pooled = pooled.maximum(&candidate)?;
        }
        SparseVoxelTensor::new(
            map.out_coords,
            pooled,
            x.tensor_stride() * self.stride as i32,
            x.batch_size(),
        )
    }
}

/// Instance or batch normalization over the feature rows.
///
/// Instance norm uses the statistics of each image separately. Batch norm
/// uses batch statistics while training and the stored running statistics
/// at inference; running statistics are never updated here.
#[derive(Debug, Clone)]
pub struct SparseNorm {
    kind: NormKind,
    weight: Tensor,
    bias: Tensor,
    running_mean: Option<Tensor>,
    running_var: Option<Tensor>,
    eps: f64,
}

impl SparseNorm {
    pub fn new(vb: VarBuilder, kind: NormKind, channels: usize) -> Result<Self> {
        let (vb, running) = match kind {
            NormKind::Instance => (vb, false),
            NormKind::Batch => (vb.pp("bn"), true),
        };
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        let (running_mean, running_var) = if running {
            (
                Some(vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?),
                Some(vb.get_with_hints(channels, "running_var", Init::Const(1.0))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            kind,
            weight,
            bias,
            running_mean,
            running_var,
            eps: 1e-5,
        })
    }

    pub fn batch(vb: VarBuilder, channels: usize) -> Result<Self> {
        Self::new(vb, NormKind::Batch, channels)
    }

    fn normalize(&self, x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
        let x = x
            .broadcast_sub(mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }

    fn batch_statistics(x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = x.mean_keepdim(0)?;
        let var = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim(0)?;
        Ok((mean, var))
    }

    pub fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        let features = match (self.kind, &self.running_mean, &self.running_var) {
            (NormKind::Batch, Some(mean), Some(var)) if !train => {
                self.normalize(x.features(), mean, var)?
            }
            (NormKind::Batch, _, _) => {
                let (mean, var) = Self::batch_statistics(x.features())?;
                self.normalize(x.features(), &mean, &var)?
            }
            (NormKind::Instance, _, _) => {
                let parts = x
                    .decomposed_features()?
                    .iter()
                    .filter(|f| f.dim(0).map_or(false, |n| n > 0))
                    .map(|f| {
                        let (mean, var) = Self::batch_statistics(f)?;
                        self.normalize(f, &mean, &var)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts, 0)?
            }
        };
        x.with_features(features)
    }
}

/// Rectified features, same coordinates
pub fn sparse_relu(x: &SparseVoxelTensor) -> Result<SparseVoxelTensor> {
    x.with_features(x.features().relu()?)
}

/// Elementwise sum of two tensors on identical coordinates
pub fn sparse_add(a: &SparseVoxelTensor, b: &SparseVoxelTensor) -> Result<SparseVoxelTensor> {
    if a.coords() != b.coords() {
        return Err(voxel_det3d_common::DetectionError::shape(
            "residual branches disagree on output coordinates",
        ));
    }
    a.with_features((a.features() + b.features())?)
}
