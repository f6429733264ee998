//! Per-level image feature modulation
//!
//! Each pyramid level is refined independently by a [`ModulationBlock`]:
//!
//! ```text
//! x = x + SA(LN(x))    spatial multi-scale gating
//! x = x + CC(LN(x))    convolutional channel mixing
//! ```
//!
//! `SA` splits the channels into `n_levels` chunks. Chunk `i > 0` is
//! max-pooled to `1/2^i` of the resolution, filtered by a depthwise 3x3
//! convolution and upsampled back (nearest); chunk 0 is filtered at full
//! resolution. The chunks are re-joined, mixed by a 1x1 convolution and the
//! GELU of the result gates the input.

use candle_core::Tensor;
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Init, Module, VarBuilder};
use voxel_det3d_common::{DetectionError, Result};

const LAYER_NORM_EPS: f64 = 1e-6;

/// Layer norm over the channel axis of a `(B, C, H, W)` map
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl ChannelLayerNorm {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            weight: vb
                .get_with_hints(channels, "weight", Init::Const(1.0))?
                .reshape((1, channels, 1, 1))?,
            bias: vb
                .get_with_hints(channels, "bias", Init::Const(0.0))?
                .reshape((1, channels, 1, 1))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let x = centered.broadcast_div(&(var + LAYER_NORM_EPS)?.sqrt()?)?;
        Ok(x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Max pooling to an exact output size; window `i` spans
/// `floor(i·n/out) .. ceil((i+1)·n/out)` along each axis.
pub fn adaptive_max_pool2d(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    fn pool_axis(x: &Tensor, dim: usize, out: usize) -> Result<Tensor> {
        let n = x.dim(dim)?;
        if out == n {
            return Ok(x.clone());
        }
        let cells = (0..out)
            .map(|i| {
                let start = i * n / out;
                let end = ((i + 1) * n).div_ceil(out);
                Ok(x.narrow(dim, start, end - start)?.max_keepdim(dim)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&cells, dim)?)
    }
    let x = pool_axis(x, 2, out_h)?;
    pool_axis(&x, 3, out_w)
}

/// Spatially-adaptive modulation (multi-scale depthwise gating)
#[derive(Debug, Clone)]
pub struct SpatialModulation {
    filters: Vec<Conv2d>,
    aggregate: Conv2d,
    n_levels: usize,
}

impl SpatialModulation {
    pub fn new(vb: VarBuilder, channels: usize, n_levels: usize) -> Result<Self> {
        if n_levels == 0 || channels % n_levels != 0 {
            return Err(DetectionError::InvalidConfig(format!(
                "{channels} channels cannot be split into {n_levels} levels"
            )));
        }
        let chunk = channels / n_levels;
        let depthwise = Conv2dConfig {
            padding: 1,
            groups: chunk,
            ..Default::default()
        };
        let filters = (0..n_levels)
            .map(|i| conv2d(chunk, chunk, 3, depthwise, vb.pp("mfr").pp(i.to_string())))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let aggregate = conv2d(channels, channels, 1, Conv2dConfig::default(), vb.pp("aggr"))?;
        Ok(Self {
            filters,
            aggregate,
            n_levels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let chunks = x.chunk(self.n_levels, 1)?;
        let mut out = Vec::with_capacity(self.n_levels);
        for (i, (chunk, filter)) in chunks.iter().zip(&self.filters).enumerate() {
            let chunk = chunk.contiguous()?;
            let s = if i == 0 {
                filter.forward(&chunk)?
            } else {
                let ph = (h >> i).max(1);
                let pw = (w >> i).max(1);
                let pooled = adaptive_max_pool2d(&chunk, ph, pw)?;
                filter.forward(&pooled)?.upsample_nearest2d(h, w)?
            };
            out.push(s);
        }
        let mixed = self.aggregate.forward(&Tensor::cat(&out, 1)?)?;
        Ok((mixed.gelu_erf()? * x)?)
    }
}

/// Convolutional channel mixer: 3x3 expansion, GELU, 1x1 projection
#[derive(Debug, Clone)]
pub struct ChannelMixer {
    expand: Conv2d,
    project: Conv2d,
}

impl ChannelMixer {
    pub fn new(vb: VarBuilder, channels: usize, growth: f32) -> Result<Self> {
        let hidden = ((channels as f32 * growth) as usize).max(1);
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            expand: conv2d(channels, hidden, 3, padded, vb.pp("0"))?,
            project: conv2d(hidden, channels, 1, Conv2dConfig::default(), vb.pp("2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.project.forward(&self.expand.forward(x)?.gelu_erf()?)?)
    }
}

/// Residual modulation applied to one pyramid level
#[derive(Debug, Clone)]
pub struct ModulationBlock {
    norm1: ChannelLayerNorm,
    norm2: ChannelLayerNorm,
    spatial: SpatialModulation,
    mixer: ChannelMixer,
}

impl ModulationBlock {
    pub fn new(vb: VarBuilder, channels: usize, ffn_scale: f32, n_levels: usize) -> Result<Self> {
        Ok(Self {
            norm1: ChannelLayerNorm::new(vb.pp("norm1"), channels)?,
            norm2: ChannelLayerNorm::new(vb.pp("norm2"), channels)?,
            spatial: SpatialModulation::new(vb.pp("sa"), channels, n_levels)?,
            mixer: ChannelMixer::new(vb.pp("cc"), channels, ffn_scale)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (self.spatial.forward(&self.norm1.forward(x)?)? + x)?;
        let mixed = self.mixer.forward(&self.norm2.forward(&x)?)?;
        Ok((mixed + x)?)
    }
}

/// One modulation block per pyramid level
#[derive(Debug, Clone)]
pub struct PyramidModulation {
    blocks: Vec<ModulationBlock>,
}

impl PyramidModulation {
    pub fn new(
        vb: VarBuilder,
        levels: usize,
        channels: usize,
        ffn_scale: f32,
        n_levels: usize,
    ) -> Result<Self> {
        let blocks = (0..levels)
            .map(|i| ModulationBlock::new(vb.pp(i.to_string()), channels, ffn_scale, n_levels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn forward(&self, pyramid: &[Tensor]) -> Result<Vec<Tensor>> {
        if pyramid.len() != self.blocks.len() {
            return Err(DetectionError::shape(format!(
                "pyramid has {} levels, {} modulation blocks configured",
                pyramid.len(),
                self.blocks.len()
            )));
        }
        pyramid
            .iter()
            .zip(&self.blocks)
            .map(|(level, block)| block.forward(level))
            .collect()
    }
}
