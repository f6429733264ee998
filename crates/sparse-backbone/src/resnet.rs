//! Minkowski ResNet on sparse voxels
//!
//! A stride-2 stem (conv, norm, ReLU, optional max-pool) followed by up to
//! four residual stages, each halving the resolution. Stage widths double
//! from 64 and may be capped by `max_channels`; outputs are returned finest
//! to coarsest.

use crate::conv::{sparse_add, sparse_relu, SparseConv3d, SparseMaxPool, SparseNorm};
use crate::fusion::{FeatureFusion, IdentityFusion};
use crate::tensor::SparseVoxelTensor;
use candle_nn::VarBuilder;
use tracing::{debug, info};
use voxel_det3d_common::{
    resnet_arch, BackboneConfig, BlockKind, DetectionError, NormKind, Result,
};

const STEM_CHANNELS: usize = 64;

/// 1x1 strided projection on the residual path
#[derive(Debug, Clone)]
struct Downsample {
    conv: SparseConv3d,
    norm: SparseNorm,
}

impl Downsample {
    fn new(vb: VarBuilder, in_channels: usize, out_channels: usize, stride: usize) -> Result<Self> {
        Ok(Self {
            conv: SparseConv3d::new(vb.pp("0"), in_channels, out_channels, 1, stride)?,
            norm: SparseNorm::batch(vb.pp("1"), out_channels)?,
        })
    }

    fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        self.norm.forward_t(&self.conv.forward(x)?, train)
    }
}

#[derive(Debug, Clone)]
struct BasicBlock {
    conv1: SparseConv3d,
    norm1: SparseNorm,
    conv2: SparseConv3d,
    norm2: SparseNorm,
    downsample: Option<Downsample>,
}

impl BasicBlock {
    fn new(
        vb: VarBuilder,
        inplanes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample>,
    ) -> Result<Self> {
        Ok(Self {
            conv1: SparseConv3d::new(vb.pp("conv1"), inplanes, planes, 3, stride)?,
            norm1: SparseNorm::batch(vb.pp("norm1"), planes)?,
            conv2: SparseConv3d::new(vb.pp("conv2"), planes, planes, 3, 1)?,
            norm2: SparseNorm::batch(vb.pp("norm2"), planes)?,
            downsample,
        })
    }

    fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        let out = sparse_relu(&self.norm1.forward_t(&self.conv1.forward(x)?, train)?)?;
        let out = self.norm2.forward_t(&self.conv2.forward(&out)?, train)?;
        let residual = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };
        sparse_relu(&sparse_add(&out, &residual)?)
    }
}

#[derive(Debug, Clone)]
struct Bottleneck {
    conv1: SparseConv3d,
    norm1: SparseNorm,
    conv2: SparseConv3d,
    norm2: SparseNorm,
    conv3: SparseConv3d,
    norm3: SparseNorm,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    fn new(
        vb: VarBuilder,
        inplanes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample>,
    ) -> Result<Self> {
        let out = planes * BlockKind::Bottleneck.expansion();
        Ok(Self {
            conv1: SparseConv3d::new(vb.pp("conv1"), inplanes, planes, 1, 1)?,
            norm1: SparseNorm::batch(vb.pp("norm1"), planes)?,
            conv2: SparseConv3d::new(vb.pp("conv2"), planes, planes, 3, stride)?,
            norm2: SparseNorm::batch(vb.pp("norm2"), planes)?,
            conv3: SparseConv3d::new(vb.pp("conv3"), planes, out, 1, 1)?,
            norm3: SparseNorm::batch(vb.pp("norm3"), out)?,
            downsample,
        })
    }

    fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        let out = sparse_relu(&self.norm1.forward_t(&self.conv1.forward(x)?, train)?)?;
        let out = sparse_relu(&self.norm2.forward_t(&self.conv2.forward(&out)?, train)?)?;
        let out = self.norm3.forward_t(&self.conv3.forward(&out)?, train)?;
        let residual = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };
        sparse_relu(&sparse_add(&out, &residual)?)
    }
}

#[derive(Debug, Clone)]
enum ResidualBlock {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl ResidualBlock {
    fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        match self {
            ResidualBlock::Basic(b) => b.forward_t(x, train),
            ResidualBlock::Bottleneck(b) => b.forward_t(x, train),
        }
    }
}

/// Sparse ResNet backbone
#[derive(Debug, Clone)]
pub struct MinkResNet {
    conv1: SparseConv3d,
    norm1: SparseNorm,
    maxpool: Option<SparseMaxPool>,
    layers: Vec<Vec<ResidualBlock>>,
    in_channels: usize,
    out_channels: Vec<usize>,
}

impl MinkResNet {
    /// Build the backbone; parameters are created (Kaiming fan-out kernels,
    /// unit/zero norms) under `vb` when absent.
    pub fn new(vb: VarBuilder, config: &BackboneConfig) -> Result<Self> {
        config.validate()?;
        let (block, stage_blocks) = resnet_arch(config.depth).ok_or_else(|| {
            DetectionError::InvalidConfig(format!("invalid depth {} for resnet", config.depth))
        })?;
        let norm_kind = NormKind::parse(&config.norm)?;

        let conv1 = SparseConv3d::new(vb.pp("conv1"), config.in_channels, STEM_CHANNELS, 3, 2)?;
        let norm1 = SparseNorm::new(vb.pp("norm1"), norm_kind, STEM_CHANNELS)?;
        let maxpool = config.pool.then(|| SparseMaxPool::new(2, 2));

        let expansion = block.expansion();
        let mut inplanes = STEM_CHANNELS;
        let mut layers = Vec::with_capacity(config.num_stages);
        let mut out_channels = Vec::with_capacity(config.num_stages);
        for (i, &n_blocks) in stage_blocks.iter().take(config.num_stages).enumerate() {
            let planes = config
                .max_channels
                .map_or(STEM_CHANNELS << i, |cap| (STEM_CHANNELS << i).min(cap));
            let stage_vb = vb.pp("layers").pp(i.to_string());
            let mut blocks = Vec::with_capacity(n_blocks);
            for j in 0..n_blocks {
                let block_vb = stage_vb.pp(j.to_string());
                // Every stage starts with a stride-2 block and a projected shortcut
                let (stride, downsample) = if j == 0 {
                    let ds = Downsample::new(block_vb.pp("downsample"), inplanes, planes * expansion, 2)?;
                    (2, Some(ds))
                } else {
                    (1, None)
                };
                blocks.push(match block {
                    BlockKind::Basic => ResidualBlock::Basic(BasicBlock::new(
                        block_vb, inplanes, planes, stride, downsample,
                    )?),
                    BlockKind::Bottleneck => ResidualBlock::Bottleneck(Bottleneck::new(
                        block_vb, inplanes, planes, stride, downsample,
                    )?),
                });
                inplanes = planes * expansion;
            }
            layers.push(blocks);
            out_channels.push(inplanes);
        }

        info!(
            "MinkResNet-{} with {} stages, channels {:?}",
            config.depth, config.num_stages, out_channels
        );
        Ok(Self {
            conv1,
            norm1,
            maxpool,
            layers,
            in_channels: config.in_channels,
            out_channels,
        })
    }

    /// Channels of each output level
    pub fn out_channels(&self) -> &[usize] {
        &self.out_channels
    }

    pub fn num_stages(&self) -> usize {
        self.layers.len()
    }

    /// Channels after the stem, seen by a [`FeatureFusion`]
    pub fn stem_channels(&self) -> usize {
        STEM_CHANNELS
    }

    fn stem(&self, x: &SparseVoxelTensor, train: bool) -> Result<SparseVoxelTensor> {
        if x.channels() != self.in_channels {
            return Err(DetectionError::shape(format!(
                "backbone expects {} input channels, got {}",
                self.in_channels,
                x.channels()
            )));
        }
        let x = sparse_relu(&self.norm1.forward_t(&self.conv1.forward(x)?, train)?)?;
        match &self.maxpool {
            Some(pool) => pool.forward(&x),
            None => Ok(x),
        }
    }

    pub fn forward_t(&self, x: &SparseVoxelTensor, train: bool) -> Result<Vec<SparseVoxelTensor>> {
        self.forward_with_fusion(x, &IdentityFusion, train)
    }

    /// Forward pass with `fusion` applied once between the stem and the stages
    pub fn forward_with_fusion(
        &self,
        x: &SparseVoxelTensor,
        fusion: &dyn FeatureFusion,
        train: bool,
    ) -> Result<Vec<SparseVoxelTensor>> {
        let stem = self.stem(x, train)?;
        let (coords, channels) = (stem.num_points(), stem.channels());
        let mut x = fusion.fuse(stem)?;
        if x.num_points() != coords || x.channels() != channels {
            return Err(DetectionError::shape(
                "feature fusion changed the stem layout",
            ));
        }

        let mut outs = Vec::with_capacity(self.layers.len());
        for (i, stage) in self.layers.iter().enumerate() {
            for block in stage {
                x = block.forward_t(&x, train)?;
            }
            debug!("Backbone stage {}: {} voxels, stride {}", i, x.num_points(), x.tensor_stride());
            outs.push(x.clone());
        }
        Ok(outs)
    }
}
