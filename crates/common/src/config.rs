//! Detector configuration
//!
//! Every struct deserializes from YAML with per-field defaults, so a config
//! file only needs to name the options it changes:
//!
//! ```
//! use voxel_det3d_common::DetectorConfig;
//!
//! let config = DetectorConfig::from_yaml_str(
//!     "voxel_size: 0.02\ntest:\n  score_thr: 0.05\n  ensemble_stages: [0, 1]\n",
//! )
//! .unwrap();
//! assert_eq!(config.voxel_size, 0.02);
//! assert_eq!(config.test.nms_pre, 1000);
//! ```

use crate::error::{DetectionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of levels in an image feature pyramid
pub const IMAGE_PYRAMID_LEVELS: usize = 4;

/// Residual block flavour of a `MinkResNet` depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    /// Output channel multiplier of the block
    #[must_use]
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

/// Block kind and per-stage block counts for a supported depth
#[must_use]
pub fn resnet_arch(depth: usize) -> Option<(BlockKind, [usize; 4])> {
    match depth {
        18 => Some((BlockKind::Basic, [2, 2, 2, 2])),
        34 => Some((BlockKind::Basic, [3, 4, 6, 3])),
        50 => Some((BlockKind::Bottleneck, [3, 4, 6, 3])),
        101 => Some((BlockKind::Bottleneck, [3, 4, 23, 3])),
        152 => Some((BlockKind::Bottleneck, [3, 8, 36, 3])),
        _ => None,
    }
}

/// Normalization used by the backbone stem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Instance,
    Batch,
}

impl NormKind {
    /// Parse a normalization mode name
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "instance" => Ok(NormKind::Instance),
            "batch" => Ok(NormKind::Batch),
            other => Err(DetectionError::config(format!(
                "unknown normalization mode '{other}' (expected 'instance' or 'batch')"
            ))),
        }
    }
}

/// Sparse ResNet backbone options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// ResNet depth, one of 18, 34, 50, 101, 152
    pub depth: usize,
    /// Feature channels per input voxel (3 for RGB)
    pub in_channels: usize,
    /// Number of residual stages (1-4)
    pub num_stages: usize,
    /// Upper bound on stage width
    pub max_channels: Option<usize>,
    /// Max-pool after the stem convolution
    pub pool: bool,
    /// Stem normalization: "instance" or "batch"
    pub norm: String,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            depth: 34,
            in_channels: 3,
            num_stages: 4,
            max_channels: None,
            pool: true,
            norm: "instance".to_string(),
        }
    }
}

impl BackboneConfig {
    /// Output channels of each stage, finest to coarsest
    pub fn stage_channels(&self) -> Result<Vec<usize>> {
        let (block, _) = resnet_arch(self.depth).ok_or_else(|| {
            DetectionError::config(format!("invalid depth {} for resnet", self.depth))
        })?;
        Ok((0..self.num_stages)
            .map(|i| {
                let planes = 64usize << i;
                let planes = self.max_channels.map_or(planes, |cap| planes.min(cap));
                planes * block.expansion()
            })
            .collect())
    }

    pub fn validate(&self) -> Result<()> {
        if resnet_arch(self.depth).is_none() {
            return Err(DetectionError::config(format!(
                "invalid depth {} for resnet",
                self.depth
            )));
        }
        if !(1..=4).contains(&self.num_stages) {
            return Err(DetectionError::config(format!(
                "num_stages must be within 1..=4, got {}",
                self.num_stages
            )));
        }
        if self.in_channels == 0 {
            return Err(DetectionError::config("backbone in_channels must be positive"));
        }
        if self.max_channels == Some(0) {
            return Err(DetectionError::config("max_channels must be positive"));
        }
        NormKind::parse(&self.norm)?;
        Ok(())
    }
}

/// Top-k / limit target assignment options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignerConfig {
    /// Maximum points one box claims on a single level
    pub limit: usize,
    /// Maximum points one box claims across all levels
    pub topk: usize,
    /// Number of pyramid levels the assigner expects
    pub n_scales: usize,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            limit: 27,
            topk: 18,
            n_scales: 4,
        }
    }
}

/// Loss hyper-parameters shared by both stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub focal_gamma: f32,
    pub focal_alpha: f32,
    pub cls_weight: f32,
    pub centerness_weight: f32,
    pub bbox_weight: f32,
    /// Weight of the smooth-L1 term on the rotation channels
    pub angle_weight: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            focal_gamma: 2.0,
            focal_alpha: 0.25,
            cls_weight: 1.0,
            centerness_weight: 1.0,
            bbox_weight: 1.0,
            angle_weight: 1.0,
        }
    }
}

/// Stage-1 neck + head options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Backbone channels per level
    pub in_channels: Vec<usize>,
    /// Neck output width shared by all levels
    pub out_channels: usize,
    pub n_classes: usize,
    /// Regression outputs: 6 (axis aligned) or 8 (with rotation)
    pub n_reg_outs: usize,
    /// Points promoted to stage 2 per image
    pub n_select: usize,
    pub assigner: AssignerConfig,
    pub loss: LossConfig,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            in_channels: vec![64, 128, 256, 512],
            out_channels: 128,
            n_classes: 10,
            n_reg_outs: 8,
            n_select: 256,
            assigner: AssignerConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

/// Second-stage refinement head options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage2Config {
    pub hidden_channels: usize,
    /// Refinement passes; each pass yields one hypothesis set
    pub n_passes: usize,
    /// Sample image features at the projected points
    pub use_image: bool,
}

impl Default for Stage2Config {
    fn default() -> Self {
        Self {
            hidden_channels: 128,
            n_passes: 1,
            use_image: false,
        }
    }
}

/// Image branch options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageBranchConfig {
    /// Input image channels
    pub in_channels: usize,
    /// Channels of every pyramid level
    pub channels: usize,
    /// Hidden expansion of the channel mixer
    pub ffn_scale: f32,
    /// Spatial scales inside the modulation gate
    pub sa_levels: usize,
}

impl Default for ImageBranchConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            channels: 256,
            ffn_scale: 2.0,
            sa_levels: 4,
        }
    }
}

/// Cross-modal fusion between the backbone stem and the residual stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionGateConfig {
    /// Pyramid level sampled by the gate
    pub image_level: usize,
}

impl Default for FusionGateConfig {
    fn default() -> Self {
        Self { image_level: 0 }
    }
}

/// Inference options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Candidates kept per level before NMS
    pub nms_pre: usize,
    pub iou_thr: f32,
    pub score_thr: f32,
    /// Stage indices merged before the final NMS (0 = stage 1, k = stage-2 pass k-1)
    pub ensemble_stages: Vec<usize>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            nms_pre: 1000,
            iou_thr: 0.5,
            score_thr: 0.01,
            ensemble_stages: vec![0, 1],
        }
    }
}

/// Complete detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Quantization unit in metres
    pub voxel_size: f32,
    pub backbone: BackboneConfig,
    pub head: HeadConfig,
    pub stage2: Option<Stage2Config>,
    pub image_branch: Option<ImageBranchConfig>,
    pub fusion_gate: Option<FusionGateConfig>,
    pub freeze_img_branch: bool,
    pub freeze_stage1: bool,
    pub test: TestConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::two_stage()
    }
}

impl DetectorConfig {
    /// Stage-1 only detector; the ensemble reduces to stage 1
    #[must_use]
    pub fn single_stage() -> Self {
        Self {
            voxel_size: 0.01,
            backbone: BackboneConfig::default(),
            head: HeadConfig::default(),
            stage2: None,
            image_branch: None,
            fusion_gate: None,
            freeze_img_branch: false,
            freeze_stage1: false,
            test: TestConfig {
                ensemble_stages: vec![0],
                ..TestConfig::default()
            },
        }
    }

    /// Stage 1 + point refinement, both stages ensembled
    #[must_use]
    pub fn two_stage() -> Self {
        Self {
            stage2: Some(Stage2Config::default()),
            test: TestConfig::default(),
            ..Self::single_stage()
        }
    }

    /// Two stages with an image branch feeding stage 2 and the fusion gate
    #[must_use]
    pub fn two_stage_with_image() -> Self {
        Self {
            stage2: Some(Stage2Config {
                use_image: true,
                ..Stage2Config::default()
            }),
            image_branch: Some(ImageBranchConfig::default()),
            fusion_gate: Some(FusionGateConfig::default()),
            ..Self::two_stage()
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Stage-2 refinement passes, zero when stage 2 is disabled
    #[must_use]
    pub fn n_stage2_passes(&self) -> usize {
        self.stage2.as_ref().map_or(0, |s| s.n_passes)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(DetectionError::config(format!(
                "voxel_size must be positive, got {}",
                self.voxel_size
            )));
        }
        self.backbone.validate()?;

        let head = &self.head;
        let expected = self.backbone.stage_channels()?;
        if head.in_channels != expected {
            return Err(DetectionError::config(format!(
                "head in_channels {:?} do not match backbone outputs {:?}",
                head.in_channels, expected
            )));
        }
        if head.assigner.n_scales != self.backbone.num_stages {
            return Err(DetectionError::config(format!(
                "assigner n_scales {} differs from backbone num_stages {}",
                head.assigner.n_scales, self.backbone.num_stages
            )));
        }
        if head.n_classes == 0 || head.out_channels == 0 {
            return Err(DetectionError::config(
                "n_classes and out_channels must be positive",
            ));
        }
        if head.n_reg_outs != 6 && head.n_reg_outs != 8 {
            return Err(DetectionError::config(format!(
                "n_reg_outs must be 6 or 8, got {}",
                head.n_reg_outs
            )));
        }
        if head.assigner.limit == 0 || head.assigner.topk == 0 || head.n_select == 0 {
            return Err(DetectionError::config(
                "assigner limit/topk and n_select must be positive",
            ));
        }

        if let Some(stage2) = &self.stage2 {
            if stage2.n_passes == 0 || stage2.hidden_channels == 0 {
                return Err(DetectionError::config(
                    "stage2 n_passes and hidden_channels must be positive",
                ));
            }
            if stage2.use_image && self.image_branch.is_none() {
                return Err(DetectionError::config(
                    "stage2 use_image requires an image_branch",
                ));
            }
        }

        if let Some(image) = &self.image_branch {
            if image.sa_levels == 0 || image.channels % image.sa_levels != 0 {
                return Err(DetectionError::config(format!(
                    "image channels {} must split evenly into {} gate levels",
                    image.channels, image.sa_levels
                )));
            }
            if !(image.ffn_scale > 0.0) || image.in_channels == 0 {
                return Err(DetectionError::config(
                    "image ffn_scale and in_channels must be positive",
                ));
            }
        }

        if let Some(gate) = &self.fusion_gate {
            if self.image_branch.is_none() {
                return Err(DetectionError::config("fusion_gate requires an image_branch"));
            }
            if gate.image_level >= IMAGE_PYRAMID_LEVELS {
                return Err(DetectionError::config(format!(
                    "fusion_gate image_level {} out of range",
                    gate.image_level
                )));
            }
        }

        let test = &self.test;
        if !(0.0..=1.0).contains(&test.iou_thr) {
            return Err(DetectionError::config(format!(
                "iou_thr must be within [0, 1], got {}",
                test.iou_thr
            )));
        }
        if test.ensemble_stages.is_empty() {
            return Err(DetectionError::config("ensemble_stages must not be empty"));
        }
        let n_stages = 1 + self.n_stage2_passes();
        if let Some(bad) = test.ensemble_stages.iter().find(|&&s| s >= n_stages) {
            return Err(DetectionError::config(format!(
                "ensemble stage {bad} does not exist ({n_stages} stage(s) configured)"
            )));
        }
        Ok(())
    }
}
