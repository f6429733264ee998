//! The composed detector
//!
//! ```text
//! CollectPoints -> ExtractBackboneFeatures -> Stage1Decode
//!   -> [ExtractImageFeatures] -> Stage2Select -> Stage2Decode -> Ensemble
//! ```
//!
//! Image features are extracted before the backbone when the fusion gate
//! needs them, otherwise only once stage 2 asks for them.

use crate::ensemble::Ensembler;
use crate::targets::remap_targets;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};
use voxel_det3d_common::{BBoxResult, Box3D, DetectionError, DetectorConfig, ImageMeta, Result};
use voxel_det3d_heads::{LossMap, Stage1Head, Stage1Output, Stage2Head};
use voxel_det3d_image::{ImageBranch, ImageContext, ImageFeatureExtractor, ImageFusionGate};
use voxel_det3d_sparse::{MinkResNet, SparseVoxelTensor, VoxelCollator};

/// Camera side of one batch
#[derive(Debug, Clone, Copy)]
pub struct ImageInputs<'a> {
    /// `(B, C, H, W)`
    pub images: &'a Tensor,
    pub metas: &'a [ImageMeta],
}

#[derive(Debug)]
pub struct Detector {
    config: DetectorConfig,
    device: Device,
    collator: VoxelCollator,
    backbone: MinkResNet,
    fusion_gate: Option<ImageFusionGate>,
    image_branch: Option<ImageBranch>,
    stage1: Stage1Head,
    stage2: Option<Stage2Head>,
    ensembler: Ensembler,
}

impl Detector {
    /// Build every configured path, creating parameters in `varmap` under
    /// `backbone`, `fusion_gate`, `img_backbone`, `img_modulation`, `head`
    /// and `stage2`.
    pub fn new(config: DetectorConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        Self::build(config, varmap, device, None)
    }

    /// Same as [`Detector::new`] with an external 2D feature extractor in
    /// place of the built-in convolutional pyramid
    pub fn with_image_extractor(
        config: DetectorConfig,
        varmap: &VarMap,
        device: &Device,
        extractor: Box<dyn ImageFeatureExtractor>,
    ) -> Result<Self> {
        Self::build(config, varmap, device, Some(extractor))
    }

    fn build(
        config: DetectorConfig,
        varmap: &VarMap,
        device: &Device,
        extractor: Option<Box<dyn ImageFeatureExtractor>>,
    ) -> Result<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

        let backbone = MinkResNet::new(vb.pp("backbone"), &config.backbone)?;
        let image_frozen = config.freeze_img_branch || config.freeze_stage1;
        let image_branch = match (&config.image_branch, extractor) {
            (Some(cfg), Some(extractor)) => {
                Some(ImageBranch::with_extractor(vb.clone(), extractor, cfg, image_frozen)?)
            }
            (Some(cfg), None) => Some(ImageBranch::new(vb.clone(), cfg, image_frozen)?),
            (None, Some(_)) => {
                return Err(DetectionError::InvalidConfig(
                    "an image extractor was given but no image_branch is configured".to_string(),
                ))
            }
            (None, None) => None,
        };
        let image_channels = image_branch.as_ref().map(ImageBranch::channels);

        let fusion_gate = match (&config.fusion_gate, image_channels) {
            (Some(gate), Some(channels)) => Some(ImageFusionGate::new(
                vb.pp("fusion_gate"),
                backbone.stem_channels(),
                channels,
                gate.image_level,
            )?),
            _ => None,
        };
        let stage1 = Stage1Head::new(vb.pp("head"), &config.head)?;
        let stage2 = config
            .stage2
            .as_ref()
            .map(|s2| Stage2Head::new(vb.pp("stage2"), s2, &config.head, image_channels))
            .transpose()?;
        let ensembler = Ensembler::new(&config.test, 1 + config.n_stage2_passes())?;

        info!(
            "Detector: stage 2 {}, image branch {}, fusion gate {}, ensemble stages {:?}",
            if stage2.is_some() { "on" } else { "off" },
            if image_branch.is_some() { "on" } else { "off" },
            if fusion_gate.is_some() { "on" } else { "off" },
            config.test.ensemble_stages
        );

        Ok(Self {
            collator: VoxelCollator::new(config.voxel_size, device.clone()),
            device: device.clone(),
            config,
            backbone,
            fusion_gate,
            image_branch,
            stage1,
            stage2,
            ensembler,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn has_image_branch(&self) -> bool {
        self.image_branch.is_some()
    }

    fn check_batch(&self, batch: usize, images: Option<ImageInputs<'_>>) -> Result<()> {
        if batch == 0 {
            return Err(DetectionError::shape("empty batch"));
        }
        match (images, &self.image_branch) {
            (Some(inputs), _) => {
                let image_batch = inputs.images.dim(0)?;
                if image_batch != batch || inputs.metas.len() != batch {
                    return Err(DetectionError::shape(format!(
                        "{batch} point clouds, {image_batch} images and {} metas",
                        inputs.metas.len()
                    )));
                }
                Ok(())
            }
            (None, Some(_)) => Err(DetectionError::shape(
                "the image branch is configured but no images were given",
            )),
            (None, None) => Ok(()),
        }
    }

    fn extract_image(&self, images: Option<ImageInputs<'_>>) -> Result<Option<ImageContext>> {
        match (&self.image_branch, images) {
            (Some(branch), Some(inputs)) => {
                debug!("ExtractImageFeatures");
                Ok(Some(branch.forward(inputs.images, inputs.metas)?))
            }
            _ => Ok(None),
        }
    }

    fn extract_feat(
        &self,
        points: &[Tensor],
        context: Option<&ImageContext>,
        train: bool,
    ) -> Result<Vec<SparseVoxelTensor>> {
        let x = self.collator.collate(points)?;
        debug!("CollectPoints: {} voxels in {} clouds", x.num_points(), x.batch_size());
        let levels = match (&self.fusion_gate, context) {
            (Some(gate), Some(context)) => self.backbone.forward_with_fusion(
                &x,
                &gate.bind(context, self.config.voxel_size),
                train,
            )?,
            _ => self.backbone.forward_t(&x, train)?,
        };
        debug!(
            "ExtractBackboneFeatures: {:?} voxels per level",
            levels.iter().map(SparseVoxelTensor::num_points).collect::<Vec<_>>()
        );
        Ok(levels)
    }

    /// Image context (when needed before the backbone), backbone levels and
    /// stage-1 predictions
    fn stage1_forward(
        &self,
        points: &[Tensor],
        images: Option<ImageInputs<'_>>,
        train: bool,
    ) -> Result<(Option<ImageContext>, Stage1Output)> {
        let context = if self.fusion_gate.is_some() {
            self.extract_image(images)?
        } else {
            None
        };
        let levels = self.extract_feat(points, context.as_ref(), train)?;
        let out = self.stage1.forward(&levels, self.config.voxel_size)?;
        debug!("Stage1Decode: {} images", out.batch_size());
        Ok((context, out))
    }

    /// Losses of every configured stage, keyed by name.
    ///
    /// With `freeze_stage1` the backbone, fusion gate and stage-1 head
    /// receive no gradient; their losses are still reported.
    pub fn forward_train(
        &self,
        points: &[Tensor],
        gt_boxes: &[Vec<Box3D>],
        gt_labels: &[Vec<usize>],
        images: Option<ImageInputs<'_>>,
    ) -> Result<LossMap> {
        self.check_batch(points.len(), images)?;
        if gt_boxes.len() != points.len() || gt_labels.len() != points.len() {
            return Err(DetectionError::shape(format!(
                "{} point clouds but {} box sets and {} label sets",
                points.len(),
                gt_boxes.len(),
                gt_labels.len()
            )));
        }

        let (mut context, out) = self.stage1_forward(points, images, true)?;
        let out = if self.config.freeze_stage1 { out.detach() } else { out };
        let (mut losses, targets) = self.stage1.loss(&out, gt_boxes, gt_labels)?;

        if let Some(stage2) = &self.stage2 {
            let selected = self.stage1.select_points(&out)?;
            debug!("Stage2Select: {} points per image", selected.num_points());
            if context.is_none() && stage2.uses_image() {
                context = self.extract_image(images)?;
            }
            let s2_targets = remap_targets(&targets, &selected.sort_inds)?;
            let s2 = stage2.forward(&selected, context.as_ref())?;
            losses.extend(stage2.loss(&s2, &s2_targets)?);
        }
        Ok(losses)
    }

    /// Per-image detections after ensembling
    pub fn simple_test(&self, points: &[Tensor], images: Option<ImageInputs<'_>>) -> Result<Vec<BBoxResult>> {
        self.check_batch(points.len(), images)?;
        let (mut context, out) = self.stage1_forward(points, images, false)?;
        let nms_pre = self.config.test.nms_pre;

        let n_classes = self.stage1.n_classes();
        let skipped = || vec![voxel_det3d_heads::Candidates::new(n_classes); points.len()];
        let mut per_stage = vec![if self.ensembler.uses(0) {
            self.stage1.candidates(&out, nms_pre)?
        } else {
            skipped()
        }];

        if let Some(stage2) = &self.stage2 {
            let selected = self.stage1.select_points(&out)?;
            debug!("Stage2Select: {} points per image", selected.num_points());
            if context.is_none() && stage2.uses_image() {
                context = self.extract_image(images)?;
            }
            let s2 = stage2.forward(&selected, context.as_ref())?;
            for k in 0..stage2.n_passes() {
                per_stage.push(if self.ensembler.uses(k + 1) {
                    stage2.candidates(&s2, k, &selected)?
                } else {
                    skipped()
                });
            }
            debug!("Stage2Decode: {} passes", stage2.n_passes());
        }

        let results = self.ensembler.ensemble(&per_stage)?;
        debug!(
            "Ensemble: {:?} detections per image",
            results.iter().map(BBoxResult::len).collect::<Vec<_>>()
        );
        Ok(results)
    }
}
