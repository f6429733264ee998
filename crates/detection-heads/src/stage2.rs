//! Second-stage refinement over the selected points
//!
//! Each selected point is embedded from its stage-1 neck feature, its
//! position and, optionally, the image features sampled at its projection
//! on every pyramid level. A stack of residual blocks refines the
//! embedding; every block carries its own prediction layers, so pass `k`
//! yields hypothesis set `k`.

use crate::bbox_coder::BoxCoder;
use crate::losses::{DetectionLoss, FlatPredictions, FlatTargets, LossMap};
use crate::nms::Candidates;
use crate::stage1::{activate_regression, head_linear, SelectedPoints, CLS_PRIOR_BIAS};
use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, ops, LayerNorm, Linear, Module, VarBuilder};
use tracing::{debug, info};
use voxel_det3d_common::{
    DetectionError, HeadConfig, Result, Stage2Config, IMAGE_PYRAMID_LEVELS,
};
use voxel_det3d_image::ImageContext;

/// Stage-1 targets gathered in selection order
#[derive(Debug, Clone)]
pub struct Stage2Targets {
    /// `(B, N)`
    pub centerness: Tensor,
    /// `(B, N, R)`
    pub bbox: Tensor,
    /// `(B, N)` i64, `-1` for background
    pub labels: Tensor,
}

/// Residual MLP block with its own prediction layers
#[derive(Debug, Clone)]
struct RefineBlock {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    cls: Linear,
    centerness: Linear,
    reg: Linear,
}

impl RefineBlock {
    fn new(vb: VarBuilder, hidden: usize, n_classes: usize, n_reg_outs: usize) -> Result<Self> {
        Ok(Self {
            norm: layer_norm(hidden, 1e-5, vb.pp("norm"))?,
            fc1: linear(hidden, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, hidden, vb.pp("fc2"))?,
            cls: head_linear(vb.pp("cls"), hidden, n_classes, CLS_PRIOR_BIAS)?,
            centerness: head_linear(vb.pp("centerness"), hidden, 1, 0.0)?,
            reg: head_linear(vb.pp("reg"), hidden, n_reg_outs, 0.0)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, FlatPredictions)> {
        let h = self.fc1.forward(&self.norm.forward(x)?)?.relu()?;
        let x = (x + self.fc2.forward(&h)?)?;
        let preds = FlatPredictions {
            cls: self.cls.forward(&x)?,
            centerness: self.centerness.forward(&x)?.squeeze(1)?,
            bbox: activate_regression(&self.reg.forward(&x)?, None)?,
        };
        Ok((x, preds))
    }
}

/// Predictions of every refinement pass, rows image-major `(B·N, ...)`
#[derive(Debug, Clone)]
pub struct Stage2Output {
    pub passes: Vec<FlatPredictions>,
    pub batch_size: usize,
    pub num_points: usize,
}

#[derive(Debug, Clone)]
pub struct Stage2Head {
    feat_proj: Linear,
    pos_embed: (Linear, Linear),
    img_proj: Option<Linear>,
    blocks: Vec<RefineBlock>,
    n_classes: usize,
    coder: BoxCoder,
    loss: DetectionLoss,
}

impl Stage2Head {
    /// `image_channels` is the per-level width of the image pyramid and is
    /// required when `config.use_image` is set.
    pub fn new(
        vb: VarBuilder,
        config: &Stage2Config,
        head: &HeadConfig,
        image_channels: Option<usize>,
    ) -> Result<Self> {
        if config.n_passes == 0 {
            return Err(DetectionError::InvalidConfig(
                "stage 2 needs at least one pass".to_string(),
            ));
        }
        let hidden = config.hidden_channels;
        let img_proj = match (config.use_image, image_channels) {
            (true, Some(c)) => Some(linear(IMAGE_PYRAMID_LEVELS * c, hidden, vb.pp("img_proj"))?),
            (true, None) => {
                return Err(DetectionError::InvalidConfig(
                    "stage 2 image features requested without an image branch".to_string(),
                ))
            }
            (false, _) => None,
        };
        let blocks = (0..config.n_passes)
            .map(|k| RefineBlock::new(vb.pp("blocks").pp(k), hidden, head.n_classes, head.n_reg_outs))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Stage-2 head: {} passes, {} hidden channels, image features {}",
            config.n_passes,
            hidden,
            if img_proj.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            feat_proj: linear(head.out_channels, hidden, vb.pp("feat_proj"))?,
            pos_embed: (
                linear(3, hidden, vb.pp("pos_embed").pp(0))?,
                linear(hidden, hidden, vb.pp("pos_embed").pp(2))?,
            ),
            img_proj,
            blocks,
            n_classes: head.n_classes,
            coder: BoxCoder::new(head.n_reg_outs)?,
            loss: DetectionLoss::new(head.loss.clone(), head.n_classes),
        })
    }

    pub fn n_passes(&self) -> usize {
        self.blocks.len()
    }

    pub fn uses_image(&self) -> bool {
        self.img_proj.is_some()
    }

    pub fn forward(&self, selected: &SelectedPoints, image: Option<&ImageContext>) -> Result<Stage2Output> {
        let (b, n, c) = selected.features.dims3()?;
        let features = selected.features.reshape((b * n, c))?;
        let points = selected.points.reshape((b * n, 3))?;

        let mut x = self.feat_proj.forward(&features)?;
        let pos = self
            .pos_embed
            .1
            .forward(&self.pos_embed.0.forward(&points)?.relu()?)?;
        x = (x + pos)?;

        if let Some(img_proj) = &self.img_proj {
            let context = image.ok_or_else(|| {
                DetectionError::shape("stage 2 uses image features but no images were given")
            })?;
            if context.batch_size() != b {
                return Err(DetectionError::shape(format!(
                    "{} images for {} point sets",
                    context.batch_size(),
                    b
                )));
            }
            let sampled = (0..b)
                .map(|i| context.sample_all_levels(i, &selected.coords[i]))
                .collect::<Result<Vec<_>>>()?;
            x = (x + img_proj.forward(&Tensor::cat(&sampled, 0)?)?)?;
        }

        let mut passes = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, preds) = block.forward(&x)?;
            passes.push(preds);
            x = next;
        }
        debug!("Stage 2: {} passes over {}x{} points", passes.len(), b, n);
        Ok(Stage2Output {
            passes,
            batch_size: b,
            num_points: n,
        })
    }

    /// `s2_{k}_loss_cls`, `s2_{k}_loss_centerness` and `s2_{k}_loss_bbox`
    /// for every pass `k`
    pub fn loss(&self, out: &Stage2Output, targets: &Stage2Targets) -> Result<LossMap> {
        let rows = out.batch_size * out.num_points;
        let r = targets.bbox.dim(D::Minus1)?;
        let centerness = targets.centerness.reshape(rows)?;
        let bbox = targets.bbox.reshape((rows, r))?;
        let labels = targets.labels.flatten_all()?.to_vec1::<i64>()?;
        let flat = FlatTargets {
            centerness: &centerness,
            bbox: &bbox,
            labels: &labels,
        };

        let mut losses = LossMap::new();
        for (k, preds) in out.passes.iter().enumerate() {
            let (cls, ctr, bbox) = self.loss.compute(preds, &flat)?;
            losses.insert(format!("s2_{k}_loss_cls"), cls);
            losses.insert(format!("s2_{k}_loss_centerness"), ctr);
            losses.insert(format!("s2_{k}_loss_bbox"), bbox);
        }
        Ok(losses)
    }

    /// Hypotheses of pass `k` decoded around the selected points
    pub fn candidates(&self, out: &Stage2Output, k: usize, selected: &SelectedPoints) -> Result<Vec<Candidates>> {
        let preds = out.passes.get(k).ok_or_else(|| {
            DetectionError::shape(format!("stage 2 has {} passes, pass {k} requested", out.passes.len()))
        })?;
        let cls = ops::sigmoid(&preds.cls.detach())?.to_vec2::<f32>()?;
        let ctr = ops::sigmoid(&preds.centerness.detach())?.to_vec1::<f32>()?;
        let bbox = preds.bbox.detach().to_vec2::<f32>()?;

        (0..out.batch_size)
            .map(|b| -> Result<Candidates> {
                let mut candidates = Candidates::new(self.n_classes);
                for i in 0..out.num_points {
                    let row = b * out.num_points + i;
                    let scores: Vec<f32> = cls[row].iter().map(|&p| p * ctr[row]).collect();
                    candidates.push(self.coder.decode(selected.coords[b][i], &bbox[row]), &scores)?;
                }
                Ok(candidates)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage1::points_tensor;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn head_config() -> HeadConfig {
        HeadConfig {
            in_channels: vec![8; 4],
            out_channels: 8,
            n_classes: 2,
            n_select: 3,
            ..HeadConfig::default()
        }
    }

    fn selected() -> SelectedPoints {
        let coords = vec![
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0.5, 0.5, 0.5], [2.0, 0.0, 0.0], [0.0, 2.0, 0.0]],
        ];
        let points = Tensor::stack(
            &coords
                .iter()
                .map(|c| points_tensor(c, &Device::Cpu).unwrap())
                .collect::<Vec<_>>(),
            0,
        )
        .unwrap();
        SelectedPoints {
            sort_inds: vec![vec![0, 1, 2]; 2],
            points,
            features: Tensor::ones((2, 3, 8), DType::F32, &Device::Cpu).unwrap(),
            levels: vec![vec![0; 3]; 2],
            coords,
        }
    }

    #[test]
    fn test_one_prediction_set_per_pass() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Stage2Config {
            hidden_channels: 16,
            n_passes: 2,
            use_image: false,
        };
        let head = Stage2Head::new(vb, &config, &head_config(), None).unwrap();
        let out = head.forward(&selected(), None).unwrap();
        assert_eq!(out.passes.len(), 2);
        assert_eq!(out.passes[1].cls.dims(), &[6, 2]);
        assert_eq!(out.passes[1].bbox.dims(), &[6, 8]);

        let targets = Stage2Targets {
            centerness: Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            bbox: Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap(),
            labels: Tensor::new(&[[-1i64, -1, -1], [-1, -1, -1]], &Device::Cpu).unwrap(),
        };
        let losses = head.loss(&out, &targets).unwrap();
        let keys: Vec<&str> = losses.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "s2_0_loss_bbox",
                "s2_0_loss_centerness",
                "s2_0_loss_cls",
                "s2_1_loss_bbox",
                "s2_1_loss_centerness",
                "s2_1_loss_cls",
            ]
        );

        let candidates = head.candidates(&out, 1, &selected()).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].len(), 3);
        assert!(head.candidates(&out, 2, &selected()).is_err());
    }

    #[test]
    fn test_image_features_need_a_branch() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Stage2Config {
            use_image: true,
            ..Stage2Config::default()
        };
        assert!(Stage2Head::new(vb.clone(), &config, &head_config(), None).is_err());

        let head = Stage2Head::new(vb, &config, &head_config(), Some(4)).unwrap();
        assert!(head.uses_image());
        assert!(head.forward(&selected(), None).is_err());
    }
}
