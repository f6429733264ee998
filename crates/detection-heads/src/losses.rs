//! Classification, centerness and box losses shared by both stages

use crate::bbox_coder::DISTANCE_CHANNELS;
use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use std::collections::BTreeMap;
use voxel_det3d_common::{DetectionError, LossConfig, Result, BACKGROUND_LABEL};

/// Named scalar losses, ordered by name
pub type LossMap = BTreeMap<String, Tensor>;

/// `log(1 + exp(-|x|))`, the numerically stable tail of BCE-with-logits
fn log1p_exp_neg_abs(x: &Tensor) -> Result<Tensor> {
    Ok((x.abs()?.neg()?.exp()? + 1.0)?.log()?)
}

/// Element-wise binary cross-entropy on logits
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let loss = (logits.relu()? - (logits * targets)?)?;
    Ok((loss + log1p_exp_neg_abs(logits)?)?)
}

/// One-hot `(N, C)` float targets; background rows are all zero
pub fn one_hot(labels: &[i64], n_classes: usize, dtype: DType, device: &candle_core::Device) -> Result<Tensor> {
    let mut data = vec![0f32; labels.len() * n_classes];
    for (i, &label) in labels.iter().enumerate() {
        if label == BACKGROUND_LABEL {
            continue;
        }
        let class = usize::try_from(label)
            .ok()
            .filter(|&c| c < n_classes)
            .ok_or_else(|| DetectionError::shape(format!("label {label} outside {n_classes} classes")))?;
        data[i * n_classes + class] = 1.0;
    }
    Ok(Tensor::from_vec(data, (labels.len(), n_classes), device)?.to_dtype(dtype)?)
}

/// Summed sigmoid focal loss over every point and class
pub fn sigmoid_focal_loss(logits: &Tensor, targets: &Tensor, gamma: f32, alpha: f32) -> Result<Tensor> {
    let p = ops::sigmoid(logits)?;
    let ce = bce_with_logits(logits, targets)?;
    let not_targets = targets.affine(-1.0, 1.0)?;
    let p_t = ((&p * targets)? + (p.affine(-1.0, 1.0)? * &not_targets)?)?;
    let modulating = p_t.affine(-1.0, 1.0)?.powf(f64::from(gamma))?;
    let alpha_t = (targets.affine(f64::from(alpha), 0.0)?
        + not_targets.affine(f64::from(1.0 - alpha), 0.0)?)?;
    Ok((ce * modulating)?.mul(&alpha_t)?.sum_all()?)
}

/// Per-row `1 - IoU` of boxes given as face distances about the same point
pub fn distance_iou_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred = pred.narrow(1, 0, DISTANCE_CHANNELS)?;
    let target = target.narrow(1, 0, DISTANCE_CHANNELS)?;
    let volume = |d: &Tensor| -> Result<Tensor> {
        let x = (d.narrow(1, 0, 1)? + d.narrow(1, 1, 1)?)?;
        let y = (d.narrow(1, 2, 1)? + d.narrow(1, 3, 1)?)?;
        let z = (d.narrow(1, 4, 1)? + d.narrow(1, 5, 1)?)?;
        Ok(((x * y)? * z)?)
    };
    let overlap = pred.minimum(&target)?;
    let inter = volume(&overlap)?;
    let union = ((volume(&pred)? + volume(&target)?)? - &inter)?;
    let iou = (inter / (union + 1e-6)?)?;
    Ok(iou.affine(-1.0, 1.0)?.squeeze(1)?)
}

/// Element-wise smooth L1 with transition at `beta`
pub fn smooth_l1(pred: &Tensor, target: &Tensor, beta: f64) -> Result<Tensor> {
    let diff = (pred - target)?.abs()?;
    let quadratic = (diff.sqr()? * (0.5 / beta))?;
    let linear = (&diff - 0.5 * beta)?;
    Ok(diff.lt(beta)?.where_cond(&quadratic, &linear)?)
}

/// Raw per-point predictions of one stage, flattened over the batch
#[derive(Debug, Clone)]
pub struct FlatPredictions {
    /// `(N, C)` class logits
    pub cls: Tensor,
    /// `(N,)` centerness logits
    pub centerness: Tensor,
    /// `(N, R)` decoded regression (positive distances + rotation code)
    pub bbox: Tensor,
}

/// Targets matching [`FlatPredictions`] row for row
#[derive(Debug, Clone)]
pub struct FlatTargets<'a> {
    pub centerness: &'a Tensor,
    pub bbox: &'a Tensor,
    pub labels: &'a [i64],
}

/// Classification, centerness and box losses of one prediction set
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    config: LossConfig,
    n_classes: usize,
}

impl DetectionLoss {
    pub fn new(config: LossConfig, n_classes: usize) -> Self {
        Self { config, n_classes }
    }

    /// Returns `(loss_cls, loss_centerness, loss_bbox)`.
    ///
    /// Classification is normalised by the number of positives; centerness
    /// and box terms only see positives, the IoU term weighted by the
    /// centerness targets. With no positives the latter two are zero but
    /// stay connected to the predictions.
    pub fn compute(&self, preds: &FlatPredictions, targets: &FlatTargets<'_>) -> Result<(Tensor, Tensor, Tensor)> {
        let n = targets.labels.len();
        if preds.cls.dim(0)? != n || preds.bbox.dim(0)? != n || preds.centerness.dim(0)? != n {
            return Err(DetectionError::shape(format!(
                "{} targets for {} predictions",
                n,
                preds.cls.dim(0)?
            )));
        }
        let device = preds.cls.device();
        let dtype = preds.cls.dtype();

        let positives: Vec<u32> = targets
            .labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l != BACKGROUND_LABEL)
            .map(|(i, _)| i as u32)
            .collect();
        let num_pos = positives.len().max(1) as f64;

        let cls_targets = one_hot(targets.labels, self.n_classes, dtype, device)?;
        let loss_cls = (sigmoid_focal_loss(&preds.cls, &cls_targets, self.config.focal_gamma, self.config.focal_alpha)?
            / num_pos)?;
        let loss_cls = (loss_cls * f64::from(self.config.cls_weight))?;

        if positives.is_empty() {
            let zero_ctr = (preds.centerness.sum_all()? * 0.0)?;
            let zero_bbox = (preds.bbox.sum_all()? * 0.0)?;
            return Ok((loss_cls, zero_ctr, zero_bbox));
        }

        let pos = Tensor::new(positives.as_slice(), device)?;
        let pos_ctr = preds.centerness.index_select(&pos, 0)?;
        let pos_ctr_targets = targets.centerness.index_select(&pos, 0)?.to_dtype(dtype)?;
        let loss_ctr = (bce_with_logits(&pos_ctr, &pos_ctr_targets)?.mean_all()?
            * f64::from(self.config.centerness_weight))?;

        let pos_bbox = preds.bbox.contiguous()?.index_select(&pos, 0)?;
        let pos_bbox_targets = targets.bbox.index_select(&pos, 0)?.to_dtype(dtype)?;
        let iou = distance_iou_loss(&pos_bbox, &pos_bbox_targets)?;
        let weight_sum = pos_ctr_targets.sum_all()?.to_scalar::<f32>()?.max(1e-6);
        let mut loss_bbox = ((iou * &pos_ctr_targets)?.sum_all()? / f64::from(weight_sum))?;

        let r = pos_bbox.dim(D::Minus1)?;
        if r > DISTANCE_CHANNELS {
            let angle = pos_bbox.narrow(1, DISTANCE_CHANNELS, r - DISTANCE_CHANNELS)?;
            let angle_targets = pos_bbox_targets.narrow(1, DISTANCE_CHANNELS, r - DISTANCE_CHANNELS)?;
            let angle_loss = smooth_l1(&angle, &angle_targets, 1.0)?.mean_all()?;
            loss_bbox = (loss_bbox + (angle_loss * f64::from(self.config.angle_weight))?)?;
        }
        let loss_bbox = (loss_bbox * f64::from(self.config.bbox_weight))?;
        Ok((loss_cls, loss_ctr, loss_bbox))
    }
}
