//! Single-stage anchor-free head over the sparse feature pyramid
//!
//! Every voxel of every level predicts class logits, a centerness logit and
//! a box relative to its own position. Predictions are kept per image in
//! level-concatenated order (level 0 first, rows in coordinate order inside
//! a level); targets, selection indices and stage-2 inputs all use that
//! order.

use crate::assigner::{ImageTargets, TopkLimitAssigner};
use crate::bbox_coder::{BoxCoder, DISTANCE_CHANNELS};
use crate::losses::{DetectionLoss, FlatPredictions, FlatTargets, LossMap};
use crate::nms::{class_wise_nms, Candidates};
use candle_core::{Device, Tensor, D};
use candle_nn::{linear, ops, Init, Linear, Module, VarBuilder};
use std::cmp::Ordering;
use tracing::{debug, info};
use voxel_det3d_common::{
    BBoxResult, Box3D, DetectionError, HeadConfig, Result, TestConfig,
};
use voxel_det3d_sparse::SparseVoxelTensor;

/// Classification prior of 0.01
pub(crate) const CLS_PRIOR_BIAS: f64 = -4.595_119_85;

/// Linear prediction layer with `N(0, 0.01)` weights and constant bias
pub(crate) fn head_linear(vb: VarBuilder, in_dim: usize, out_dim: usize, bias: f64) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 0.01,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(bias))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Turn raw regression into positive face distances plus rotation code
pub(crate) fn activate_regression(reg: &Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
    let r = reg.dim(D::Minus1)?;
    let distances = reg.narrow(1, 0, DISTANCE_CHANNELS)?;
    let distances = match scale {
        Some(scale) => distances.broadcast_mul(scale)?,
        None => distances,
    }
    .exp()?;
    if r > DISTANCE_CHANNELS {
        let rotation = reg.narrow(1, DISTANCE_CHANNELS, r - DISTANCE_CHANNELS)?;
        Ok(Tensor::cat(&[&distances, &rotation], 1)?)
    } else {
        Ok(distances)
    }
}

/// Per-image stage-1 predictions in level-concatenated order
#[derive(Debug, Clone)]
pub struct Stage1Output {
    /// `(N_b, n_classes)` logits
    pub cls: Vec<Tensor>,
    /// `(N_b,)` logits
    pub centerness: Vec<Tensor>,
    /// `(N_b, n_reg_outs)` activated regression
    pub bbox: Vec<Tensor>,
    /// `(N_b, out_channels)` neck features
    pub features: Vec<Tensor>,
    pub points: Vec<Vec<[f32; 3]>>,
    pub level_sizes: Vec<Vec<usize>>,
}

impl Stage1Output {
    pub fn batch_size(&self) -> usize {
        self.cls.len()
    }

    /// Same predictions cut from the autograd graph
    pub fn detach(&self) -> Self {
        let detach = |v: &[Tensor]| -> Vec<Tensor> { v.iter().map(Tensor::detach).collect() };
        Self {
            cls: detach(&self.cls),
            centerness: detach(&self.centerness),
            bbox: detach(&self.bbox),
            features: detach(&self.features),
            points: self.points.clone(),
            level_sizes: self.level_sizes.clone(),
        }
    }

    /// Predictions of the whole batch stacked row-wise
    pub fn flat(&self) -> Result<FlatPredictions> {
        Ok(FlatPredictions {
            cls: Tensor::cat(&self.cls, 0)?,
            centerness: Tensor::cat(&self.centerness, 0)?,
            bbox: Tensor::cat(&self.bbox, 0)?,
        })
    }

    /// Level of every row of image `b`
    pub fn levels(&self, b: usize) -> Vec<usize> {
        self.level_sizes[b]
            .iter()
            .enumerate()
            .flat_map(|(level, &size)| std::iter::repeat(level).take(size))
            .collect()
    }
}

/// Points picked for stage 2, `n_select` per image
#[derive(Debug, Clone)]
pub struct SelectedPoints {
    /// Per image, indices into the level-concatenated rows, best first
    pub sort_inds: Vec<Vec<u32>>,
    /// `(B, N, 3)`
    pub points: Tensor,
    /// `(B, N, C)` gathered neck features
    pub features: Tensor,
    pub levels: Vec<Vec<usize>>,
    /// Host copy of `points`
    pub coords: Vec<Vec<[f32; 3]>>,
}

impl SelectedPoints {
    pub fn batch_size(&self) -> usize {
        self.sort_inds.len()
    }

    pub fn num_points(&self) -> usize {
        self.sort_inds.first().map_or(0, Vec::len)
    }

    pub fn detach(&self) -> Self {
        Self {
            points: self.points.detach(),
            features: self.features.detach(),
            ..self.clone()
        }
    }
}

/// Stable ranking of `scores`, best first, ties by index
pub fn rank_descending(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
}

#[derive(Debug, Clone)]
pub struct Stage1Head {
    necks: Vec<Linear>,
    cls: Linear,
    centerness: Linear,
    reg: Linear,
    scales: Vec<Tensor>,
    in_channels: Vec<usize>,
    n_classes: usize,
    n_select: usize,
    coder: BoxCoder,
    assigner: TopkLimitAssigner,
    loss: DetectionLoss,
}

impl Stage1Head {
    pub fn new(vb: VarBuilder, config: &HeadConfig) -> Result<Self> {
        if config.in_channels.len() != config.assigner.n_scales {
            return Err(DetectionError::InvalidConfig(format!(
                "{} head input levels but assigner over {} scales",
                config.in_channels.len(),
                config.assigner.n_scales
            )));
        }
        let coder = BoxCoder::new(config.n_reg_outs)?;
        let assigner = TopkLimitAssigner::new(&config.assigner, coder)?;

        let necks = config
            .in_channels
            .iter()
            .enumerate()
            .map(|(i, &c)| linear(c, config.out_channels, vb.pp("neck").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let scales = (0..config.in_channels.len())
            .map(|i| vb.pp("scales").get_with_hints(1, &i.to_string(), Init::Const(1.0)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        info!(
            "Stage-1 head: {} levels -> {} channels, {} classes, {} regression outputs",
            config.in_channels.len(),
            config.out_channels,
            config.n_classes,
            config.n_reg_outs
        );

        Ok(Self {
            necks,
            cls: head_linear(vb.pp("cls"), config.out_channels, config.n_classes, CLS_PRIOR_BIAS)?,
            centerness: head_linear(vb.pp("centerness"), config.out_channels, 1, 0.0)?,
            reg: head_linear(vb.pp("reg"), config.out_channels, config.n_reg_outs, 0.0)?,
            scales,
            in_channels: config.in_channels.clone(),
            n_classes: config.n_classes,
            n_select: config.n_select,
            coder,
            assigner,
            loss: DetectionLoss::new(config.loss.clone(), config.n_classes),
        })
    }

    pub fn coder(&self) -> BoxCoder {
        self.coder
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_select(&self) -> usize {
        self.n_select
    }

    /// Predict on every level of the backbone output
    pub fn forward(&self, levels: &[SparseVoxelTensor], voxel_size: f32) -> Result<Stage1Output> {
        if levels.len() != self.necks.len() {
            return Err(DetectionError::shape(format!(
                "head built for {} levels, got {}",
                self.necks.len(),
                levels.len()
            )));
        }
        let batch = levels[0].batch_size();
        let mut cls_parts: Vec<Vec<Tensor>> = vec![Vec::new(); batch];
        let mut ctr_parts: Vec<Vec<Tensor>> = vec![Vec::new(); batch];
        let mut bbox_parts: Vec<Vec<Tensor>> = vec![Vec::new(); batch];
        let mut feat_parts: Vec<Vec<Tensor>> = vec![Vec::new(); batch];
        let mut points: Vec<Vec<[f32; 3]>> = vec![Vec::new(); batch];
        let mut level_sizes: Vec<Vec<usize>> = vec![Vec::new(); batch];

        for (l, x) in levels.iter().enumerate() {
            if x.batch_size() != batch || x.channels() != self.in_channels[l] {
                return Err(DetectionError::shape(format!(
                    "level {l}: batch {} with {} channels, expected batch {batch} with {}",
                    x.batch_size(),
                    x.channels(),
                    self.in_channels[l]
                )));
            }
            let feats = self.necks[l].forward(x.features())?.relu()?;
            let cls = self.cls.forward(&feats)?;
            let ctr = self.centerness.forward(&feats)?.squeeze(1)?;
            let bbox = activate_regression(&self.reg.forward(&feats)?, Some(&self.scales[l]))?;
            let level_points = x.decomposed_points(voxel_size);

            for (b, pts) in level_points.into_iter().enumerate() {
                let rows = x.batch_rows(b);
                cls_parts[b].push(cls.narrow(0, rows.start, rows.len())?);
                ctr_parts[b].push(ctr.narrow(0, rows.start, rows.len())?);
                bbox_parts[b].push(bbox.narrow(0, rows.start, rows.len())?);
                feat_parts[b].push(feats.narrow(0, rows.start, rows.len())?);
                level_sizes[b].push(rows.len());
                points[b].extend(pts);
            }
            debug!("Stage-1 level {}: {} points", l, x.num_points());
        }

        let cat = |parts: Vec<Vec<Tensor>>| -> Result<Vec<Tensor>> {
            parts.iter().map(|p| Ok(Tensor::cat(p, 0)?)).collect::<Result<Vec<_>>>()
        };
        Ok(Stage1Output {
            cls: cat(cls_parts)?,
            centerness: cat(ctr_parts)?,
            bbox: cat(bbox_parts)?,
            features: cat(feat_parts)?,
            points,
            level_sizes,
        })
    }

    /// Assign targets and compute `loss_cls`, `loss_centerness` and
    /// `loss_bbox`. The per-image target tensors are returned alongside
    /// for stage 2.
    pub fn loss(
        &self,
        out: &Stage1Output,
        gt_boxes: &[Vec<Box3D>],
        gt_labels: &[Vec<usize>],
    ) -> Result<(LossMap, Vec<ImageTargets>)> {
        let batch = out.batch_size();
        if gt_boxes.len() != batch || gt_labels.len() != batch {
            return Err(DetectionError::shape(format!(
                "{} images but {} box sets and {} label sets",
                batch,
                gt_boxes.len(),
                gt_labels.len()
            )));
        }
        let device = out.cls[0].device();

        let mut targets = Vec::with_capacity(batch);
        let mut labels = Vec::new();
        for b in 0..batch {
            let assigned =
                self.assigner
                    .assign(&out.points[b], &out.level_sizes[b], &gt_boxes[b], &gt_labels[b])?;
            debug!(
                "Image {}: {} of {} points assigned to {} boxes",
                b,
                assigned.num_positive(),
                assigned.len(),
                gt_boxes[b].len()
            );
            labels.extend_from_slice(&assigned.labels);
            targets.push(assigned.to_tensors(device)?);
        }

        let centerness = Tensor::cat(&targets.iter().map(|t| t.centerness.clone()).collect::<Vec<_>>(), 0)?;
        let bbox = Tensor::cat(&targets.iter().map(|t| t.bbox.clone()).collect::<Vec<_>>(), 0)?;
        let (loss_cls, loss_ctr, loss_bbox) = self.loss.compute(
            &out.flat()?,
            &FlatTargets {
                centerness: &centerness,
                bbox: &bbox,
                labels: &labels,
            },
        )?;

        let mut losses = LossMap::new();
        losses.insert("loss_cls".to_string(), loss_cls);
        losses.insert("loss_centerness".to_string(), loss_ctr);
        losses.insert("loss_bbox".to_string(), loss_bbox);
        Ok((losses, targets))
    }

    /// `sigmoid(centerness) * max_c sigmoid(cls)` for every row of image `b`
    pub fn selection_scores(&self, out: &Stage1Output, b: usize) -> Result<Vec<f32>> {
        let cls = ops::sigmoid(&out.cls[b].detach())?.max(D::Minus1)?;
        let ctr = ops::sigmoid(&out.centerness[b].detach())?;
        Ok((cls * ctr)?.to_vec1::<f32>()?)
    }

    /// Keep the `n_select` best-scoring points of every image
    pub fn select_points(&self, out: &Stage1Output) -> Result<SelectedPoints> {
        let batch = out.batch_size();
        let device = out.features[0].device().clone();
        let mut sort_inds = Vec::with_capacity(batch);
        let mut features = Vec::with_capacity(batch);
        let mut points = Vec::with_capacity(batch);
        let mut levels = Vec::with_capacity(batch);
        let mut coords = Vec::with_capacity(batch);

        for b in 0..batch {
            let scores = self.selection_scores(out, b)?;
            if scores.len() < self.n_select {
                return Err(DetectionError::InsufficientPoints {
                    image: b,
                    available: scores.len(),
                    requested: self.n_select,
                });
            }
            let mut order = rank_descending(&scores);
            order.truncate(self.n_select);

            let image_levels = out.levels(b);
            let inds: Vec<u32> = order.iter().map(|&i| i as u32).collect();
            let index = Tensor::new(inds.as_slice(), &device)?;
            features.push(out.features[b].index_select(&index, 0)?);
            let selected: Vec<[f32; 3]> = order.iter().map(|&i| out.points[b][i]).collect();
            points.push(points_tensor(&selected, &device)?);
            levels.push(order.iter().map(|&i| image_levels[i]).collect());
            coords.push(selected);
            sort_inds.push(inds);
        }
        debug!("Selected {} points per image for stage 2", self.n_select);

        Ok(SelectedPoints {
            sort_inds,
            points: Tensor::stack(&points, 0)?,
            features: Tensor::stack(&features, 0)?,
            levels,
            coords,
        })
    }

    /// Decoded boxes and score matrices per image, at most `nms_pre`
    /// points per level
    pub fn candidates(&self, out: &Stage1Output, nms_pre: usize) -> Result<Vec<Candidates>> {
        (0..out.batch_size())
            .map(|b| -> Result<Candidates> {
                let cls = ops::sigmoid(&out.cls[b].detach())?.to_vec2::<f32>()?;
                let ctr = ops::sigmoid(&out.centerness[b].detach())?.to_vec1::<f32>()?;
                let bbox = out.bbox[b].detach().to_vec2::<f32>()?;

                let mut candidates = Candidates::new(self.n_classes);
                let mut start = 0;
                for &size in &out.level_sizes[b] {
                    let rows: Vec<Vec<f32>> = (start..start + size)
                        .map(|i| cls[i].iter().map(|&p| p * ctr[i]).collect())
                        .collect();
                    let max_scores: Vec<f32> = rows
                        .iter()
                        .map(|r| r.iter().copied().fold(f32::NEG_INFINITY, f32::max))
                        .collect();
                    let mut order = rank_descending(&max_scores);
                    order.truncate(nms_pre);
                    for k in order {
                        let i = start + k;
                        candidates.push(self.coder.decode(out.points[b][i], &bbox[i]), &rows[k])?;
                    }
                    start += size;
                }
                Ok(candidates)
            })
            .collect()
    }

    /// Stage-1 detections after class-wise NMS
    pub fn get_bboxes(&self, out: &Stage1Output, test: &TestConfig) -> Result<Vec<BBoxResult>> {
        Ok(self
            .candidates(out, test.nms_pre)?
            .iter()
            .map(|c| class_wise_nms(c, test.score_thr, test.iou_thr))
            .collect())
    }
}

/// `(N, 3)` tensor of host points
pub fn points_tensor(points: &[[f32; 3]], device: &Device) -> Result<Tensor> {
    let flat: Vec<f32> = points.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (points.len(), 3), device)?)
}
