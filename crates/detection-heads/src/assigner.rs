//! Top-k / limit target assignment across pyramid levels
//!
//! For one image, every ground-truth box claims a handful of points:
//!
//! 1. inside points are those with all six face distances positive;
//! 2. the box picks one level: the level before the first one holding
//!    fewer than `limit` inside points (clamped to level 0), or the
//!    coarsest level when every level holds at least `limit`;
//! 3. on that level it keeps the `limit` inside points nearest its centre
//!    (distance, then index);
//! 4. of those it keeps the `topk` with the highest centerness
//!    (centerness descending, distance, index).
//!
//! A point claimed by several boxes goes to the smallest-volume box (lowest
//! box index on ties); unclaimed points are background.

use crate::bbox_coder::BoxCoder;
use candle_core::{Device, Tensor};
use std::cmp::Ordering;
use voxel_det3d_common::{
    centerness, AssignerConfig, Box3D, DetectionError, Result, BACKGROUND_LABEL,
};

/// Per-point targets of one image in level-concatenated order
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedTargets {
    pub centerness: Vec<f32>,
    /// Row-major `(N, n_reg_outs)`
    pub bbox: Vec<f32>,
    pub labels: Vec<i64>,
    pub n_reg_outs: usize,
}

impl AssignedTargets {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_positive(&self) -> usize {
        self.labels.iter().filter(|&&l| l != BACKGROUND_LABEL).count()
    }

    /// Tensors `(N,)`, `(N, R)` and `(N,)` i64
    pub fn to_tensors(&self, device: &Device) -> Result<ImageTargets> {
        let n = self.len();
        Ok(ImageTargets {
            centerness: Tensor::from_slice(&self.centerness, n, device)?,
            bbox: Tensor::from_slice(&self.bbox, (n, self.n_reg_outs), device)?,
            labels: Tensor::from_slice(&self.labels, n, device)?,
        })
    }
}

/// Target tensors of one image
#[derive(Debug, Clone)]
pub struct ImageTargets {
    pub centerness: Tensor,
    pub bbox: Tensor,
    pub labels: Tensor,
}

/// Candidate ranking record
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    distance: f32,
    centerness: f32,
}

fn by_distance(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
        .then(a.index.cmp(&b.index))
}

fn by_centerness(a: &Candidate, b: &Candidate) -> Ordering {
    b.centerness
        .partial_cmp(&a.centerness)
        .unwrap_or(Ordering::Equal)
        .then_with(|| by_distance(a, b))
}

#[derive(Debug, Clone)]
pub struct TopkLimitAssigner {
    limit: usize,
    topk: usize,
    n_scales: usize,
    coder: BoxCoder,
}

impl TopkLimitAssigner {
    pub fn new(config: &AssignerConfig, coder: BoxCoder) -> Result<Self> {
        if config.limit == 0 || config.topk == 0 || config.n_scales == 0 {
            return Err(DetectionError::InvalidConfig(
                "assigner limit, topk and n_scales must be positive".to_string(),
            ));
        }
        Ok(Self {
            limit: config.limit,
            topk: config.topk,
            n_scales: config.n_scales,
            coder,
        })
    }

    /// Level index chosen for a box from its per-level inside counts
    pub fn best_level(&self, inside_counts: &[usize]) -> usize {
        match inside_counts.iter().position(|&c| c < self.limit) {
            Some(first_short) => first_short.saturating_sub(1),
            None => inside_counts.len().saturating_sub(1),
        }
    }

    /// Points (indices into `points`) claimed by `bbox`
    pub fn claimed_points(&self, bbox: &Box3D, points: &[[f32; 3]], level_sizes: &[usize]) -> Vec<usize> {
        let mut per_level: Vec<Vec<Candidate>> = Vec::with_capacity(level_sizes.len());
        let mut start = 0;
        for &size in level_sizes {
            let inside = (start..start + size)
                .filter_map(|index| {
                    let distances = bbox.face_distances(points[index]);
                    let c = centerness(&distances);
                    (c > 0.0).then(|| Candidate {
                        index,
                        distance: bbox.center_distance(points[index]),
                        centerness: c,
                    })
                })
                .collect();
            per_level.push(inside);
            start += size;
        }

        let counts: Vec<usize> = per_level.iter().map(Vec::len).collect();
        let level = self.best_level(&counts);
        let mut kept = std::mem::take(&mut per_level[level]);
        kept.sort_by(by_distance);
        kept.truncate(self.limit);
        kept.sort_by(by_centerness);
        kept.truncate(self.topk);
        kept.into_iter().map(|c| c.index).collect()
    }

    /// Assign targets for one image
    pub fn assign(
        &self,
        points: &[[f32; 3]],
        level_sizes: &[usize],
        gt_boxes: &[Box3D],
        gt_labels: &[usize],
    ) -> Result<AssignedTargets> {
        if level_sizes.len() != self.n_scales {
            return Err(DetectionError::shape(format!(
                "assigner expects {} levels, got {}",
                self.n_scales,
                level_sizes.len()
            )));
        }
        if level_sizes.iter().sum::<usize>() != points.len() {
            return Err(DetectionError::shape(
                "level sizes do not add up to the point count",
            ));
        }
        if gt_boxes.len() != gt_labels.len() {
            return Err(DetectionError::shape(format!(
                "{} boxes but {} labels",
                gt_boxes.len(),
                gt_labels.len()
            )));
        }

        let n = points.len();
        let r = self.coder.n_reg_outs();
        // (box index, volume) currently owning each point
        let mut owner: Vec<Option<(usize, f32)>> = vec![None; n];
        for (j, bbox) in gt_boxes.iter().enumerate() {
            let volume = bbox.volume();
            for i in self.claimed_points(bbox, points, level_sizes) {
                let smaller = owner[i].map_or(true, |(_, v)| volume < v);
                if smaller {
                    owner[i] = Some((j, volume));
                }
            }
        }

        let mut targets = AssignedTargets {
            centerness: vec![0.0; n],
            bbox: vec![0.0; n * r],
            labels: vec![BACKGROUND_LABEL; n],
            n_reg_outs: r,
        };
        for (i, own) in owner.iter().enumerate() {
            if let Some((j, _)) = own {
                let bbox = &gt_boxes[*j];
                targets.centerness[i] = centerness(&bbox.face_distances(points[i]));
                targets.bbox[i * r..(i + 1) * r].copy_from_slice(&self.coder.encode(bbox, points[i]));
                targets.labels[i] = gt_labels[*j] as i64;
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigner(limit: usize, topk: usize, n_scales: usize) -> TopkLimitAssigner {
        let config = AssignerConfig {
            limit,
            topk,
            n_scales,
        };
        TopkLimitAssigner::new(&config, BoxCoder::new(8).unwrap()).unwrap()
    }

    /// Regular grid of points with spacing `step`, centred cells
    fn grid(n: usize, step: f32) -> Vec<[f32; 3]> {
        let mut points = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    points.push([
                        (x as f32 + 0.5) * step,
                        (y as f32 + 0.5) * step,
                        (z as f32 + 0.5) * step,
                    ]);
                }
            }
        }
        points
    }

    fn pyramid() -> (Vec<[f32; 3]>, Vec<usize>) {
        let levels = [grid(8, 0.25), grid(4, 0.5), grid(2, 1.0), grid(1, 2.0)];
        let sizes = levels.iter().map(Vec::len).collect();
        (levels.concat(), sizes)
    }

    #[test]
    fn test_best_level_rule() {
        let a = assigner(4, 10, 4);
        assert_eq!(a.best_level(&[10, 6, 2, 0]), 1);
        assert_eq!(a.best_level(&[3, 2, 1, 0]), 0);
        assert_eq!(a.best_level(&[9, 8, 7, 5]), 3);
        assert_eq!(a.best_level(&[9, 2, 7, 5]), 0);
    }

    #[test]
    fn test_limit_and_topk_bound_claims() {
        let (points, sizes) = pyramid();
        let bbox = Box3D::new([1.0, 1.0, 1.0], [1.9, 1.9, 1.9], 0.0);
        for (limit, topk) in [(27, 18), (5, 18), (27, 3), (1, 1)] {
            let a = assigner(limit, topk, 4);
            let claimed = a.claimed_points(&bbox, &points, &sizes);
            assert!(claimed.len() <= limit.min(topk));
            assert!(!claimed.is_empty());

            let targets = a.assign(&points, &sizes, &[bbox], &[2]).unwrap();
            let mut start = 0;
            for &size in &sizes {
                let n = targets.labels[start..start + size].iter().filter(|&&l| l == 2).count();
                assert!(n <= limit);
                start += size;
            }
            assert!(targets.num_positive() <= topk);
        }
    }

    #[test]
    fn test_box_lands_on_level_with_enough_points() {
        let (points, sizes) = pyramid();
        // Inside counts per level are [512, 64, 8, 1]; level 3 is the first below 8
        let bbox = Box3D::new([1.0, 1.0, 1.0], [1.9, 1.9, 1.9], 0.0);
        let a = assigner(8, 18, 4);
        let claimed = a.claimed_points(&bbox, &points, &sizes);
        let level2 = sizes[0] + sizes[1]..sizes[0] + sizes[1] + sizes[2];
        assert!(claimed.iter().all(|i| level2.contains(i)), "{claimed:?}");
        assert_eq!(claimed.len(), 8);
    }

    #[test]
    fn test_zero_boxes_is_all_background() {
        let (points, sizes) = pyramid();
        let targets = assigner(27, 18, 4).assign(&points, &sizes, &[], &[]).unwrap();
        assert_eq!(targets.len(), points.len());
        assert_eq!(targets.num_positive(), 0);
        assert!(targets.centerness.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_overlap_goes_to_smallest_box() {
        let (points, sizes) = pyramid();
        // Both boxes settle on level 1 and claim the same 27 points
        let big = Box3D::new([1.0, 1.0, 1.0], [1.9, 1.9, 1.9], 0.0);
        let small = Box3D::new([1.0, 1.0, 1.0], [1.6, 1.6, 1.6], 0.0);
        let a = assigner(27, 27, 4);
        let mut big_claims = a.claimed_points(&big, &points, &sizes);
        let mut small_claims = a.claimed_points(&small, &points, &sizes);
        big_claims.sort_unstable();
        small_claims.sort_unstable();
        assert_eq!(big_claims, small_claims);
        let targets = a.assign(&points, &sizes, &[big, small], &[0, 1]).unwrap();
        assert_eq!(targets.labels.iter().filter(|&&l| l == 1).count(), 27);
        assert_eq!(targets.labels.iter().filter(|&&l| l == 0).count(), 0);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let (points, sizes) = pyramid();
        let boxes = [
            Box3D::new([1.0, 1.0, 1.0], [1.9, 1.9, 1.9], 0.4),
            Box3D::new([0.5, 0.5, 0.5], [0.6, 0.6, 0.6], 0.0),
        ];
        let a = assigner(10, 6, 4);
        let first = a.assign(&points, &sizes, &boxes, &[0, 1]).unwrap();
        let second = a.assign(&points, &sizes, &boxes, &[0, 1]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_positive_targets_encode_assigned_box() {
        let (points, sizes) = pyramid();
        let bbox = Box3D::new([1.0, 1.0, 1.0], [1.9, 1.9, 1.9], 0.0);
        let a = assigner(27, 18, 4);
        let targets = a.assign(&points, &sizes, &[bbox], &[4]).unwrap();
        let coder = BoxCoder::new(8).unwrap();
        for (i, &label) in targets.labels.iter().enumerate() {
            if label == 4 {
                let t = &targets.bbox[i * 8..(i + 1) * 8];
                assert_eq!(t, coder.encode(&bbox, points[i]).as_slice());
                assert!(targets.centerness[i] > 0.0 && targets.centerness[i] <= 1.0);
            }
        }
    }

    #[test]
    fn test_level_count_checked() {
        let (points, sizes) = pyramid();
        assert!(assigner(27, 18, 3).assign(&points, &sizes, &[], &[]).is_err());
    }
}
