//! Candidate hypotheses and class-wise rotated NMS

use tracing::debug;
use voxel_det3d_common::{BBoxResult, Box3D, DetectionError, Result};

/// Decoded boxes with a full per-class score row each
#[derive(Debug, Clone, PartialEq)]
pub struct Candidates {
    pub boxes: Vec<Box3D>,
    /// Row-major `(len, n_classes)`
    pub scores: Vec<f32>,
    pub n_classes: usize,
}

impl Candidates {
    pub fn new(n_classes: usize) -> Self {
        Self {
            boxes: Vec::new(),
            scores: Vec::new(),
            n_classes,
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn push(&mut self, bbox: Box3D, scores: &[f32]) -> Result<()> {
        if scores.len() != self.n_classes {
            return Err(DetectionError::shape(format!(
                "score row of {} classes, expected {}",
                scores.len(),
                self.n_classes
            )));
        }
        self.boxes.push(bbox);
        self.scores.extend_from_slice(scores);
        Ok(())
    }

    /// Append every hypothesis of `other`
    pub fn extend(&mut self, other: &Candidates) -> Result<()> {
        if other.n_classes != self.n_classes {
            return Err(DetectionError::shape(format!(
                "cannot merge candidates of {} and {} classes",
                self.n_classes, other.n_classes
            )));
        }
        self.boxes.extend_from_slice(&other.boxes);
        self.scores.extend_from_slice(&other.scores);
        Ok(())
    }

    pub fn score(&self, index: usize, class: usize) -> f32 {
        self.scores[index * self.n_classes + class]
    }
}

/// Greedy NMS run independently for every class.
///
/// Per class, boxes scoring above `score_thr` are visited by score
/// descending (index ascending on ties); a box is dropped when its BEV IoU
/// with an already kept box exceeds `iou_thr`. Output is grouped by class,
/// ascending, and by score inside a class.
pub fn class_wise_nms(candidates: &Candidates, score_thr: f32, iou_thr: f32) -> BBoxResult {
    let mut result = BBoxResult::empty();
    for class in 0..candidates.n_classes {
        let mut order: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates.score(i, class) > score_thr)
            .collect();
        order.sort_by(|&a, &b| {
            candidates
                .score(b, class)
                .partial_cmp(&candidates.score(a, class))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let mut keep: Vec<usize> = Vec::with_capacity(order.len());
        for i in order {
            let suppressed = keep
                .iter()
                .any(|&k| candidates.boxes[k].bev_iou(&candidates.boxes[i]) > iou_thr);
            if !suppressed {
                keep.push(i);
            }
        }
        for i in keep {
            result.push(candidates.boxes[i], candidates.score(i, class), class);
        }
    }
    debug!(
        "NMS kept {} of {} candidates",
        result.len(),
        candidates.len()
    );
    result
}
