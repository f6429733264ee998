//! Test-time merging of stage-1 and stage-2 hypotheses

use tracing::debug;
use voxel_det3d_common::{BBoxResult, DetectionError, Result, TestConfig};
use voxel_det3d_heads::{class_wise_nms, Candidates};

/// Merges the hypotheses of the configured stages and runs class-wise NMS.
///
/// Stage 0 is stage 1; stage `k + 1` is stage-2 pass `k`.
#[derive(Debug, Clone)]
pub struct Ensembler {
    stages: Vec<usize>,
    n_stages: usize,
    score_thr: f32,
    iou_thr: f32,
}

impl Ensembler {
    pub fn new(test: &TestConfig, n_stages: usize) -> Result<Self> {
        if test.ensemble_stages.is_empty() {
            return Err(DetectionError::InvalidConfig(
                "ensemble_stages must not be empty".to_string(),
            ));
        }
        if let Some(bad) = test.ensemble_stages.iter().find(|&&s| s >= n_stages) {
            return Err(DetectionError::InvalidConfig(format!(
                "ensemble stage {bad} does not exist ({n_stages} stage(s) configured)"
            )));
        }
        Ok(Self {
            stages: test.ensemble_stages.clone(),
            n_stages,
            score_thr: test.score_thr,
            iou_thr: test.iou_thr,
        })
    }

    pub fn stages(&self) -> &[usize] {
        &self.stages
    }

    /// Whether stage `s` contributes to the output
    pub fn uses(&self, s: usize) -> bool {
        self.stages.contains(&s)
    }

    /// `per_stage[s][b]` holds the candidates of stage `s` for image `b`;
    /// stages not listed may be left empty.
    pub fn ensemble(&self, per_stage: &[Vec<Candidates>]) -> Result<Vec<BBoxResult>> {
        if per_stage.len() != self.n_stages {
            return Err(DetectionError::shape(format!(
                "{} stage outputs, {} expected",
                per_stage.len(),
                self.n_stages
            )));
        }
        let batch = per_stage[self.stages[0]].len();
        if let Some(&s) = self.stages.iter().find(|&&s| per_stage[s].len() != batch) {
            return Err(DetectionError::shape(format!(
                "stage {s} has {} images, stage {} has {batch}",
                per_stage[s].len(),
                self.stages[0]
            )));
        }

        (0..batch)
            .map(|b| -> Result<BBoxResult> {
                let first = &per_stage[self.stages[0]][b];
                let mut merged = Candidates::new(first.n_classes);
                for &s in &self.stages {
                    merged.extend(&per_stage[s][b])?;
                }
                debug!("Image {}: {} merged candidates", b, merged.len());
                Ok(class_wise_nms(&merged, self.score_thr, self.iou_thr))
            })
            .collect()
    }
}
