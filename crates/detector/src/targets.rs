//! Stage-1 targets reordered for stage 2

use candle_core::Tensor;
use voxel_det3d_common::{DetectionError, Result};
use voxel_det3d_heads::{ImageTargets, Stage2Targets};

/// Gather every image's targets at its selected rows, in selection order,
/// and stack them to `(B, N)`, `(B, N, R)` and `(B, N)`.
pub fn remap_targets(targets: &[ImageTargets], sort_inds: &[Vec<u32>]) -> Result<Stage2Targets> {
    if targets.len() != sort_inds.len() {
        return Err(DetectionError::shape(format!(
            "{} target sets for {} selections",
            targets.len(),
            sort_inds.len()
        )));
    }
    if targets.is_empty() {
        return Err(DetectionError::shape("no images to remap"));
    }
    let n = sort_inds[0].len();

    let mut centerness = Vec::with_capacity(targets.len());
    let mut bbox = Vec::with_capacity(targets.len());
    let mut labels = Vec::with_capacity(targets.len());
    for (b, (target, inds)) in targets.iter().zip(sort_inds).enumerate() {
        let rows = target.labels.dim(0)?;
        if inds.len() != n {
            return Err(DetectionError::shape(format!(
                "image {b} selects {} points, image 0 selects {n}",
                inds.len()
            )));
        }
        if let Some(&bad) = inds.iter().find(|&&i| i as usize >= rows) {
            return Err(DetectionError::shape(format!(
                "image {b}: index {bad} out of range for {rows} targets"
            )));
        }
        let index = Tensor::new(inds.as_slice(), target.labels.device())?;
        centerness.push(target.centerness.index_select(&index, 0)?);
        bbox.push(target.bbox.index_select(&index, 0)?);
        labels.push(target.labels.index_select(&index, 0)?);
    }

    Ok(Stage2Targets {
        centerness: Tensor::stack(&centerness, 0)?,
        bbox: Tensor::stack(&bbox, 0)?,
        labels: Tensor::stack(&labels, 0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use voxel_det3d_heads::AssignedTargets;

    fn image(offset: f32) -> ImageTargets {
        AssignedTargets {
            centerness: vec![offset, offset + 0.1, offset + 0.2, offset + 0.3],
            bbox: (0..4 * 6).map(|i| offset + i as f32).collect(),
            labels: vec![-1, 0, 1, 2],
            n_reg_outs: 6,
        }
        .to_tensors(&Device::Cpu)
        .unwrap()
    }

    #[test]
    fn test_rows_follow_selection_order() {
        let targets = [image(0.0), image(10.0)];
        let remapped = remap_targets(&targets, &[vec![3, 0, 2], vec![1, 1, 0]]).unwrap();

        assert_eq!(remapped.centerness.dims(), &[2, 3]);
        assert_eq!(remapped.bbox.dims(), &[2, 3, 6]);
        assert_eq!(
            remapped.labels.to_vec2::<i64>().unwrap(),
            vec![vec![2, -1, 1], vec![0, 0, -1]]
        );
        let ctr = remapped.centerness.to_vec2::<f32>().unwrap();
        assert!((ctr[0][0] - 0.3).abs() < 1e-6);
        assert!((ctr[1][2] - 10.0).abs() < 1e-6);
        let bbox = remapped.bbox.to_vec3::<f32>().unwrap();
        assert_eq!(bbox[0][0][0], 18.0);
        assert_eq!(bbox[1][0][5], 21.0);
    }

    #[test]
    fn test_mismatches_are_shape_errors() {
        let targets = [image(0.0), image(1.0)];
        assert!(matches!(
            remap_targets(&targets, &[vec![0]]),
            Err(DetectionError::Shape(_))
        ));
        assert!(matches!(
            remap_targets(&targets, &[vec![0], vec![4]]),
            Err(DetectionError::Shape(_))
        ));
        assert!(matches!(
            remap_targets(&targets, &[vec![0], vec![0, 1]]),
            Err(DetectionError::Shape(_))
        ));
    }
}
