//! Stage-1 and stage-2 heads on real backbone output

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use voxel_det3d_common::{BackboneConfig, Box3D, HeadConfig, Stage2Config, TestConfig};
use voxel_det3d_heads::{class_wise_nms, Stage1Head, Stage2Head, Stage2Targets};
use voxel_det3d_sparse::{MinkResNet, SparseVoxelTensor, VoxelCollator};

const VOXEL: f32 = 0.1;

/// Coloured points at the voxel centres of a 32 x 32 x 8 block
fn grid_cloud(shade: f32) -> Tensor {
    let mut data = Vec::new();
    for x in 0..32 {
        for y in 0..32 {
            for z in 0..8 {
                data.extend([
                    (x as f32 + 0.5) * VOXEL,
                    (y as f32 + 0.5) * VOXEL,
                    (z as f32 + 0.5) * VOXEL,
                    shade,
                    (x * 8) as f32,
                    (y * 8) as f32,
                ]);
            }
        }
    }
    Tensor::from_vec(data, (32 * 32 * 8, 6), &Device::Cpu).unwrap()
}

fn backbone_levels(varmap: &VarMap) -> Vec<SparseVoxelTensor> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    let config = BackboneConfig {
        depth: 18,
        max_channels: Some(32),
        pool: false,
        ..BackboneConfig::default()
    };
    let backbone = MinkResNet::new(vb.pp("backbone"), &config).unwrap();
    let collator = VoxelCollator::new(VOXEL, Device::Cpu);
    let x = collator.collate(&[grid_cloud(50.0), grid_cloud(200.0)]).unwrap();
    backbone.forward_t(&x, true).unwrap()
}

fn head_config() -> HeadConfig {
    HeadConfig {
        in_channels: vec![32; 4],
        out_channels: 16,
        n_classes: 3,
        n_select: 32,
        ..HeadConfig::default()
    }
}

#[test]
fn test_stage1_losses_and_selection() {
    let varmap = VarMap::new();
    let levels = backbone_levels(&varmap);
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let head = Stage1Head::new(vb.pp("head"), &head_config()).unwrap();
    let out = head.forward(&levels, VOXEL).unwrap();

    assert_eq!(out.batch_size(), 2);
    assert_eq!(out.level_sizes[0].len(), 4);
    let total: usize = out.level_sizes[0].iter().sum();
    assert_eq!(out.points[0].len(), total);
    assert_eq!(out.cls[0].dims(), &[total, 3]);

    let gt_boxes = vec![
        vec![Box3D::new([1.6, 1.6, 0.4], [1.6, 1.6, 0.8], 0.0)],
        Vec::new(),
    ];
    let gt_labels = vec![vec![2], Vec::new()];
    let (losses, targets) = head.loss(&out, &gt_boxes, &gt_labels).unwrap();
    assert_eq!(
        losses.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["loss_bbox", "loss_centerness", "loss_cls"]
    );
    for (name, loss) in &losses {
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value >= 0.0, "{name} = {value}");
    }
    let positives = targets[0]
        .labels
        .to_vec1::<i64>()
        .unwrap()
        .into_iter()
        .filter(|&l| l == 2)
        .count();
    assert!(positives > 0);
    assert!(targets[1].labels.to_vec1::<i64>().unwrap().iter().all(|&l| l == -1));

    let selected = head.select_points(&out).unwrap();
    assert_eq!(selected.points.dims(), &[2, 32, 3]);
    assert_eq!(selected.features.dims(), &[2, 32, 16]);
    let scores = head.selection_scores(&out, 0).unwrap();
    let picked: Vec<f32> = selected.sort_inds[0].iter().map(|&i| scores[i as usize]).collect();
    assert!(picked.windows(2).all(|w| w[0] >= w[1]));
    let best = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    assert_eq!(picked[0], best);
}

#[test]
fn test_selection_larger_than_cloud_is_rejected() {
    let varmap = VarMap::new();
    let levels = backbone_levels(&varmap);
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = HeadConfig {
        n_select: 100_000,
        ..head_config()
    };
    let head = Stage1Head::new(vb.pp("head"), &config).unwrap();
    let out = head.forward(&levels, VOXEL).unwrap();
    assert!(matches!(
        head.select_points(&out),
        Err(voxel_det3d_common::DetectionError::InsufficientPoints { image: 0, .. })
    ));
}

#[test]
fn test_stage2_refines_selected_points() {
    let varmap = VarMap::new();
    let levels = backbone_levels(&varmap);
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let head = Stage1Head::new(vb.pp("head"), &head_config()).unwrap();
    let stage2 = Stage2Head::new(vb.pp("stage2"), &Stage2Config::default(), &head_config(), None).unwrap();

    let out = head.forward(&levels, VOXEL).unwrap();
    let gt_boxes = vec![vec![Box3D::new([1.6, 1.6, 0.4], [1.6, 1.6, 0.8], 0.0)]; 2];
    let gt_labels = vec![vec![0]; 2];
    let (_, targets) = head.loss(&out, &gt_boxes, &gt_labels).unwrap();
    let selected = head.select_points(&out).unwrap();

    let gather = |b: usize| {
        let index = Tensor::new(selected.sort_inds[b].as_slice(), &Device::Cpu).unwrap();
        (
            targets[b].centerness.index_select(&index, 0).unwrap(),
            targets[b].bbox.index_select(&index, 0).unwrap(),
            targets[b].labels.index_select(&index, 0).unwrap(),
        )
    };
    let (c0, b0, l0) = gather(0);
    let (c1, b1, l1) = gather(1);
    let s2_targets = Stage2Targets {
        centerness: Tensor::stack(&[c0, c1], 0).unwrap(),
        bbox: Tensor::stack(&[b0, b1], 0).unwrap(),
        labels: Tensor::stack(&[l0, l1], 0).unwrap(),
    };

    let s2 = stage2.forward(&selected, None).unwrap();
    let losses = stage2.loss(&s2, &s2_targets).unwrap();
    assert_eq!(losses.len(), 3);
    assert!(losses.contains_key("s2_0_loss_cls"));

    let test = TestConfig {
        score_thr: 0.0,
        ..TestConfig::default()
    };
    let mut merged = head.candidates(&out, test.nms_pre).unwrap();
    for (image, extra) in stage2.candidates(&s2, 0, &selected).unwrap().iter().enumerate() {
        merged[image].extend(extra).unwrap();
    }
    let results: Vec<_> = merged
        .iter()
        .map(|c| class_wise_nms(c, test.score_thr, test.iou_thr))
        .collect();
    assert_eq!(results.len(), 2);
    assert!(!results[0].is_empty());
    assert!(results[0].labels.windows(2).all(|w| w[0] <= w[1]));
}
