//! Image branch feeding the fusion gate inside the sparse backbone

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use voxel_det3d_common::{BackboneConfig, ImageBranchConfig, ImageMeta};
use voxel_det3d_image::{visible_points, ImageBranch, ImageFusionGate};
use voxel_det3d_sparse::{IdentityFusion, MinkResNet, VoxelCollator};

const VOXEL: f32 = 0.1;

fn flat_cloud() -> Tensor {
    let mut data = Vec::new();
    for x in 0..24 {
        for y in 0..24 {
            data.extend([
                (x as f32 + 0.5) * VOXEL,
                (y as f32 + 0.5) * VOXEL,
                0.05,
                200.0,
                100.0,
                50.0,
            ]);
        }
    }
    Tensor::from_vec(data, (24 * 24, 6), &Device::Cpu).unwrap()
}

/// Top-down view covering the left half of the cloud
fn meta() -> ImageMeta {
    ImageMeta::new(
        [32, 32],
        [
            [25.0, 0.0, 0.0, 0.0],
            [0.0, 12.5, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    )
}

#[test]
fn test_gated_backbone_keeps_layout_and_trains_image_branch() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let branch_config = ImageBranchConfig {
        channels: 8,
        ..ImageBranchConfig::default()
    };
    let branch = ImageBranch::new(vb.clone(), &branch_config, false).unwrap();
    let backbone = MinkResNet::new(
        vb.pp("backbone"),
        &BackboneConfig {
            depth: 18,
            max_channels: Some(16),
            pool: false,
            ..BackboneConfig::default()
        },
    )
    .unwrap();
    let gate = ImageFusionGate::new(vb.pp("fusion_gate"), backbone.stem_channels(), 8, 0).unwrap();

    let images = Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu).unwrap();
    let context = branch.forward(&images, &[meta()]).unwrap();

    let x = VoxelCollator::new(VOXEL, Device::Cpu).collate(&[flat_cloud()]).unwrap();
    let points = x.decomposed_points(VOXEL);
    let visible = visible_points(&points[0], &meta());
    assert!(visible > 0 && visible < points[0].len());

    let fused = backbone
        .forward_with_fusion(&x, &gate.bind(&context, VOXEL), true)
        .unwrap();
    let plain = backbone.forward_with_fusion(&x, &IdentityFusion, true).unwrap();
    assert_eq!(fused.len(), plain.len());
    for (f, p) in fused.iter().zip(&plain) {
        assert_eq!(f.coords(), p.coords());
        assert_eq!(f.channels(), p.channels());
    }

    let loss = fused[0].features().sqr().unwrap().sum_all().unwrap();
    let grads = loss.backward().unwrap();
    let data = varmap.data().lock().unwrap();
    assert!(grads.get(data["img_backbone.stem.weight"].as_tensor()).is_some());
    assert!(grads.get(data["fusion_gate.proj.weight"].as_tensor()).is_some());
}

#[test]
fn test_frozen_branch_blocks_gradients() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = ImageBranchConfig {
        channels: 8,
        ..ImageBranchConfig::default()
    };
    let branch = ImageBranch::new(vb, &config, true).unwrap();
    let images = Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu).unwrap();
    let context = branch.forward(&images, &[meta()]).unwrap();

    let loss = context.pyramid()[0].sum_all().unwrap();
    let grads = loss.backward().unwrap();
    let data = varmap.data().lock().unwrap();
    assert!(grads.get(data["img_backbone.stem.weight"].as_tensor()).is_none());
}
