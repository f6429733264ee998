//! End-to-end training and inference of the composed detector

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use voxel_det3d_common::{
    BackboneConfig, Box3D, DetectionError, DetectorConfig, FusionGateConfig, HeadConfig,
    ImageBranchConfig, ImageMeta, Stage2Config, TestConfig,
};
use voxel_det3d_detector::{Detector, ImageInputs};

const VOXEL: f32 = 0.1;

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
                    (z * 30) as f32,
                ]);
            }
        }
    }
    Tensor::from_vec(data, (32 * 32 * 8, 6), &Device::Cpu).unwrap()
}

fn clouds() -> Vec<Tensor> {
    vec![grid_cloud(40.0), grid_cloud(220.0)]
}

fn ground_truth() -> (Vec<Vec<Box3D>>, Vec<Vec<usize>>) {
    let bbox = Box3D::new([1.6, 1.6, 0.4], [1.6, 1.6, 0.8], 0.0);
    (vec![vec![bbox], vec![bbox]], vec![vec![1], vec![2]])
}

/// Small two-stage layout over the 32 x 32 x 8 test grid
fn small_config() -> DetectorConfig {
    DetectorConfig {
        voxel_size: VOXEL,
        backbone: BackboneConfig {
            depth: 18,
            max_channels: Some(32),
            pool: false,
            ..BackboneConfig::default()
        },
        head: HeadConfig {
            in_channels: vec![32; 4],
            out_channels: 16,
            n_classes: 3,
            n_select: 32,
            ..HeadConfig::default()
        },
        stage2: Some(Stage2Config {
            hidden_channels: 16,
            n_passes: 2,
            use_image: false,
        }),
        test: TestConfig {
            score_thr: 0.0,
            ensemble_stages: vec![0, 1, 2],
            ..TestConfig::default()
        },
        ..DetectorConfig::single_stage()
    }
}

fn with_images(mut config: DetectorConfig) -> DetectorConfig {
    config.image_branch = Some(ImageBranchConfig {
        channels: 8,
        ..ImageBranchConfig::default()
    });
    config.fusion_gate = Some(FusionGateConfig { image_level: 0 });
    if let Some(stage2) = config.stage2.as_mut() {
        stage2.use_image = true;
    }
    config
}

/// Top-down camera: `u = 20x`, `v = 20y`, unit depth
fn metas() -> Vec<ImageMeta> {
    let meta = ImageMeta::new(
        [64, 64],
        [
            [20.0, 0.0, 0.0, 0.0],
            [0.0, 20.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    );
    vec![meta.clone(), meta]
}

fn images() -> Tensor {
    Tensor::rand(0f32, 1.0, (2, 3, 64, 64), &Device::Cpu).unwrap()
}

fn total_loss(losses: &voxel_det3d_heads::LossMap) -> Tensor {
    let mut total: Option<Tensor> = None;
    for loss in losses.values() {
        total = Some(match total {
            Some(t) => (t + loss).unwrap(),
            None => loss.clone(),
        });
    }
    total.unwrap()
}

fn var(varmap: &VarMap, name: &str) -> Tensor {
    varmap.data().lock().unwrap()[name].as_tensor().clone()
}

#[test]
fn test_forward_train_reports_every_stage() {
    let varmap = VarMap::new();
    let detector = Detector::new(small_config(), &varmap, &Device::Cpu).unwrap();
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, None).unwrap();

    let keys: Vec<&str> = losses.keys().map(String::as_str).collect();
    for key in [
        "loss_cls",
        "loss_centerness",
        "loss_bbox",
        "s2_0_loss_cls",
        "s2_1_loss_bbox",
    ] {
        assert!(keys.contains(&key), "{key} missing from {keys:?}");
    }
    assert_eq!(losses.len(), 9);
    for (name, loss) in &losses {
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value >= 0.0, "{name} = {value}");
    }
}

#[test]
fn test_simple_test_returns_one_result_per_cloud() {
    let varmap = VarMap::new();
    let detector = Detector::new(small_config(), &varmap, &Device::Cpu).unwrap();
    let results = detector.simple_test(&clouds(), None).unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(!result.is_empty());
        assert_eq!(result.boxes.len(), result.scores.len());
        assert!(result.labels.iter().all(|&l| l < 3));
        assert!(result.labels.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[test]
fn test_score_threshold_above_one_yields_nothing() {
    let mut config = small_config();
    config.test.score_thr = 1.1;
    let varmap = VarMap::new();
    let detector = Detector::new(config, &varmap, &Device::Cpu).unwrap();
    let results = detector.simple_test(&clouds(), None).unwrap();
    assert!(results.iter().all(|r| r.is_empty()));
}

#[test]
fn test_single_stage_layout() {
    let config = DetectorConfig {
        stage2: None,
        test: TestConfig {
            ensemble_stages: vec![0],
            ..small_config().test
        },
        ..small_config()
    };
    let varmap = VarMap::new();
    let detector = Detector::new(config, &varmap, &Device::Cpu).unwrap();
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, None).unwrap();
    assert_eq!(losses.len(), 3);
    assert_eq!(detector.simple_test(&clouds(), None).unwrap().len(), 2);
}

#[test]
fn test_batch_mismatches_are_shape_errors() {
    let varmap = VarMap::new();
    let detector = Detector::new(small_config(), &varmap, &Device::Cpu).unwrap();
    let (boxes, labels) = ground_truth();
    let one = vec![grid_cloud(10.0)];
    assert!(matches!(
        detector.forward_train(&one, &boxes, &labels, None),
        Err(DetectionError::Shape(_))
    ));

    let varmap = VarMap::new();
    let detector = Detector::new(with_images(small_config()), &varmap, &Device::Cpu).unwrap();
    assert!(matches!(detector.simple_test(&clouds(), None), Err(DetectionError::Shape(_))));
    let images = images();
    let metas = metas();
    let short = ImageInputs {
        images: &images,
        metas: &metas[..1],
    };
    assert!(matches!(
        detector.simple_test(&clouds(), Some(short)),
        Err(DetectionError::Shape(_))
    ));
}

#[test]
fn test_image_path_end_to_end() {
    let varmap = VarMap::new();
    let detector = Detector::new(with_images(small_config()), &varmap, &Device::Cpu).unwrap();
    let images = images();
    let metas = metas();
    let inputs = ImageInputs {
        images: &images,
        metas: &metas,
    };
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, Some(inputs)).unwrap();
    assert_eq!(losses.len(), 9);

    let grads = total_loss(&losses).backward().unwrap();
    assert!(grads.get(&var(&varmap, "fusion_gate.gate.weight")).is_some());
    assert!(grads.get(&var(&varmap, "stage2.img_proj.weight")).is_some());
    assert!(grads.get(&var(&varmap, "img_backbone.stem.weight")).is_some());

    let results = detector.simple_test(&clouds(), Some(inputs)).unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn test_freeze_stage1_stops_backbone_and_head_gradients() {
    let mut config = small_config();
    config.freeze_stage1 = true;
    let varmap = VarMap::new();
    let detector = Detector::new(config, &varmap, &Device::Cpu).unwrap();
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, None).unwrap();
    let grads = total_loss(&losses).backward().unwrap();

    assert!(grads.get(&var(&varmap, "backbone.conv1.kernel")).is_none());
    assert!(grads.get(&var(&varmap, "head.cls.weight")).is_none());
    assert!(grads.get(&var(&varmap, "stage2.blocks.0.cls.weight")).is_some());
}

#[test]
fn test_unfrozen_backbone_receives_gradients() {
    let varmap = VarMap::new();
    let detector = Detector::new(small_config(), &varmap, &Device::Cpu).unwrap();
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, None).unwrap();
    let grads = total_loss(&losses).backward().unwrap();
    assert!(grads.get(&var(&varmap, "backbone.conv1.kernel")).is_some());
    assert!(grads.get(&var(&varmap, "head.cls.weight")).is_some());
}

#[test]
fn test_freeze_img_branch_keeps_gate_trainable() {
    let mut config = with_images(small_config());
    config.freeze_img_branch = true;
    let varmap = VarMap::new();
    let detector = Detector::new(config, &varmap, &Device::Cpu).unwrap();
    let images = images();
    let metas = metas();
    let inputs = ImageInputs {
        images: &images,
        metas: &metas,
    };
    let (boxes, labels) = ground_truth();
    let losses = detector.forward_train(&clouds(), &boxes, &labels, Some(inputs)).unwrap();
    let grads = total_loss(&losses).backward().unwrap();

    assert!(grads.get(&var(&varmap, "img_backbone.stem.weight")).is_none());
    assert!(grads.get(&var(&varmap, "fusion_gate.gate.weight")).is_some());
}

#[test]
fn test_parameter_names_are_stable() {
    let a = VarMap::new();
    let b = VarMap::new();
    Detector::new(with_images(small_config()), &a, &Device::Cpu).unwrap();
    Detector::new(with_images(small_config()), &b, &Device::Cpu).unwrap();
    let mut ka: Vec<String> = a.data().lock().unwrap().keys().cloned().collect();
    let mut kb: Vec<String> = b.data().lock().unwrap().keys().cloned().collect();
    ka.sort();
    kb.sort();
    assert_eq!(ka, kb);
}
