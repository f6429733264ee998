//! `check-config`: parse, validate and summarise a configuration

use anyhow::{Context as _, Result};
use candle_core::Device;
use candle_nn::VarMap;
use clap::Args;
use std::path::PathBuf;
use tracing::info;
use voxel_det3d_common::DetectorConfig;
use voxel_det3d_detector::Detector;

#[derive(Args)]
pub struct CheckConfigCommand {
    /// Detector configuration (YAML)
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Also build the detector and count its parameters
    #[arg(long, default_value = "false")]
    build: bool,
}

impl CheckConfigCommand {
    pub fn execute(self) -> Result<()> {
        let config = DetectorConfig::from_yaml_file(&self.config)
            .with_context(|| format!("Invalid configuration {}", self.config.display()))?;
        info!("Configuration {} is valid", self.config.display());

        println!("voxel size:        {}", config.voxel_size);
        println!(
            "backbone:          MinkResNet-{} ({} stages, {} norm, channels {:?})",
            config.backbone.depth,
            config.backbone.num_stages,
            config.backbone.norm,
            config.backbone.stage_channels()?
        );
        println!(
            "stage 1:           {} classes, {} regression outputs, {} selected points",
            config.head.n_classes, config.head.n_reg_outs, config.head.n_select
        );
        match &config.stage2 {
            Some(s2) => println!(
                "stage 2:           {} pass(es), {} hidden channels, image features {}",
                s2.n_passes,
                s2.hidden_channels,
                if s2.use_image { "on" } else { "off" }
            ),
            None => println!("stage 2:           off"),
        }
        println!(
            "image branch:      {}",
            config
                .image_branch
                .as_ref()
                .map_or("off".to_string(), |b| format!("{} channels", b.channels))
        );
        println!(
            "fusion gate:       {}",
            config
                .fusion_gate
                .as_ref()
                .map_or("off".to_string(), |g| format!("image level {}", g.image_level))
        );
        println!(
            "frozen:            image branch {}, stage 1 {}",
            config.freeze_img_branch, config.freeze_stage1
        );
        println!(
            "test:              ensemble stages {:?}, iou_thr {}, score_thr {}, nms_pre {}",
            config.test.ensemble_stages, config.test.iou_thr, config.test.score_thr, config.test.nms_pre
        );

        if self.build {
            let varmap = VarMap::new();
            Detector::new(config, &varmap, &Device::Cpu).context("Failed to build detector")?;
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter registry lock poisoned"))?;
            let count: usize = data.values().map(|v| v.elem_count()).sum();
            println!("parameters:        {} tensors, {} values", data.len(), count);
        }
        Ok(())
    }
}
