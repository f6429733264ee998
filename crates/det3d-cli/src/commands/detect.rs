//! `detect`: run the detector on point files and print JSON results

use crate::points::load_points;
use anyhow::{bail, Context as _, Result};
use candle_core::Device;
use candle_nn::VarMap;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use voxel_det3d_common::{BBoxResult, DetectorConfig};
use voxel_det3d_detector::{import_external_weights, Detector, KeyRemapTable};

#[derive(Args)]
pub struct DetectCommand {
    /// Detector configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Trained weights (safetensors); parameters are randomly initialised otherwise
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Key remap preset applied to the weights
    #[arg(long, default_value = "identity")]
    remap: String,

    /// Override the score threshold of the configuration
    #[arg(long)]
    score_thr: Option<f32>,

    /// Point files, one cloud each (`x y z` + features per line)
    #[arg(value_name = "POINTS", required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Serialize)]
struct FileDetections<'a> {
    file: String,
    #[serde(flatten)]
    result: &'a BBoxResult,
}

impl DetectCommand {
    pub fn execute(self) -> Result<()> {
        let mut config = DetectorConfig::from_yaml_file(&self.config)
            .with_context(|| format!("Invalid configuration {}", self.config.display()))?;
        if let Some(score_thr) = self.score_thr {
            config.test.score_thr = score_thr;
        }
        if config.image_branch.is_some() {
            bail!("configurations with an image branch need camera inputs, which this command does not take");
        }

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let detector = Detector::new(config, &varmap, &device).context("Failed to build detector")?;

        if let Some(weights) = &self.weights {
            let table = KeyRemapTable::preset(&self.remap)?;
            let report = import_external_weights(&varmap, weights, &table)
                .with_context(|| format!("Failed to load weights {}", weights.display()))?;
            if !report.missing.is_empty() {
                tracing::warn!("{} detector parameters not found in checkpoint", report.missing.len());
            }
        }

        let clouds = self
            .inputs
            .iter()
            .map(|path| {
                load_points(path, &device).with_context(|| format!("Failed to read {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let start = Instant::now();
        let results = detector.simple_test(&clouds, None)?;
        info!(
            "Detected {} boxes in {} clouds ({:.2}s)",
            results.iter().map(BBoxResult::len).sum::<usize>(),
            results.len(),
            start.elapsed().as_secs_f64()
        );

        let output: Vec<FileDetections<'_>> = self
            .inputs
            .iter()
            .zip(&results)
            .map(|(path, result)| FileDetections {
                file: path.display().to_string(),
                result,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialize detections")?
        );
        Ok(())
    }
}
