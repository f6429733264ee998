//! `remap-keys`: preview checkpoint key rewriting

use anyhow::{Context as _, Result};
use candle_core::Device;
use clap::Args;
use std::path::PathBuf;
use voxel_det3d_detector::{KeyAction, KeyRemapTable};

#[derive(Args)]
pub struct RemapKeysCommand {
    /// Remap preset (identity, image_detector_transfer, image_encoder_transfer)
    #[arg(short, long)]
    preset: String,

    /// Checkpoint (safetensors)
    #[arg(value_name = "CHECKPOINT")]
    checkpoint: PathBuf,

    /// Only print keys that change
    #[arg(long, default_value = "false")]
    changed_only: bool,
}

impl RemapKeysCommand {
    pub fn execute(self) -> Result<()> {
        let table = KeyRemapTable::preset(&self.preset)?;
        let tensors = candle_core::safetensors::load(&self.checkpoint, &Device::Cpu)
            .with_context(|| format!("Failed to read {}", self.checkpoint.display()))?;

        let plan = table.plan(tensors.keys().map(String::as_str));
        let (mut renamed, mut dropped) = (0, 0);
        for (key, action) in &plan {
            match action {
                KeyAction::Rename(to) => {
                    renamed += 1;
                    println!("{key} -> {to}");
                }
                KeyAction::Drop => {
                    dropped += 1;
                    println!("{key} (dropped)");
                }
                KeyAction::Keep if !self.changed_only => println!("{key}"),
                KeyAction::Keep => {}
            }
        }
        println!(
            "{} keys: {} renamed, {} dropped, {} kept",
            plan.len(),
            renamed,
            dropped,
            plan.len() - renamed - dropped
        );
        Ok(())
    }
}
