//! voxel-det3d CLI
//!
//! Validate detector configurations, run inference on point files and
//! preview checkpoint key remapping.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;
mod points;

use commands::check_config::CheckConfigCommand;
use commands::detect::DetectCommand;
use commands::remap_keys::RemapKeysCommand;

#[derive(Parser)]
#[command(
    name = "voxel-det3d",
    version,
    about = "Two-stage sparse voxel 3D object detection",
    after_help = "EXAMPLES:\n  \
                  # Validate a configuration\n  \
                  voxel-det3d check-config configs/two_stage.yaml\n\n  \
                  # Detect objects in point files (x y z r g b per line)\n  \
                  voxel-det3d detect --config configs/two_stage.yaml --weights model.safetensors scene0.txt scene1.txt\n\n  \
                  # Show how an image detector checkpoint would be renamed\n  \
                  voxel-det3d remap-keys --preset image_detector_transfer image_detector.safetensors"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a YAML configuration, then print a summary
    CheckConfig(CheckConfigCommand),

    /// Run inference on whitespace-separated point files, print JSON
    Detect(DetectCommand),

    /// Show how a checkpoint's keys would be rewritten or dropped
    RemapKeys(RemapKeysCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Detection prints JSON on stdout; keep logs quiet unless asked
    let log_level = match (&cli.command, cli.verbose) {
        (_, true) => Level::DEBUG,
        (Commands::Detect(_), false) => Level::WARN,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::CheckConfig(cmd) => cmd.execute(),
        Commands::Detect(cmd) => cmd.execute(),
        Commands::RemapKeys(cmd) => cmd.execute(),
    }
}
