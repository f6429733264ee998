//! Two-stage sparse voxel 3D detector
//!
//! [`Detector`] wires the sparse backbone, the optional image branch and
//! fusion gate, and both detection heads according to a
//! [`DetectorConfig`](voxel_det3d_common::DetectorConfig). Training returns a
//! [`LossMap`](voxel_det3d_heads::LossMap); inference returns one
//! [`BBoxResult`](voxel_det3d_common::BBoxResult) per point cloud.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use candle_nn::VarMap;
//! use voxel_det3d_common::DetectorConfig;
//! use voxel_det3d_detector::Detector;
//!
//! # fn main() -> voxel_det3d_common::Result<()> {
//! let varmap = VarMap::new();
//! let detector = Detector::new(DetectorConfig::two_stage(), &varmap, &Device::Cpu)?;
//! let cloud = Tensor::zeros((1024, 6), candle_core::DType::F32, &Device::Cpu)?;
//! let results = detector.simple_test(&[cloud], None)?;
//! println!("{} boxes", results[0].len());
//! # Ok(())
//! # }
//! ```

pub mod ensemble;
pub mod pipeline;
pub mod targets;
pub mod weights;

pub use ensemble::Ensembler;
pub use pipeline::{Detector, ImageInputs};
pub use targets::remap_targets;
pub use weights::{import_external_weights, ImportReport, KeyAction, KeyRemapTable, RemapRule};
