//! Detection heads of the voxel detector
//!
//! - [`TopkLimitAssigner`] picks, per ground-truth box, one pyramid level and
//!   a bounded set of positive points on it
//! - [`Stage1Head`] predicts on every voxel, computes the stage-1 losses and
//!   selects the points refined by stage 2
//! - [`Stage2Head`] refines the selected points in one or more passes
//! - [`class_wise_nms`] turns merged [`Candidates`] into per-image results

pub mod assigner;
pub mod bbox_coder;
pub mod losses;
pub mod nms;
pub mod stage1;
pub mod stage2;

pub use assigner::{AssignedTargets, ImageTargets, TopkLimitAssigner};
pub use bbox_coder::{BoxCoder, DISTANCE_CHANNELS};
pub use losses::{DetectionLoss, FlatPredictions, FlatTargets, LossMap};
pub use nms::{class_wise_nms, Candidates};
pub use stage1::{points_tensor, rank_descending, SelectedPoints, Stage1Head, Stage1Output};
pub use stage2::{Stage2Head, Stage2Output, Stage2Targets};
