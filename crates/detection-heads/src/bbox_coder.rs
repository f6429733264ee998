//! Point-relative box encoding
//!
//! A box is regressed from a point as the six distances to its faces in the
//! box frame, `(x_min, x_max, y_min, y_max, z_min, z_max)`, followed, for
//! rotated boxes, by `(cos 2θ, sin 2θ)`. Doubling the angle makes the code
//! continuous across the half-turn symmetry of a box.

use voxel_det3d_common::{Box3D, DetectionError, Result};

/// Number of face-distance channels
pub const DISTANCE_CHANNELS: usize = 6;

/// Encoder/decoder for a fixed regression width (6 or 8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxCoder {
    n_reg_outs: usize,
}

impl BoxCoder {
    pub fn new(n_reg_outs: usize) -> Result<Self> {
        match n_reg_outs {
            6 | 8 => Ok(Self { n_reg_outs }),
            other => Err(DetectionError::InvalidConfig(format!(
                "n_reg_outs must be 6 or 8, got {other}"
            ))),
        }
    }

    pub fn n_reg_outs(&self) -> usize {
        self.n_reg_outs
    }

    pub fn with_yaw(&self) -> bool {
        self.n_reg_outs == 8
    }

    /// Regression target of `bbox` seen from `point`
    pub fn encode(&self, bbox: &Box3D, point: [f32; 3]) -> Vec<f32> {
        let mut target = Vec::with_capacity(self.n_reg_outs);
        if self.with_yaw() {
            target.extend(bbox.face_distances(point));
            let (sin, cos) = (2.0 * bbox.normalized_yaw()).sin_cos();
            target.extend([cos, sin]);
        } else {
            let aligned = Box3D { yaw: 0.0, ..*bbox };
            target.extend(aligned.face_distances(point));
        }
        target
    }

    /// Box described by `pred` around `point`
    pub fn decode(&self, point: [f32; 3], pred: &[f32]) -> Box3D {
        let yaw = if self.with_yaw() {
            0.5 * pred[7].atan2(pred[6])
        } else {
            0.0
        };
        let dims = [pred[0] + pred[1], pred[2] + pred[3], pred[4] + pred[5]];
        let offset = [
            (pred[1] - pred[0]) / 2.0,
            (pred[3] - pred[2]) / 2.0,
            (pred[5] - pred[4]) / 2.0,
        ];
        let (sin, cos) = yaw.sin_cos();
        Box3D::new(
            [
                point[0] + cos * offset[0] - sin * offset[1],
                point[1] + sin * offset[0] + cos * offset[1],
                point[2] + offset[2],
            ],
            dims,
            yaw,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_box_close(a: &Box3D, b: &Box3D) {
        for i in 0..3 {
            assert!((a.center[i] - b.center[i]).abs() < 1e-4, "{a:?} vs {b:?}");
            assert!((a.dims[i] - b.dims[i]).abs() < 1e-4, "{a:?} vs {b:?}");
        }
        assert!((a.normalized_yaw() - b.normalized_yaw()).abs() < 1e-4, "{a:?} vs {b:?}");
    }

    #[test]
    fn test_decode_inverts_encode_for_rotated_box() {
        let coder = BoxCoder::new(8).unwrap();
        let bbox = Box3D::new([1.0, -2.0, 0.5], [3.0, 1.0, 1.2], 0.7);
        let point = [1.3, -1.9, 0.2];
        let decoded = coder.decode(point, &coder.encode(&bbox, point));
        assert_box_close(&decoded, &bbox);
    }

    #[test]
    fn test_yaw_half_turn_encodes_identically() {
        let coder = BoxCoder::new(8).unwrap();
        let a = Box3D::new([0.0; 3], [2.0, 1.0, 1.0], 0.3);
        let b = Box3D { yaw: 0.3 + std::f32::consts::PI, ..a };
        let p = [0.2, 0.1, 0.0];
        for (x, y) in coder.encode(&a, p).iter().zip(coder.encode(&b, p)) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_axis_aligned_variant_ignores_yaw() {
        let coder = BoxCoder::new(6).unwrap();
        let bbox = Box3D::new([0.0; 3], [2.0, 4.0, 2.0], 0.0);
        let target = coder.encode(&bbox, [0.5, 0.0, 0.0]);
        assert_eq!(target, vec![1.5, 0.5, 2.0, 2.0, 1.0, 1.0]);
        let decoded = coder.decode([0.5, 0.0, 0.0], &target);
        assert_box_close(&decoded, &bbox);
    }

    #[test]
    fn test_invalid_width_rejected() {
        assert!(BoxCoder::new(7).is_err());
    }
}
