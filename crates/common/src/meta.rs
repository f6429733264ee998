//! Per-image camera metadata

use serde::{Deserialize, Serialize};

/// Minimum camera depth for a point to count as projected
const MIN_DEPTH: f32 = 1e-5;

/// Image size and the lidar-to-pixel projection of one camera view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Valid image size `(h, w)` before batch padding
    pub img_shape: [usize; 2],
    /// Row-major 4x4 homogeneous projection from point-cloud coordinates to pixels
    pub lidar2img: [[f32; 4]; 4],
}

impl ImageMeta {
    #[must_use]
    pub fn new(img_shape: [usize; 2], lidar2img: [[f32; 4]; 4]) -> Self {
        Self {
            img_shape,
            lidar2img,
        }
    }

    /// Pinhole camera looking down +z: `u = f·x/z + cx`, `v = f·y/z + cy`
    #[must_use]
    pub fn pinhole(img_shape: [usize; 2], focal: f32, cx: f32, cy: f32) -> Self {
        Self::new(
            img_shape,
            [
                [focal, 0.0, cx, 0.0],
                [0.0, focal, cy, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        )
    }

    /// Pixel coordinates `(u, v)` of a point, `None` behind the camera
    #[must_use]
    pub fn project(&self, point: [f32; 3]) -> Option<[f32; 2]> {
        let row = |r: usize| {
            let m = &self.lidar2img[r];
            m[0] * point[0] + m[1] * point[1] + m[2] * point[2] + m[3]
        };
        let depth = row(2);
        if depth <= MIN_DEPTH {
            return None;
        }
        Some([row(0) / depth, row(1) / depth])
    }

    /// Whether pixel `(u, v)` falls inside the valid image area
    #[must_use]
    pub fn in_bounds(&self, pixel: [f32; 2]) -> bool {
        let [h, w] = self.img_shape;
        pixel[0] >= 0.0 && pixel[1] >= 0.0 && pixel[0] < w as f32 && pixel[1] < h as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinhole_projection() {
        let meta = ImageMeta::pinhole([48, 64], 10.0, 32.0, 24.0);
        let [u, v] = meta.project([1.0, -0.5, 2.0]).unwrap();
        assert!((u - 37.0).abs() < 1e-5);
        assert!((v - 21.5).abs() < 1e-5);
        assert!(meta.in_bounds([u, v]));
    }

    #[test]
    fn test_points_behind_camera_are_rejected() {
        let meta = ImageMeta::pinhole([48, 64], 10.0, 32.0, 24.0);
        assert!(meta.project([0.0, 0.0, -1.0]).is_none());
        assert!(meta.project([0.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_bounds_use_width_for_u() {
        let meta = ImageMeta::pinhole([10, 20], 1.0, 0.0, 0.0);
        assert!(meta.in_bounds([19.5, 9.5]));
        assert!(!meta.in_bounds([9.5, 19.5]));
        assert!(!meta.in_bounds([-0.1, 0.0]));
    }
}
