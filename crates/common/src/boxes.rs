//! Oriented 3D boxes and per-image detection results

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};

/// Gravity-centred 3D box rotated about the z axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3D {
    /// Centre (x, y, z)
    pub center: [f32; 3],
    /// Size along the box axes (dx, dy, dz)
    pub dims: [f32; 3],
    /// Rotation about z in radians
    pub yaw: f32,
}

impl Box3D {
    #[must_use]
    pub fn new(center: [f32; 3], dims: [f32; 3], yaw: f32) -> Self {
        Self { center, dims, yaw }
    }

    /// Build from the 7-float layout `(x, y, z, dx, dy, dz, yaw)`
    #[must_use]
    pub fn from_array(values: [f32; 7]) -> Self {
        Self {
            center: [values[0], values[1], values[2]],
            dims: [values[3], values[4], values[5]],
            yaw: values[6],
        }
    }

    #[must_use]
    pub fn to_array(&self) -> [f32; 7] {
        [
            self.center[0],
            self.center[1],
            self.center[2],
            self.dims[0],
            self.dims[1],
            self.dims[2],
            self.yaw,
        ]
    }

    #[must_use]
    #[inline]
    pub fn volume(&self) -> f32 {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Yaw folded into (-π/2, π/2]; a box is symmetric under a half turn
    #[must_use]
    pub fn normalized_yaw(&self) -> f32 {
        let mut yaw = self.yaw.rem_euclid(PI);
        if yaw > FRAC_PI_2 {
            yaw -= PI;
        }
        yaw
    }

    /// Point expressed in the box frame, relative to the centre
    #[must_use]
    pub fn to_local(&self, point: [f32; 3]) -> [f32; 3] {
        let (sin, cos) = self.normalized_yaw().sin_cos();
        let dx = point[0] - self.center[0];
        let dy = point[1] - self.center[1];
        [
            cos * dx + sin * dy,
            -sin * dx + cos * dy,
            point[2] - self.center[2],
        ]
    }

    /// Distances from a point to the six faces in the box frame:
    /// `(x_min, x_max, y_min, y_max, z_min, z_max)`. All are positive iff
    /// the point lies strictly inside.
    #[must_use]
    pub fn face_distances(&self, point: [f32; 3]) -> [f32; 6] {
        let local = self.to_local(point);
        let half = [self.dims[0] / 2.0, self.dims[1] / 2.0, self.dims[2] / 2.0];
        [
            local[0] + half[0],
            half[0] - local[0],
            local[1] + half[1],
            half[1] - local[1],
            local[2] + half[2],
            half[2] - local[2],
        ]
    }

    #[must_use]
    pub fn contains(&self, point: [f32; 3]) -> bool {
        min_distance(&self.face_distances(point)) > 0.0
    }

    /// Euclidean distance from the box centre
    #[must_use]
    pub fn center_distance(&self, point: [f32; 3]) -> f32 {
        let d: f32 = (0..3).map(|i| (point[i] - self.center[i]).powi(2)).sum();
        d.sqrt()
    }

    /// Bird's-eye-view corners, counter-clockwise
    #[must_use]
    pub fn bev_corners(&self) -> [[f32; 2]; 4] {
        let (sin, cos) = self.yaw.sin_cos();
        let hx = self.dims[0] / 2.0;
        let hy = self.dims[1] / 2.0;
        let local = [[-hx, -hy], [hx, -hy], [hx, hy], [-hx, hy]];
        local.map(|[x, y]| {
            [
                self.center[0] + cos * x - sin * y,
                self.center[1] + sin * x + cos * y,
            ]
        })
    }

    /// Rotated intersection-over-union of the bird's-eye-view footprints
    #[must_use]
    pub fn bev_iou(&self, other: &Box3D) -> f32 {
        let area_a = self.dims[0] * self.dims[1];
        let area_b = other.dims[0] * other.dims[1];
        if area_a <= 0.0 || area_b <= 0.0 {
            return 0.0;
        }
        let clipped = clip_polygon(&self.bev_corners(), &other.bev_corners());
        let inter = polygon_area(&clipped);
        let union = area_a + area_b - inter;
        if union > 0.0 {
            (inter / union).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Smallest of the six face distances
#[must_use]
pub fn min_distance(distances: &[f32; 6]) -> f32 {
    distances.iter().copied().fold(f32::INFINITY, f32::min)
}

/// Centerness `sqrt(Π_axis min/max)` of face distances; zero outside the box
#[must_use]
pub fn centerness(distances: &[f32; 6]) -> f32 {
    if min_distance(distances) <= 0.0 {
        return 0.0;
    }
    let ratio: f32 = distances
        .chunks_exact(2)
        .map(|pair| pair[0].min(pair[1]) / pair[0].max(pair[1]))
        .product();
    ratio.sqrt()
}

fn cross(o: [f32; 2], a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

// Sutherland-Hodgman; the clip polygon must be convex and counter-clockwise.
fn clip_polygon(subject: &[[f32; 2]], clip: &[[f32; 2]; 4]) -> Vec<[f32; 2]> {
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let cur = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let cur_in = cross(a, b, cur) >= 0.0;
            let prev_in = cross(a, b, prev) >= 0.0;
            if cur_in {
                if !prev_in {
                    output.extend(segment_intersection(prev, cur, a, b));
                }
                output.push(cur);
            } else if prev_in {
                output.extend(segment_intersection(prev, cur, a, b));
            }
        }
    }
    output
}

fn segment_intersection(p: [f32; 2], q: [f32; 2], a: [f32; 2], b: [f32; 2]) -> Option<[f32; 2]> {
    let r = [q[0] - p[0], q[1] - p[1]];
    let s = [b[0] - a[0], b[1] - a[1]];
    let denom = r[0] * s[1] - r[1] * s[0];
    if denom.abs() < f32::EPSILON {
        return None;
    }
    let t = ((a[0] - p[0]) * s[1] - (a[1] - p[1]) * s[0]) / denom;
    Some([p[0] + t * r[0], p[1] + t * r[1]])
}

fn polygon_area(points: &[[f32; 2]]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f32 = (0..points.len())
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % points.len()];
            a[0] * b[1] - a[1] * b[0]
        })
        .sum();
    twice.abs() / 2.0
}

/// Detections for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BBoxResult {
    pub boxes: Vec<Box3D>,
    pub scores: Vec<f32>,
    pub labels: Vec<usize>,
}

impl BBoxResult {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn push(&mut self, bbox: Box3D, score: f32, label: usize) {
        self.boxes.push(bbox);
        self.scores.push(score);
        self.labels.push(label);
    }
}
