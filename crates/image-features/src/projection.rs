//! Point-to-image projection and feature sampling

use candle_core::Tensor;
use voxel_det3d_common::{DetectionError, ImageMeta, Result};

/// Modulated image pyramid of a batch plus what is needed to project into it
#[derive(Debug, Clone)]
pub struct ImageContext {
    pyramid: Vec<Tensor>,
    metas: Vec<ImageMeta>,
    input_shape: [usize; 2],
}

impl ImageContext {
    /// `input_shape` is the padded `(h, w)` of the image batch the pyramid
    /// was computed from.
    pub fn new(pyramid: Vec<Tensor>, metas: Vec<ImageMeta>, input_shape: [usize; 2]) -> Result<Self> {
        if pyramid.is_empty() {
            return Err(DetectionError::shape("image pyramid has no levels"));
        }
        for (i, level) in pyramid.iter().enumerate() {
            let (b, _, _, _) = level.dims4()?;
            if b != metas.len() {
                return Err(DetectionError::shape(format!(
                    "pyramid level {i} holds {b} images but {} metas were given",
                    metas.len()
                )));
            }
        }
        Ok(Self {
            pyramid,
            metas,
            input_shape,
        })
    }

    pub fn pyramid(&self) -> &[Tensor] {
        &self.pyramid
    }

    pub fn metas(&self) -> &[ImageMeta] {
        &self.metas
    }

    pub fn input_shape(&self) -> [usize; 2] {
        self.input_shape
    }

    pub fn batch_size(&self) -> usize {
        self.metas.len()
    }

    pub fn num_levels(&self) -> usize {
        self.pyramid.len()
    }

    /// Channels of one level
    pub fn channels(&self) -> usize {
        self.pyramid[0].dims()[1]
    }

    /// Same features cut from the autograd graph
    pub fn detach(&self) -> Self {
        Self {
            pyramid: self.pyramid.iter().map(Tensor::detach).collect(),
            metas: self.metas.clone(),
            input_shape: self.input_shape,
        }
    }

    /// `(N, C)` features of `level` at the projections of `points` into
    /// image `image`; points behind the camera or outside the valid image
    /// area get zeros.
    pub fn sample(&self, level: usize, image: usize, points: &[[f32; 3]]) -> Result<Tensor> {
        let map = self
            .pyramid
            .get(level)
            .ok_or_else(|| DetectionError::shape(format!("pyramid level {level} missing")))?
            .get(image)?;
        let meta = self
            .metas
            .get(image)
            .ok_or_else(|| DetectionError::shape(format!("no meta for image {image}")))?;
        sample_feature_map(&map, points, meta, self.input_shape)
    }

    /// Features of every level concatenated along channels, `(N, L·C)`
    pub fn sample_all_levels(&self, image: usize, points: &[[f32; 3]]) -> Result<Tensor> {
        let levels = (0..self.pyramid.len())
            .map(|l| self.sample(l, image, points))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&levels, 1)?)
    }
}

/// Nearest-pixel sampling of a `(C, H, W)` map
pub fn sample_feature_map(
    map: &Tensor,
    points: &[[f32; 3]],
    meta: &ImageMeta,
    input_shape: [usize; 2],
) -> Result<Tensor> {
    let (c, h, w) = map.dims3()?;
    let device = map.device();
    let scale_y = h as f32 / input_shape[0].max(1) as f32;
    let scale_x = w as f32 / input_shape[1].max(1) as f32;

    let mut indices = Vec::with_capacity(points.len());
    let mut mask = Vec::with_capacity(points.len());
    for point in points {
        match meta.project(*point).filter(|px| meta.in_bounds(*px)) {
            Some([u, v]) => {
                let col = ((u * scale_x) as usize).min(w - 1);
                let row = ((v * scale_y) as usize).min(h - 1);
                indices.push((row * w + col) as u32);
                mask.push(1f32);
            }
            None => {
                indices.push(0);
                mask.push(0f32);
            }
        }
    }

    let n = points.len();
    let flat = map.reshape((c, h * w))?.t()?.contiguous()?;
    let gathered = flat.index_select(&Tensor::new(indices.as_slice(), device)?, 0)?;
    let mask = Tensor::from_vec(mask, (n, 1), device)?.to_dtype(map.dtype())?;
    Ok(gathered.broadcast_mul(&mask)?)
}

/// Count of points landing inside the image, for logging
pub fn visible_points(points: &[[f32; 3]], meta: &ImageMeta) -> usize {
    points
        .iter()
        .filter(|p| meta.project(**p).is_some_and(|px| meta.in_bounds(px)))
        .count()
}
