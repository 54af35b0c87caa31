use crate::error::TrackingError;
use crate::traits::Vec3;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Grid dimensions of a voxel volume, x fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl VolumeShape {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn size(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn plane_size(&self) -> usize {
        self.width * self.height
    }

    pub fn contains(&self, x: i64, y: i64, z: i64) -> bool {
        x >= 0
            && y >= 0
            && z >= 0
            && (x as usize) < self.width
            && (y as usize) < self.height
            && (z as usize) < self.depth
    }

    /// Linear index of an in-bounds voxel; callers check `contains` first.
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.height + y) * self.width + x
    }

    pub fn checked_index(&self, x: i64, y: i64, z: i64) -> Option<usize> {
        if self.contains(x, y, z) {
            Some(self.index(x as usize, y as usize, z as usize))
        } else {
            None
        }
    }

    /// Index of the voxel whose center is nearest to `point`.
    pub fn index_of_point(&self, point: &Vec3) -> Option<usize> {
        if !point.iter().all(|v| v.is_finite()) {
            return None;
        }
        self.checked_index(
            point.x.round() as i64,
            point.y.round() as i64,
            point.z.round() as i64,
        )
    }

    pub fn coordinates(&self, index: usize) -> [usize; 3] {
        let plane = self.plane_size();
        [
            index % self.width,
            (index % plane) / self.width,
            index / plane,
        ]
    }

    /// Shape of the same volume sampled `ratio` times finer along every axis.
    pub fn scaled(&self, ratio: f32) -> VolumeShape {
        let scale = |v: usize| ((v as f32) * ratio).ceil().max(0.0) as usize;
        VolumeShape::new(scale(self.width), scale(self.height), scale(self.depth))
    }
}

/// A nested field sampled `ratio` times finer than its parent.
#[derive(Debug, Clone)]
pub struct HighResolutionField {
    pub ratio: u32,
    pub field: Box<OrientedField>,
}

/// Read-only per-voxel fiber directions with one anisotropy value per slot.
///
/// Slots are ordered by descending anisotropy. A zero direction (and zero
/// anisotropy) marks an empty slot.
#[derive(Debug, Clone)]
pub struct OrientedField {
    shape: VolumeShape,
    voxel_size: [f32; 3],
    fa: Vec<Vec<f32>>,
    dir: Vec<Vec<f32>>,
    dt_fa: Vec<Vec<f32>>,
    high_resolution: Option<HighResolutionField>,
}

impl OrientedField {
    /// Builds a field from `fa[slot][voxel]` and `dir[slot][3 * voxel + axis]`.
    pub fn new(
        shape: VolumeShape,
        voxel_size: [f32; 3],
        fa: Vec<Vec<f32>>,
        dir: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if shape.size() == 0 {
            bail!("Field dimensions must be positive.");
        }
        if voxel_size.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            bail!("Voxel size must be finite and positive.");
        }
        if fa.is_empty() {
            bail!("A field needs at least one fiber slot.");
        }
        if fa.len() != dir.len() {
            return Err(TrackingError::FieldShapeMismatch(format!(
                "{} anisotropy slots but {} direction slots",
                fa.len(),
                dir.len()
            ))
            .into());
        }
        let size = shape.size();
        for (slot, (fa_slot, dir_slot)) in fa.iter().zip(dir.iter()).enumerate() {
            if fa_slot.len() != size || dir_slot.len() != size * 3 {
                return Err(TrackingError::FieldShapeMismatch(format!(
                    "slot {} holds {} anisotropy and {} direction values for {} voxels",
                    slot,
                    fa_slot.len(),
                    dir_slot.len(),
                    size
                ))
                .into());
            }
        }

        let mut field = Self {
            shape,
            voxel_size,
            fa,
            dir,
            dt_fa: Vec::new(),
            high_resolution: None,
        };
        field.normalize_slots()?;
        Ok(field)
    }

    fn normalize_slots(&mut self) -> Result<()> {
        for slot in 0..self.fa.len() {
            for voxel in 0..self.shape.size() {
                let value = self.fa[slot][voxel];
                if !value.is_finite() || value < 0.0 {
                    bail!(
                        "Anisotropy must be finite and non-negative (slot {}, voxel {}).",
                        slot,
                        voxel
                    );
                }
                let d = &mut self.dir[slot][voxel * 3..voxel * 3 + 3];
                let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                if !norm.is_finite() || norm == 0.0 || value == 0.0 {
                    d.iter_mut().for_each(|v| *v = 0.0);
                    self.fa[slot][voxel] = 0.0;
                } else {
                    d.iter_mut().for_each(|v| *v /= norm);
                }
            }
        }
        for voxel in 0..self.shape.size() {
            for slot in 1..self.fa.len() {
                if self.fa[slot][voxel] > self.fa[slot - 1][voxel] {
                    bail!(
                        "Anisotropy must be non-increasing across fiber slots (voxel {}).",
                        voxel
                    );
                }
            }
        }
        Ok(())
    }

    /// Attaches a differential-tracking index, one array per slot.
    pub fn with_dt_index(mut self, dt_fa: Vec<Vec<f32>>) -> Result<Self> {
        if dt_fa.len() != self.fa.len() || dt_fa.iter().any(|s| s.len() != self.shape.size()) {
            return Err(TrackingError::FieldShapeMismatch(
                "differential index must match the anisotropy layout".to_string(),
            )
            .into());
        }
        self.dt_fa = dt_fa;
        Ok(self)
    }

    /// Attaches a finer field that sampling consults instead of this one.
    pub fn with_high_resolution(mut self, ratio: u32, field: OrientedField) -> Result<Self> {
        if ratio < 2 {
            bail!("High-resolution ratio must be at least 2.");
        }
        let expected = self.shape.scaled(ratio as f32);
        if field.shape != expected {
            return Err(TrackingError::FieldShapeMismatch(format!(
                "high-resolution field is {:?}, expected {:?}",
                field.shape, expected
            ))
            .into());
        }
        self.high_resolution = Some(HighResolutionField {
            ratio,
            field: Box::new(field),
        });
        Ok(self)
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn voxel_size(&self) -> [f32; 3] {
        self.voxel_size
    }

    pub fn fib_num(&self) -> usize {
        self.fa.len()
    }

    pub fn high_resolution(&self) -> Option<&HighResolutionField> {
        self.high_resolution.as_ref()
    }

    pub fn has_dt_index(&self) -> bool {
        !self.dt_fa.is_empty()
    }

    pub fn anisotropy(&self, index: usize, slot: usize) -> f32 {
        self.fa[slot][index]
    }

    pub fn anisotropy_slot(&self, slot: usize) -> &[f32] {
        &self.fa[slot]
    }

    pub fn direction(&self, index: usize, slot: usize) -> Vec3 {
        let d = &self.dir[slot][index * 3..index * 3 + 3];
        Vec3::new(d[0], d[1], d[2])
    }

    /// Picks the slot at `index` best aligned with `reference`.
    ///
    /// A slot qualifies when its anisotropy reaches `fa_threshold`, its
    /// differential index reaches `dt_threshold` (when one is attached and
    /// the threshold is positive), and its absolute cosine with the
    /// reference exceeds `cull_cos_angle`. The result is flipped to point
    /// along the reference.
    pub fn aligned_direction(
        &self,
        index: usize,
        reference: &Vec3,
        fa_threshold: f32,
        cull_cos_angle: f32,
        dt_threshold: f32,
    ) -> Option<Vec3> {
        let use_dt = dt_threshold > 0.0 && !self.dt_fa.is_empty();
        let mut best_cos = cull_cos_angle;
        let mut best: Option<(usize, bool)> = None;
        for slot in 0..self.fa.len() {
            let value = self.fa[slot][index];
            if value == 0.0 || value < fa_threshold {
                continue;
            }
            if use_dt && self.dt_fa[slot][index] < dt_threshold {
                continue;
            }
            let cos = self.direction(index, slot).dot(reference);
            if -cos > best_cos {
                best_cos = -cos;
                best = Some((slot, true));
            } else if cos > best_cos {
                best_cos = cos;
                best = Some((slot, false));
            }
        }
        best.map(|(slot, flip)| {
            let d = self.direction(index, slot);
            if flip {
                -d
            } else {
                d
            }
        })
    }

    /// Otsu threshold of the slot-0 anisotropy map (256 bins).
    pub fn otsu_threshold(&self) -> f32 {
        otsu_threshold(&self.fa[0], 256)
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.fa[0].iter().fold(0.0f32, |a, &b| a.max(b))
    }
}

/// Otsu's method: the bin edge maximizing the between-class variance.
pub fn otsu_threshold(data: &[f32], num_bins: usize) -> f32 {
    if data.is_empty() || num_bins == 0 {
        return 0.0;
    }
    let min_val = data.iter().fold(f32::MAX, |a, &b| a.min(b));
    let max_val = data.iter().fold(f32::MIN, |a, &b| a.max(b));
    if (max_val - min_val).abs() < 1e-10 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f32;
    let mut histogram = vec![0usize; num_bins];
    for &v in data {
        let bin = (((v - min_val) / bin_width).floor() as usize).min(num_bins - 1);
        histogram[bin] += 1;
    }

    let total = data.len() as f64;
    let sum_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut max_variance = 0.0;
    let mut best_bin = 0usize;
    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;
        let variance =
            weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);
        if variance > max_variance {
            max_variance = variance;
            best_bin = t;
        }
    }

    min_val + best_bin as f32 * bin_width
}
