use crate::field::OrientedField;
use crate::traits::{DirectionField, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolationKind {
    Trilinear = 0,
    Nearest = 1,
}

impl InterpolationKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InterpolationKind::Trilinear),
            1 => Some(InterpolationKind::Nearest),
            _ => None,
        }
    }
}

/// Acceptance limits applied to every candidate direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingThresholds {
    pub fa_threshold: f32,
    pub cull_cos_angle: f32,
    pub dt_threshold: f32,
}

/// Samples an `OrientedField` at continuous voxel coordinates.
///
/// When the field carries a high-resolution companion, positions are
/// scaled by its ratio and the companion is sampled instead.
#[derive(Debug, Clone, Copy)]
pub struct FieldInterpolator<'a> {
    field: &'a OrientedField,
    kind: InterpolationKind,
    thresholds: SamplingThresholds,
}

impl<'a> FieldInterpolator<'a> {
    pub fn new(
        field: &'a OrientedField,
        kind: InterpolationKind,
        thresholds: SamplingThresholds,
    ) -> Self {
        Self {
            field,
            kind,
            thresholds,
        }
    }

    pub fn kind(&self) -> InterpolationKind {
        self.kind
    }

    pub fn thresholds(&self) -> &SamplingThresholds {
        &self.thresholds
    }

    fn candidate(&self, field: &OrientedField, index: usize, reference: &Vec3) -> Option<Vec3> {
        field.aligned_direction(
            index,
            reference,
            self.thresholds.fa_threshold,
            self.thresholds.cull_cos_angle,
            self.thresholds.dt_threshold,
        )
    }

    fn sample_nearest(
        &self,
        field: &OrientedField,
        position: &Vec3,
        reference: &Vec3,
    ) -> Option<Vec3> {
        let index = field.shape().index_of_point(position)?;
        self.candidate(field, index, reference)
    }

    fn sample_trilinear(
        &self,
        field: &OrientedField,
        position: &Vec3,
        reference: &Vec3,
    ) -> Option<Vec3> {
        if !position.iter().all(|v| v.is_finite()) {
            return None;
        }
        let shape = field.shape();
        let base = position.map(|v| v.floor());
        let frac = position - base;
        let (bx, by, bz) = (base.x as i64, base.y as i64, base.z as i64);

        let mut accumulated = Vec3::zeros();
        let mut total_weight = 0.0f32;
        for corner in 0..8 {
            let dx = (corner & 1) as i64;
            let dy = ((corner >> 1) & 1) as i64;
            let dz = ((corner >> 2) & 1) as i64;
            let Some(index) = shape.checked_index(bx + dx, by + dy, bz + dz) else {
                continue;
            };
            let wx = if dx == 1 { frac.x } else { 1.0 - frac.x };
            let wy = if dy == 1 { frac.y } else { 1.0 - frac.y };
            let wz = if dz == 1 { frac.z } else { 1.0 - frac.z };
            let weight = wx * wy * wz;
            if weight <= 0.0 {
                continue;
            }
            if let Some(direction) = self.candidate(field, index, reference) {
                accumulated += direction * weight;
                total_weight += weight;
            }
        }

        if total_weight < 0.5 {
            return None;
        }
        let norm = accumulated.norm();
        if !norm.is_finite() || norm == 0.0 {
            return None;
        }
        Some(accumulated / norm)
    }
}

impl DirectionField for FieldInterpolator<'_> {
    fn sample(&self, position: &Vec3, reference: &Vec3) -> Option<Vec3> {
        let (field, position) = match self.field.high_resolution() {
            Some(high) => (high.field.as_ref(), position * high.ratio as f32),
            None => (self.field, *position),
        };
        match self.kind {
            InterpolationKind::Trilinear => self.sample_trilinear(field, &position, reference),
            InterpolationKind::Nearest => self.sample_nearest(field, &position, reference),
        }
    }

    fn anisotropy_at(&self, position: &Vec3) -> f32 {
        let (field, position) = match self.field.high_resolution() {
            Some(high) => (high.field.as_ref(), position * high.ratio as f32),
            None => (self.field, *position),
        };
        field
            .shape()
            .index_of_point(&position)
            .map(|index| field.anisotropy(index, 0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::VolumeShape;

    fn thresholds() -> SamplingThresholds {
        SamplingThresholds {
            fa_threshold: 0.5,
            cull_cos_angle: 0.5,
            dt_threshold: 0.0,
        }
    }

    fn field_with(shape: VolumeShape, fa: impl Fn(usize) -> f32, dir: [f32; 3]) -> OrientedField {
        let size = shape.size();
        OrientedField::new(
            shape,
            [1.0; 3],
            vec![(0..size).map(fa).collect()],
            vec![dir.repeat(size)],
        )
        .expect("field")
    }

    #[test]
    fn trilinear_returns_field_direction_inside_volume() {
        let field = field_with(VolumeShape::new(4, 4, 4), |_| 1.0, [0.0, 1.0, 0.0]);
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Trilinear, thresholds());
        let reference = Vec3::new(0.0, -1.0, 0.0);
        let dir = sampler
            .sample(&Vec3::new(1.3, 1.7, 2.2), &reference)
            .expect("direction");
        assert!((dir - reference).norm() < 1e-6);
    }

    #[test]
    fn trilinear_fails_when_less_than_half_the_weight_qualifies() {
        let shape = VolumeShape::new(2, 1, 1);
        let field = field_with(shape, |i| if i == 0 { 1.0 } else { 0.1 }, [1.0, 0.0, 0.0]);
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Trilinear, thresholds());
        let reference = Vec3::new(1.0, 0.0, 0.0);
        assert!(sampler.sample(&Vec3::new(0.4, 0.0, 0.0), &reference).is_some());
        assert!(sampler.sample(&Vec3::new(0.6, 0.0, 0.0), &reference).is_none());
    }

    #[test]
    fn trilinear_drops_corners_outside_the_volume() {
        let field = field_with(VolumeShape::new(3, 3, 3), |_| 1.0, [1.0, 0.0, 0.0]);
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Trilinear, thresholds());
        let reference = Vec3::new(1.0, 0.0, 0.0);
        assert!(sampler.sample(&Vec3::new(2.3, 1.0, 1.0), &reference).is_some());
        assert!(sampler.sample(&Vec3::new(2.7, 1.0, 1.0), &reference).is_none());
        assert!(sampler.sample(&Vec3::new(-3.0, 1.0, 1.0), &reference).is_none());
    }

    #[test]
    fn nearest_rejects_sharp_turns() {
        let field = field_with(VolumeShape::new(3, 3, 3), |_| 1.0, [1.0, 0.0, 0.0]);
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Nearest, thresholds());
        assert!(sampler
            .sample(&Vec3::new(1.0, 1.0, 1.0), &Vec3::new(0.0, 1.0, 0.0))
            .is_none());
        assert_eq!(sampler.anisotropy_at(&Vec3::new(1.2, 0.8, 1.0)), 1.0);
        assert_eq!(sampler.anisotropy_at(&Vec3::new(5.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn high_resolution_companion_is_sampled_instead() {
        let coarse = field_with(VolumeShape::new(2, 2, 2), |_| 1.0, [1.0, 0.0, 0.0]);
        let fine = field_with(VolumeShape::new(4, 4, 4), |_| 1.0, [0.0, 0.0, 1.0]);
        let field = coarse.with_high_resolution(2, fine).expect("attach");
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Trilinear, thresholds());
        let dir = sampler
            .sample(&Vec3::new(0.5, 0.5, 0.5), &Vec3::new(0.0, 0.0, 1.0))
            .expect("direction");
        assert!((dir - Vec3::new(0.0, 0.0, 1.0)).norm() < 1e-6);
    }

    #[test]
    fn anisotropy_is_read_where_directions_are_sampled() {
        let coarse = field_with(VolumeShape::new(2, 2, 2), |_| 1.0, [1.0, 0.0, 0.0]);
        let fine = field_with(VolumeShape::new(4, 4, 4), |i| (i % 4) as f32 * 0.25, [1.0, 0.0, 0.0]);
        let field = coarse.with_high_resolution(2, fine).expect("attach");
        let sampler = FieldInterpolator::new(&field, InterpolationKind::Nearest, thresholds());
        // coarse x = 1 maps onto fine x = 2
        assert_eq!(sampler.anisotropy_at(&Vec3::new(1.0, 0.0, 0.0)), 0.5);
        assert_eq!(sampler.anisotropy_at(&Vec3::new(0.0, 1.0, 1.0)), 0.0);
        assert_eq!(sampler.anisotropy_at(&Vec3::new(3.0, 0.0, 0.0)), 0.0);
    }
}
