#![allow(dead_code)]

use std::sync::Arc;
use tract_core::field::{OrientedField, VolumeShape};
use tract_core::params::TrackingParameters;
use tract_core::roi::{RegionConstraintSet, RegionRole};
use tract_core::tessellation::Tessellation;
use tract_core::traits::Vec3;

/// Single-slot field with a direction and anisotropy chosen per voxel.
pub fn field_from<F>(n: usize, f: F) -> Arc<OrientedField>
where
    F: Fn(usize, usize, usize) -> ([f32; 3], f32),
{
    let shape = VolumeShape::new(n, n, n);
    let mut fa = vec![0.0f32; shape.size()];
    let mut dir = vec![0.0f32; shape.size() * 3];
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let i = shape.index(x, y, z);
                let (d, a) = f(x, y, z);
                fa[i] = a;
                dir[3 * i..3 * i + 3].copy_from_slice(&d);
            }
        }
    }
    Arc::new(OrientedField::new(shape, [1.0; 3], vec![fa], vec![dir]).expect("field"))
}

/// Anisotropy 1 and direction +x everywhere.
pub fn straight_field(n: usize) -> Arc<OrientedField> {
    field_from(n, |_, _, _| ([1.0, 0.0, 0.0], 1.0))
}

/// Flow along +z twisting around the volume's central axis.
pub fn helix_field(n: usize) -> Arc<OrientedField> {
    let c = (n as f32 - 1.0) / 2.0;
    field_from(n, |x, y, _| {
        let (dx, dy) = (x as f32 - c, y as f32 - c);
        ([-0.15 * dy, 0.15 * dx, 1.0], 0.8)
    })
}

/// Euler, no smoothing, one-voxel steps, 60 degree turning limit.
pub fn fixed_params() -> TrackingParameters {
    let mut params = TrackingParameters {
        threshold: 0.5,
        step_size: 1.0,
        smooth_fraction: 0.0,
        min_length: 5.0,
        max_length: 300.0,
        termination_count: 1,
        ..TrackingParameters::default()
    };
    params.set_turning_angle_degrees(60.0);
    params
}

pub fn center_seed(field: &OrientedField) -> RegionConstraintSet {
    let shape = field.shape();
    let mut roi = RegionConstraintSet::new(shape);
    let center = [
        (shape.width / 2) as i32,
        (shape.height / 2) as i32,
        (shape.depth / 2) as i32,
    ];
    roi.set_region(RegionRole::Seed, "center", &[center], 1.0)
        .expect("seed region");
    roi
}

pub fn points(tract: &[f32]) -> Vec<Vec3> {
    tract
        .chunks_exact(3)
        .map(|p| Vec3::new(p[0], p[1], p[2]))
        .collect()
}

/// Half-sphere ODF: baseline plus one Gaussian bump per axis.
pub fn gaussian_odf(tess: &Tessellation, axes: &[Vec3], baseline: f32, sigma: f32) -> Vec<f32> {
    (0..tess.half_vertices_count())
        .map(|i| {
            let v = tess.vertex(i);
            baseline
                + axes
                    .iter()
                    .map(|axis| {
                        let angle = v.dot(axis).abs().min(1.0).acos();
                        (-angle * angle / (2.0 * sigma * sigma)).exp()
                    })
                    .sum::<f32>()
        })
        .collect()
}
