use crate::error::TrackingError;
use crate::field::{OrientedField, VolumeShape};
use crate::random::SeedRng;
use crate::traits::Vec3;
use anyhow::{bail, Result};
use log::debug;
use std::fmt::Write as _;

/// Default distance between a traced point and the atlas centerline.
pub const DEFAULT_ATLAS_TOLERANCE_MM: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    /// Every accepted trace must pass through it.
    Roi = 0,
    /// Any trace touching it is discarded.
    Roa = 1,
    End = 2,
    Seed = 3,
    Terminate = 4,
}

impl RegionRole {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => RegionRole::Roi,
            1 => RegionRole::Roa,
            2 => RegionRole::End,
            3 => RegionRole::Seed,
            4 => RegionRole::Terminate,
            other => bail!("Unknown region role {}.", other),
        })
    }
}

/// A voxel set defined on the tracking grid scaled by `ratio`.
#[derive(Debug, Clone)]
pub struct VoxelRegion {
    name: String,
    ratio: f32,
    grid: VolumeShape,
    mask: Vec<bool>,
    points: Vec<[i32; 3]>,
}

impl VoxelRegion {
    /// Points outside the scaled grid are dropped, duplicates are merged.
    pub fn new(
        name: impl Into<String>,
        tracking_shape: VolumeShape,
        points: &[[i32; 3]],
        ratio: f32,
    ) -> Result<Self> {
        if !ratio.is_finite() || ratio <= 0.0 {
            bail!("Region resolution ratio must be positive, got {}.", ratio);
        }
        let grid = tracking_shape.scaled(ratio);
        let mut mask = vec![false; grid.size()];
        let mut kept = Vec::with_capacity(points.len());
        for p in points {
            if let Some(index) = grid.checked_index(p[0] as i64, p[1] as i64, p[2] as i64) {
                if !mask[index] {
                    mask[index] = true;
                    kept.push(*p);
                }
            }
        }
        Ok(Self {
            name: name.into(),
            ratio,
            grid,
            mask,
            points: kept,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn points(&self) -> &[[i32; 3]] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `point` is in tracking-grid coordinates; it is scaled by the region
    /// ratio and rounded to the nearest region voxel.
    pub fn contains(&self, point: &Vec3) -> bool {
        self.grid
            .index_of_point(&(point * self.ratio))
            .map_or(false, |index| self.mask[index])
    }

    /// Adds voxels; returns whether anything new was added.
    pub fn add_points(&mut self, points: &[[i32; 3]]) -> bool {
        let before = self.points.len();
        for p in points {
            if let Some(index) = self.grid.checked_index(p[0] as i64, p[1] as i64, p[2] as i64) {
                if !self.mask[index] {
                    self.mask[index] = true;
                    self.points.push(*p);
                }
            }
        }
        self.points.len() > before
    }
}

#[derive(Debug, Clone)]
struct SeedPoint {
    voxel: [i32; 3],
    ratio: f32,
}

#[derive(Debug, Clone)]
struct AtlasTube {
    name: String,
    tolerance_mm: f32,
    mask: Vec<bool>,
}

/// Seed, inclusion, exclusion, end-point and termination regions evaluated
/// against traced points.
#[derive(Debug, Clone)]
pub struct RegionConstraintSet {
    shape: VolumeShape,
    seeds: Vec<SeedPoint>,
    seed_names: Vec<String>,
    includes: Vec<VoxelRegion>,
    excludes: Vec<VoxelRegion>,
    ends: Vec<VoxelRegion>,
    terminates: Vec<VoxelRegion>,
    atlas_tube: Option<AtlasTube>,
}

impl RegionConstraintSet {
    pub fn new(shape: VolumeShape) -> Self {
        Self {
            shape,
            seeds: Vec::new(),
            seed_names: Vec::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
            ends: Vec::new(),
            terminates: Vec::new(),
            atlas_tube: None,
        }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    /// Registers a region under `role`; an empty region is rejected.
    pub fn set_region(
        &mut self,
        role: RegionRole,
        name: &str,
        points: &[[i32; 3]],
        ratio: f32,
    ) -> Result<()> {
        let region = VoxelRegion::new(name, self.shape, points, ratio)?;
        if region.is_empty() {
            bail!("Region '{}' has no voxel inside the volume.", name);
        }
        match role {
            RegionRole::Seed => {
                self.seeds.extend(region.points().iter().map(|&voxel| SeedPoint {
                    voxel,
                    ratio: region.ratio(),
                }));
                self.seed_names.push(region.name().to_string());
            }
            RegionRole::Roi => self.includes.push(region),
            RegionRole::Roa => self.excludes.push(region),
            RegionRole::End => self.ends.push(region),
            RegionRole::Terminate => self.terminates.push(region),
        }
        Ok(())
    }

    /// Seeds every voxel whose slot-0 anisotropy exceeds `threshold`.
    pub fn set_whole_brain_seed(&mut self, field: &OrientedField, threshold: f32) -> usize {
        let shape = field.shape();
        let before = self.seeds.len();
        for (index, &fa) in field.anisotropy_slot(0).iter().enumerate() {
            if fa > threshold {
                let [x, y, z] = shape.coordinates(index);
                self.seeds.push(SeedPoint {
                    voxel: [x as i32, y as i32, z as i32],
                    ratio: 1.0,
                });
            }
        }
        let added = self.seeds.len() - before;
        debug!("whole-brain seeding at threshold {}: {} voxels", threshold, added);
        if added > 0 {
            self.seed_names.push("whole brain".to_string());
        }
        added
    }

    pub fn clear_seeds(&mut self) {
        self.seeds.clear();
        self.seed_names.clear();
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.len()
    }

    pub fn has_seeds(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Seed `index` in tracking coordinates, jittered within its voxel when
    /// `rng` is given.
    pub fn seed_position(&self, index: usize, rng: Option<&mut SeedRng>) -> Option<Vec3> {
        let seed = self.seeds.get(index)?;
        let mut position = Vec3::new(
            seed.voxel[0] as f32,
            seed.voxel[1] as f32,
            seed.voxel[2] as f32,
        );
        if let Some(rng) = rng {
            position.x += rng.uniform_range(-0.5, 0.5);
            position.y += rng.uniform_range(-0.5, 0.5);
            position.z += rng.uniform_range(-0.5, 0.5);
        }
        Some(position / seed.ratio)
    }

    /// Restricts tracking to a tube of `tolerance_mm` around atlas
    /// centerlines given in voxel coordinates.
    pub fn set_atlas_tube(
        &mut self,
        name: &str,
        centerlines: &[Vec<f32>],
        tolerance_mm: f32,
        voxel_size: [f32; 3],
    ) -> Result<()> {
        if !tolerance_mm.is_finite() || tolerance_mm <= 0.0 {
            bail!("Atlas tolerance must be positive, got {}.", tolerance_mm);
        }
        if voxel_size.iter().any(|v| *v <= 0.0) {
            bail!("Voxel size must be positive.");
        }
        if centerlines.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TrackingError::InvalidRegion(format!(
                "atlas track '{}' has a non-finite coordinate",
                name
            ))
            .into());
        }
        let shape = self.shape;
        let mut mask = vec![false; shape.size()];
        let reach = voxel_size.map(|v| (tolerance_mm / v).ceil() as i64);
        let dims = [shape.width, shape.height, shape.depth];
        let tolerance2 = tolerance_mm * tolerance_mm;
        let mut any_point = false;
        for line in centerlines {
            for p in line.chunks_exact(3) {
                any_point = true;
                // no voxel of the volume lies within reach
                if (0..3).any(|k| {
                    p[k] < -(reach[k] as f32) - 1.0 || p[k] > (dims[k] as i64 + reach[k]) as f32
                }) {
                    continue;
                }
                let center = [p[0].round() as i64, p[1].round() as i64, p[2].round() as i64];
                for z in center[2] - reach[2]..=center[2] + reach[2] {
                    for y in center[1] - reach[1]..=center[1] + reach[1] {
                        for x in center[0] - reach[0]..=center[0] + reach[0] {
                            let Some(index) = shape.checked_index(x, y, z) else {
                                continue;
                            };
                            if mask[index] {
                                continue;
                            }
                            let d = [
                                (x as f32 - p[0]) * voxel_size[0],
                                (y as f32 - p[1]) * voxel_size[1],
                                (z as f32 - p[2]) * voxel_size[2],
                            ];
                            if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] <= tolerance2 {
                                mask[index] = true;
                            }
                        }
                    }
                }
            }
        }
        if !any_point {
            bail!("Atlas track '{}' has no points.", name);
        }
        self.atlas_tube = Some(AtlasTube {
            name: name.to_string(),
            tolerance_mm,
            mask,
        });
        Ok(())
    }

    pub fn is_excluded_point(&self, point: &Vec3) -> bool {
        if self.excludes.iter().any(|r| r.contains(point)) {
            return true;
        }
        match &self.atlas_tube {
            Some(tube) => !self
                .shape
                .index_of_point(point)
                .map_or(false, |index| tube.mask[index]),
            None => false,
        }
    }

    pub fn is_terminate_point(&self, point: &Vec3) -> bool {
        self.shape.index_of_point(point).is_none()
            || self.terminates.iter().any(|r| r.contains(point))
    }

    /// Every inclusion region holds at least one of the flat `points`.
    pub fn have_include(&self, points: &[f32]) -> bool {
        self.includes.iter().all(|region| {
            points
                .chunks_exact(3)
                .any(|p| region.contains(&Vec3::new(p[0], p[1], p[2])))
        })
    }

    /// With one end region either end may touch it; with two, the ends
    /// must land in different regions; with more, each end must land in
    /// some region.
    pub fn fulfill_end_point(&self, end1: &Vec3, end2: &Vec3) -> bool {
        match self.ends.as_slice() {
            [] => true,
            [only] => only.contains(end1) || only.contains(end2),
            [a, b] => {
                (a.contains(end1) && b.contains(end2)) || (b.contains(end1) && a.contains(end2))
            }
            many => {
                many.iter().any(|r| r.contains(end1)) && many.iter().any(|r| r.contains(end2))
            }
        }
    }

    pub fn has_constraints(&self) -> bool {
        !self.includes.is_empty()
            || !self.excludes.is_empty()
            || !self.ends.is_empty()
            || !self.terminates.is_empty()
            || self.atlas_tube.is_some()
    }

    /// Provenance sentences naming each region.
    pub fn summary(&self) -> String {
        let mut text = String::new();
        for name in &self.seed_names {
            let _ = write!(text, " A seeding region was placed at {}.", name);
        }
        for region in &self.includes {
            let _ = write!(text, " An ROI was placed at {}.", region.name());
        }
        for region in &self.excludes {
            let _ = write!(text, " An ROA was placed at {}.", region.name());
        }
        for region in &self.ends {
            let _ = write!(text, " An ending region was placed at {}.", region.name());
        }
        for region in &self.terminates {
            let _ = write!(text, " A terminative region was placed at {}.", region.name());
        }
        if let Some(tube) = &self.atlas_tube {
            let _ = write!(
                text,
                " Tracks were constrained within {} mm of the {} atlas track.",
                tube.tolerance_mm, tube.name
            );
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn slab(x: i32, size: i32) -> Vec<[i32; 3]> {
        let mut points = Vec::new();
        for z in 0..size {
            for y in 0..size {
                points.push([x, y, z]);
            }
        }
        points
    }

    fn flat(points: &[[f32; 3]]) -> Vec<f32> {
        points.iter().flatten().copied().collect()
    }

    #[test]
    fn region_scales_points_by_ratio() {
        let shape = VolumeShape::new(4, 4, 4);
        let region = VoxelRegion::new("fine", shape, &[[4, 4, 4], [9, 0, 0]], 2.0).expect("region");
        assert_eq!(region.points().len(), 1);
        assert!(region.contains(&Vec3::new(2.0, 2.0, 2.0)));
        assert!(region.contains(&Vec3::new(2.2, 1.8, 2.1)));
        assert!(!region.contains(&Vec3::new(3.0, 2.0, 2.0)));
        assert_err_contains(VoxelRegion::new("bad", shape, &[], 0.0), "ratio");
    }

    #[test]
    fn exclusion_and_termination() {
        let shape = VolumeShape::new(5, 5, 5);
        let mut roi = RegionConstraintSet::new(shape);
        roi.set_region(RegionRole::Roa, "wall", &slab(3, 5), 1.0).expect("roa");
        roi.set_region(RegionRole::Terminate, "stop", &slab(1, 5), 1.0).expect("ter");
        assert!(roi.is_excluded_point(&Vec3::new(3.2, 2.0, 2.0)));
        assert!(!roi.is_excluded_point(&Vec3::new(2.2, 2.0, 2.0)));
        assert!(roi.is_terminate_point(&Vec3::new(0.8, 2.0, 2.0)));
        assert!(roi.is_terminate_point(&Vec3::new(-0.6, 2.0, 2.0)));
        assert!(!roi.is_terminate_point(&Vec3::new(4.4, 2.0, 2.0)));
        assert!(roi.is_terminate_point(&Vec3::new(4.6, 2.0, 2.0)));
    }

    #[test]
    fn have_include_requires_every_region() {
        let shape = VolumeShape::new(6, 3, 3);
        let mut roi = RegionConstraintSet::new(shape);
        let trace = flat(&[[1.0, 1.0, 1.0], [2.0, 1.0, 1.0], [3.0, 1.0, 1.0]]);
        assert!(roi.have_include(&trace));
        roi.set_region(RegionRole::Roi, "a", &[[1, 1, 1]], 1.0).expect("roi");
        assert!(roi.have_include(&trace));
        roi.set_region(RegionRole::Roi, "b", &[[5, 1, 1]], 1.0).expect("roi");
        assert!(!roi.have_include(&trace));
        let longer = flat(&[[1.0, 1.0, 1.0], [5.0, 1.0, 1.0]]);
        assert!(roi.have_include(&longer));
    }

    #[test]
    fn growing_an_inclusion_region_never_rejects_more() {
        let shape = VolumeShape::new(6, 3, 3);
        let trace = flat(&[[1.0, 1.0, 1.0], [2.0, 1.0, 1.0]]);
        let mut region = VoxelRegion::new("grow", shape, &[[4, 1, 1]], 1.0).expect("region");
        let accepted_before = trace
            .chunks_exact(3)
            .any(|p| region.contains(&Vec3::new(p[0], p[1], p[2])));
        assert!(region.add_points(&[[2, 1, 1]]));
        let accepted_after = trace
            .chunks_exact(3)
            .any(|p| region.contains(&Vec3::new(p[0], p[1], p[2])));
        assert!(!accepted_before && accepted_after);
        assert!(!region.add_points(&[[2, 1, 1]]));
    }

    #[test]
    fn end_point_policies() {
        let shape = VolumeShape::new(10, 3, 3);
        let left = Vec3::new(0.0, 1.0, 1.0);
        let middle = Vec3::new(5.0, 1.0, 1.0);
        let right = Vec3::new(9.0, 1.0, 1.0);

        let mut one = RegionConstraintSet::new(shape);
        assert!(one.fulfill_end_point(&left, &right));
        one.set_region(RegionRole::End, "left", &[[0, 1, 1]], 1.0).expect("end");
        assert!(one.fulfill_end_point(&middle, &left));
        assert!(!one.fulfill_end_point(&middle, &right));

        let mut two = one.clone();
        two.set_region(RegionRole::End, "right", &[[9, 1, 1]], 1.0).expect("end");
        assert!(two.fulfill_end_point(&right, &left));
        assert!(!two.fulfill_end_point(&left, &middle));
        assert!(!two.fulfill_end_point(&left, &left));

        let mut three = two.clone();
        three.set_region(RegionRole::End, "middle", &[[5, 1, 1]], 1.0).expect("end");
        assert!(three.fulfill_end_point(&middle, &left));
        assert!(!three.fulfill_end_point(&middle, &Vec3::new(3.0, 1.0, 1.0)));
    }

    #[test]
    fn seeds_from_regions_and_whole_brain() {
        let shape = VolumeShape::new(3, 1, 1);
        let field = OrientedField::new(
            shape,
            [1.0; 3],
            vec![vec![0.1, 0.6, 0.9]],
            vec![[1.0f32, 0.0, 0.0].repeat(3)],
        )
        .expect("field");
        let mut roi = RegionConstraintSet::new(shape);
        assert_eq!(roi.set_whole_brain_seed(&field, 0.5), 2);
        assert_eq!(roi.seed_position(0, None), Some(Vec3::new(1.0, 0.0, 0.0)));
        assert!(roi.summary().contains("seeding region was placed at whole brain"));

        roi.clear_seeds();
        roi.set_region(RegionRole::Seed, "fine seed", &[[4, 0, 0]], 2.0).expect("seed");
        assert_eq!(roi.seed_count(), 1);
        assert_eq!(roi.seed_position(0, None), Some(Vec3::new(2.0, 0.0, 0.0)));
        let mut rng = SeedRng::new(1);
        let jittered = roi.seed_position(0, Some(&mut rng)).expect("seed");
        assert!((jittered - Vec3::new(2.0, 0.0, 0.0)).abs().max() <= 0.25);
        assert_eq!(roi.seed_position(1, None), None);
    }

    #[test]
    fn atlas_tube_excludes_distant_points() {
        let shape = VolumeShape::new(20, 20, 3);
        let mut roi = RegionConstraintSet::new(shape);
        let centerline: Vec<f32> = (0..20).flat_map(|x| [x as f32, 10.0, 1.0]).collect();
        roi.set_atlas_tube("arcuate", &[centerline], 4.0, [2.0, 2.0, 2.0])
            .expect("tube");
        assert!(!roi.is_excluded_point(&Vec3::new(5.0, 11.0, 1.0)));
        assert!(!roi.is_excluded_point(&Vec3::new(5.0, 12.0, 1.0)));
        assert!(roi.is_excluded_point(&Vec3::new(5.0, 13.0, 1.0)));
        assert!(roi.summary().contains("within 4 mm of the arcuate atlas track"));
        assert_err_contains(
            roi.set_atlas_tube("empty", &[], 4.0, [1.0; 3]),
            "has no points",
        );
    }

    #[test]
    fn atlas_tube_rejects_non_finite_and_skips_far_points() {
        let shape = VolumeShape::new(10, 10, 3);
        let mut roi = RegionConstraintSet::new(shape);
        let broken = vec![1.0, 2.0, 1.0, f32::NAN, 2.0, 1.0];
        let err = roi
            .set_atlas_tube("broken", &[broken], 2.0, [1.0; 3])
            .expect_err("non-finite coordinate");
        assert_eq!(
            err.downcast_ref::<TrackingError>(),
            Some(&TrackingError::InvalidRegion(
                "atlas track 'broken' has a non-finite coordinate".to_string()
            ))
        );

        let far = vec![1.0e30, 5.0, 1.0, -1.0e30, 5.0, 1.0, 2.0, 5.0, 1.0];
        roi.set_atlas_tube("far", &[far], 1.0, [1.0; 3]).expect("tube");
        assert!(!roi.is_excluded_point(&Vec3::new(2.0, 5.0, 1.0)));
        assert!(roi.is_excluded_point(&Vec3::new(8.0, 5.0, 1.0)));
    }

    #[test]
    fn empty_regions_are_rejected() {
        let mut roi = RegionConstraintSet::new(VolumeShape::new(2, 2, 2));
        assert_err_contains(
            roi.set_region(RegionRole::Roi, "outside", &[[5, 5, 5]], 1.0),
            "no voxel inside",
        );
        assert_err_contains(RegionRole::from_code(9), "Unknown region role");
    }
}
