//! Post-tracking streamline collection: deletion with undo, pruning,
//! clustering, resampling and summary statistics.

use crate::field::VolumeShape;
use crate::roi::RegionConstraintSet;
use crate::traits::Vec3;
use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

fn point(points: &[f32], i: usize) -> Vec3 {
    Vec3::new(points[3 * i], points[3 * i + 1], points[3 * i + 2])
}

fn ends(points: &[f32]) -> (Vec3, Vec3) {
    let n = points.len() / 3;
    (point(points, 0), point(points, n - 1))
}

fn length_in(points: &[f32], scale: &Vec3) -> f32 {
    points
        .chunks_exact(3)
        .zip(points.chunks_exact(3).skip(1))
        .map(|(a, b)| {
            Vec3::new(b[0] - a[0], b[1] - a[1], b[2] - a[2])
                .component_mul(scale)
                .norm()
        })
        .sum()
}

/// Summary of the visible streamlines, lengths in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TractStatistics {
    pub count: usize,
    pub mean_length_mm: f32,
    pub sd_length_mm: f32,
    pub span_mm: f32,
    pub curl: f32,
    pub elongation: f32,
    pub volume_mm3: f32,
    pub mean_scalar: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct TractCollection {
    shape: VolumeShape,
    voxel_size: [f32; 3],
    tracts: Vec<Vec<f32>>,
    deleted: Vec<Vec<f32>>,
    // sizes of deletion batches, most recent last
    undo: Vec<usize>,
    labels: Vec<usize>,
}

impl TractCollection {
    pub fn new(shape: VolumeShape, voxel_size: [f32; 3]) -> Self {
        Self {
            shape,
            voxel_size,
            tracts: Vec::new(),
            deleted: Vec::new(),
            undo: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.tracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracts.is_empty()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn tracts(&self) -> &[Vec<f32>] {
        &self.tracts
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.tracts.iter().map(|t| t.as_slice())
    }

    pub fn into_tracts(self) -> Vec<Vec<f32>> {
        self.tracts
    }

    /// Cluster label per visible streamline; empty until clustering runs.
    pub fn cluster_labels(&self) -> &[usize] {
        &self.labels
    }

    /// Appends streamlines; malformed point lists are skipped.
    pub fn add_tracts(&mut self, tracts: Vec<Vec<f32>>) {
        self.tracts.extend(
            tracts
                .into_iter()
                .filter(|t| !t.is_empty() && t.len() % 3 == 0),
        );
        self.labels.clear();
    }

    pub fn clear(&mut self) {
        self.tracts.clear();
        self.deleted.clear();
        self.undo.clear();
        self.labels.clear();
    }

    /// Moves every flagged streamline into one undoable batch.
    fn delete_flagged(&mut self, flagged: &[bool]) -> usize {
        let mut kept = Vec::with_capacity(self.tracts.len());
        let mut removed = 0;
        for (tract, &flag) in std::mem::take(&mut self.tracts).into_iter().zip(flagged) {
            if flag {
                self.deleted.push(tract);
                removed += 1;
            } else {
                kept.push(tract);
            }
        }
        self.tracts = kept;
        if removed > 0 {
            self.undo.push(removed);
            self.labels.clear();
        }
        removed
    }

    pub fn delete_tracts(&mut self, indices: &[usize]) -> usize {
        let mut flagged = vec![false; self.tracts.len()];
        for &i in indices {
            if let Some(flag) = flagged.get_mut(i) {
                *flag = true;
            }
        }
        self.delete_flagged(&flagged)
    }

    /// Restores the most recent deletion batch; returns how many came back.
    pub fn undo_delete(&mut self) -> usize {
        let Some(count) = self.undo.pop() else {
            return 0;
        };
        let start = self.deleted.len() - count;
        self.tracts.extend(self.deleted.drain(start..));
        self.labels.clear();
        count
    }

    fn voxel_of(&self, p: &[f32]) -> Option<usize> {
        self.shape.index_of_point(&Vec3::new(p[0], p[1], p[2]))
    }

    /// Distinct in-volume voxels visited by one streamline.
    fn visited(&self, tract: &[f32]) -> HashSet<usize> {
        tract.chunks_exact(3).filter_map(|p| self.voxel_of(p)).collect()
    }

    /// Deletes streamlines that own a voxel no other streamline visits.
    pub fn trim(&mut self) -> usize {
        let visits: Vec<HashSet<usize>> = self.tracts.iter().map(|t| self.visited(t)).collect();
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for voxels in &visits {
            for &v in voxels {
                *counts.entry(v).or_insert(0) += 1;
            }
        }
        let flagged: Vec<bool> = visits
            .iter()
            .map(|voxels| voxels.iter().any(|v| counts[v] == 1))
            .collect();
        self.delete_flagged(&flagged)
    }

    /// Deletes streamlines lying within `distance` voxels of an earlier
    /// kept one, end points and every point included.
    pub fn delete_repeated(&mut self, distance: f32) -> Result<usize> {
        if !distance.is_finite() || distance < 0.0 {
            bail!("Repeat distance must be a non-negative number, got {}.", distance);
        }
        let d2 = distance * distance;
        let near = |a: &Vec3, b: &Vec3| (a - b).norm_squared() <= d2;
        let mut kept: Vec<usize> = Vec::new();
        let mut flagged = vec![false; self.tracts.len()];
        for (i, tract) in self.tracts.iter().enumerate() {
            let (h, t) = ends(tract);
            let repeated = kept.iter().any(|&j| {
                let other = &self.tracts[j];
                let (oh, ot) = ends(other);
                let ends_match = (near(&h, &oh) && near(&t, &ot)) || (near(&h, &ot) && near(&t, &oh));
                ends_match
                    && tract.chunks_exact(3).all(|p| {
                        let p = Vec3::new(p[0], p[1], p[2]);
                        other
                            .chunks_exact(3)
                            .any(|q| near(&p, &Vec3::new(q[0], q[1], q[2])))
                    })
            });
            if repeated {
                flagged[i] = true;
            } else {
                kept.push(i);
            }
        }
        Ok(self.delete_flagged(&flagged))
    }

    /// Endpoint-density pruning: each pass deletes streamlines with an end
    /// whose 26-neighbourhood holds fewer than `min_support` other ends.
    pub fn topology_informed_pruning(&mut self, iterations: usize, min_support: usize) -> usize {
        let mut total = 0;
        for _ in 0..iterations {
            let end_voxels: Vec<[Option<usize>; 2]> = self
                .tracts
                .iter()
                .map(|t| {
                    let n = t.len() / 3;
                    [self.voxel_of(&t[..3]), self.voxel_of(&t[3 * (n - 1)..])]
                })
                .collect();
            let mut density: HashMap<usize, usize> = HashMap::new();
            for v in end_voxels.iter().flatten().flatten() {
                *density.entry(*v).or_insert(0) += 1;
            }
            let support = |voxel: usize| -> usize {
                let [x, y, z] = self.shape.coordinates(voxel);
                let mut sum = 0;
                for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if let Some(n) =
                                self.shape
                                    .checked_index(x as i64 + dx, y as i64 + dy, z as i64 + dz)
                            {
                                sum += density.get(&n).copied().unwrap_or(0);
                            }
                        }
                    }
                }
                // the end itself
                sum - 1
            };
            let flagged: Vec<bool> = end_voxels
                .iter()
                .map(|pair| {
                    pair.iter()
                        .any(|v| v.map_or(true, |voxel| support(voxel) < min_support))
                })
                .collect();
            let removed = self.delete_flagged(&flagged);
            total += removed;
            if removed == 0 {
                break;
            }
        }
        total
    }

    /// Post-hoc exclusion, inclusion and end-point filtering.
    pub fn filter_by_roi(&mut self, roi: &RegionConstraintSet) -> usize {
        let flagged: Vec<bool> = self
            .tracts
            .iter()
            .map(|t| {
                let (h, e) = ends(t);
                t.chunks_exact(3)
                    .any(|p| roi.is_excluded_point(&Vec3::new(p[0], p[1], p[2])))
                    || !roi.have_include(t)
                    || !roi.fulfill_end_point(&h, &e)
            })
            .collect();
        self.delete_flagged(&flagged)
    }

    /// Single-linkage clustering of end-point pairs on a grid of `detail`
    /// voxels. Returns the number of groups used.
    pub fn run_clustering(&mut self, max_groups: usize, detail: f32) -> Result<usize> {
        if max_groups == 0 {
            bail!("At least one cluster group is required.");
        }
        if !detail.is_finite() || detail <= 0.0 {
            bail!("Cluster detail must be positive, got {}.", detail);
        }
        let cell = |p: &Vec3| -> [i64; 3] {
            [
                (p.x / detail).floor() as i64,
                (p.y / detail).floor() as i64,
                (p.z / detail).floor() as i64,
            ]
        };
        let keys: Vec<([i64; 3], [i64; 3])> = self
            .tracts
            .iter()
            .map(|t| {
                let (h, e) = ends(t);
                let (a, b) = (cell(&h), cell(&e));
                if a <= b {
                    (a, b)
                } else {
                    (b, a)
                }
            })
            .collect();

        let mut parent: Vec<usize> = (0..self.tracts.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        let mut by_key: HashMap<([i64; 3], [i64; 3]), usize> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            match by_key.get(key) {
                Some(&first) => {
                    let (a, b) = (find(&mut parent, first), find(&mut parent, i));
                    parent[a.max(b)] = a.min(b);
                }
                None => {
                    by_key.insert(*key, i);
                }
            }
        }
        let offsets: Vec<[i64; 3]> = (0..27)
            .map(|k| [k % 3 - 1, (k / 3) % 3 - 1, k / 9 - 1])
            .collect();
        for (key, &i) in &by_key {
            for da in &offsets {
                for db in &offsets {
                    let a = [key.0[0] + da[0], key.0[1] + da[1], key.0[2] + da[2]];
                    let b = [key.1[0] + db[0], key.1[1] + db[1], key.1[2] + db[2]];
                    let neighbor = if a <= b { (a, b) } else { (b, a) };
                    if let Some(&j) = by_key.get(&neighbor) {
                        let (ra, rb) = (find(&mut parent, i), find(&mut parent, j));
                        parent[ra.max(rb)] = ra.min(rb);
                    }
                }
            }
        }

        let mut members: HashMap<usize, usize> = HashMap::new();
        let roots: Vec<usize> = (0..self.tracts.len())
            .map(|i| find(&mut parent, i))
            .collect();
        for &r in &roots {
            *members.entry(r).or_insert(0) += 1;
        }
        let mut ranked: Vec<(usize, usize)> = members.into_iter().collect();
        // largest first, then by earliest member
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let rank: HashMap<usize, usize> = ranked
            .iter()
            .enumerate()
            .map(|(label, (root, _))| (*root, label.min(max_groups - 1)))
            .collect();
        self.labels = roots.iter().map(|r| rank[r]).collect();
        Ok(ranked.len().min(max_groups))
    }

    /// Arc-length resampling at `step` voxels; both ends are kept.
    pub fn resample(&mut self, step: f32) -> Result<()> {
        if !step.is_finite() || step <= 0.0 {
            bail!("Resampling step must be positive, got {}.", step);
        }
        for tract in &mut self.tracts {
            let n = tract.len() / 3;
            if n < 2 {
                continue;
            }
            let mut out = tract[..3].to_vec();
            let mut next = step;
            let mut travelled = 0.0f32;
            for i in 1..n {
                let (a, b) = (point(tract, i - 1), point(tract, i));
                let segment = (b - a).norm();
                while segment > 0.0 && travelled + segment >= next {
                    let p = a + (b - a) * ((next - travelled) / segment);
                    out.extend_from_slice(p.as_slice());
                    next += step;
                }
                travelled += segment;
            }
            let last = point(tract, n - 1);
            let tail = point(&out, out.len() / 3 - 1);
            if (last - tail).norm() > 1e-4 * step {
                out.extend_from_slice(last.as_slice());
            }
            *tract = out;
        }
        Ok(())
    }

    /// Occupied in-volume voxels, ordered by linear index.
    pub fn to_voxels(&self) -> Vec<[i32; 3]> {
        let mut voxels: Vec<usize> = self
            .tracts
            .iter()
            .flat_map(|t| self.visited(t))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        voxels.sort_unstable();
        voxels
            .into_iter()
            .map(|v| {
                let [x, y, z] = self.shape.coordinates(v);
                [x as i32, y as i32, z as i32]
            })
            .collect()
    }

    /// `scalar`, when given, is one value per voxel of the volume.
    pub fn statistics(&self, scalar: Option<&[f32]>) -> Result<TractStatistics> {
        if let Some(values) = scalar {
            if values.len() != self.shape.size() {
                bail!(
                    "Scalar volume has {} values but the volume holds {} voxels.",
                    values.len(),
                    self.shape.size()
                );
            }
        }
        let scale = Vec3::new(self.voxel_size[0], self.voxel_size[1], self.voxel_size[2]);
        let count = self.tracts.len();
        if count == 0 {
            return Ok(TractStatistics {
                count: 0,
                mean_length_mm: 0.0,
                sd_length_mm: 0.0,
                span_mm: 0.0,
                curl: 0.0,
                elongation: 0.0,
                volume_mm3: 0.0,
                mean_scalar: scalar.map(|_| 0.0),
            });
        }

        let lengths: Vec<f32> = self.tracts.iter().map(|t| length_in(t, &scale)).collect();
        let mean = lengths.iter().sum::<f32>() / count as f32;
        let variance = lengths.iter().map(|l| (l - mean) * (l - mean)).sum::<f32>() / count as f32;
        let span = self
            .tracts
            .iter()
            .map(|t| {
                let (h, e) = ends(t);
                (e - h).component_mul(&scale).norm()
            })
            .sum::<f32>()
            / count as f32;
        let voxel_volume = scale.x * scale.y * scale.z;
        let volume = self.to_voxels().len() as f32 * voxel_volume;
        let diameter = if mean > 0.0 {
            2.0 * (volume / (std::f32::consts::PI * mean)).sqrt()
        } else {
            0.0
        };

        let mean_scalar = scalar.map(|values| {
            let (sum, n) = self
                .tracts
                .iter()
                .flat_map(|t| t.chunks_exact(3))
                .filter_map(|p| self.voxel_of(p))
                .fold((0.0f64, 0usize), |(s, n), v| (s + values[v] as f64, n + 1));
            if n == 0 {
                0.0
            } else {
                (sum / n as f64) as f32
            }
        });

        Ok(TractStatistics {
            count,
            mean_length_mm: mean,
            sd_length_mm: variance.sqrt(),
            span_mm: span,
            curl: if span > 0.0 { mean / span } else { 0.0 },
            elongation: if diameter > 0.0 { mean / diameter } else { 0.0 },
            volume_mm3: volume,
            mean_scalar,
        })
    }
}
