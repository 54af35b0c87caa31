use crate::tessellation::Tessellation;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// How peaks are pulled out of a half-sphere ODF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakPolicy {
    /// Mesh-local maxima ranked by amplitude.
    LocalMaximum,
    /// Repeated extract-and-shape until the residual stops paying off.
    ShapeResolving,
}

impl PeakPolicy {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "local_maximum" | "LocalMaximum" => Ok(PeakPolicy::LocalMaximum),
            "shape_resolving" | "ShapeResolving" => Ok(PeakPolicy::ShapeResolving),
            other => bail!("Unknown peak policy '{}'.", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPeak {
    pub direction_index: usize,
    pub strength: f32,
}

/// Residual signal captured by a new peak must reach this fraction of the
/// previous peak's capture.
const RESIDUAL_RATIO: f32 = 0.2;

/// Extracts discrete fiber directions from per-voxel ODF samples.
///
/// Adjacency and shaping orders are built once from the tessellation and
/// shared by every voxel.
#[derive(Debug, Clone)]
pub struct FiberOrientationResolver {
    policy: PeakPolicy,
    max_fiber_number: usize,
    neighbors: Vec<Vec<usize>>,
    shape_order: Vec<Vec<usize>>,
}

impl FiberOrientationResolver {
    pub fn new(
        tessellation: &Tessellation,
        policy: PeakPolicy,
        max_fiber_number: usize,
    ) -> Result<Self> {
        if max_fiber_number == 0 {
            bail!("max_fiber_number must be at least 1.");
        }
        let half = tessellation.half_vertices_count();

        let mut neighbors = vec![Vec::new(); half];
        for face in tessellation.faces() {
            let folded = face.map(|v| if v >= half { v - half } else { v });
            for a in 0..3 {
                for b in 0..3 {
                    if a != b && folded[a] != folded[b] {
                        neighbors[folded[a]].push(folded[b]);
                    }
                }
            }
        }
        for list in neighbors.iter_mut() {
            list.sort_unstable();
            list.dedup();
        }

        let shape_order = match policy {
            PeakPolicy::ShapeResolving => (0..half)
                .map(|i| {
                    let mut order: Vec<usize> = (0..half).filter(|&j| j != i).collect();
                    order.sort_by(|&a, &b| {
                        let ca = tessellation.vertices_cos(i, a).abs();
                        let cb = tessellation.vertices_cos(i, b).abs();
                        cb.total_cmp(&ca).then(a.cmp(&b))
                    });
                    order
                })
                .collect(),
            PeakPolicy::LocalMaximum => Vec::new(),
        };

        Ok(Self {
            policy,
            max_fiber_number,
            neighbors,
            shape_order,
        })
    }

    pub fn policy(&self) -> PeakPolicy {
        self.policy
    }

    pub fn max_fiber_number(&self) -> usize {
        self.max_fiber_number
    }

    pub fn half_vertices_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Peaks in non-increasing strength order, at most `max_fiber_number`.
    pub fn resolve(&self, odf: &[f32]) -> Result<Vec<ResolvedPeak>> {
        if odf.len() != self.neighbors.len() {
            bail!(
                "ODF has {} samples but the tessellation has {} half-sphere vertices.",
                odf.len(),
                self.neighbors.len()
            );
        }
        if odf.iter().any(|v| !v.is_finite()) {
            bail!("ODF samples must be finite.");
        }
        Ok(match self.policy {
            PeakPolicy::LocalMaximum => self.resolve_local_maximum(odf),
            PeakPolicy::ShapeResolving => self.resolve_by_shaping(odf),
        })
    }

    /// A vertex is a maximum when no neighbor is larger; on a plateau only
    /// the lowest-indexed vertex counts.
    pub fn is_local_maximum(&self, odf: &[f32], index: usize) -> bool {
        self.neighbors[index]
            .iter()
            .all(|&n| odf[index] > odf[n] || (odf[index] == odf[n] && index < n))
    }

    fn resolve_local_maximum(&self, odf: &[f32]) -> Vec<ResolvedPeak> {
        let min_odf = min_value(odf);
        let mut maxima: Vec<usize> = (0..odf.len())
            .filter(|&i| self.is_local_maximum(odf, i))
            .collect();
        // stable: equal amplitudes keep ascending vertex order
        maxima.sort_by(|&a, &b| odf[b].total_cmp(&odf[a]));
        maxima
            .into_iter()
            .map(|i| ResolvedPeak {
                direction_index: i,
                strength: odf[i] - min_odf,
            })
            .filter(|peak| peak.strength > 0.0)
            .take(self.max_fiber_number)
            .collect()
    }

    fn resolve_by_shaping(&self, odf: &[f32]) -> Vec<ResolvedPeak> {
        let min_odf = min_value(odf);
        let mut residual: Vec<f32> = odf.iter().map(|v| v - min_odf).collect();
        let mut sum: f32 = residual.iter().sum();
        let mut last_captured = 0.0f32;
        let mut peaks = Vec::with_capacity(self.max_fiber_number);

        for i in 0..self.max_fiber_number {
            let peak = argmax(&residual);
            let strength = residual[peak];
            if strength <= 0.0 {
                break;
            }
            self.shape(&mut residual, peak);
            let new_sum: f32 = residual.iter().sum();
            let captured = sum - new_sum;
            if i > 0 && last_captured * RESIDUAL_RATIO > captured {
                break;
            }
            last_captured = captured;
            sum = new_sum;
            peaks.push(ResolvedPeak {
                direction_index: peak,
                strength,
            });
        }
        peaks
    }

    /// Removes the lobe of `peak`: walking outward by angular closeness, each
    /// vertex loses the smallest amplitude seen so far along the walk.
    fn shape(&self, residual: &mut [f32], peak: usize) {
        let mut cur_max = residual[peak];
        residual[peak] = 0.0;
        for &pos in &self.shape_order[peak] {
            cur_max = cur_max.min(residual[pos]);
            residual[pos] -= cur_max;
        }
    }
}

fn min_value(values: &[f32]) -> f32 {
    values.iter().fold(f32::MAX, |a, &b| a.min(b))
}

/// Index of the largest value; ties go to the lowest index.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
