//! Icosahedral sphere tessellation with antipodal vertex pairing.
//!
//! Vertex `i` and vertex `i + half_vertices_count` are antipodes, so an
//! axially symmetric function over the sphere is stored once per pair.

use crate::traits::Vec3;
use anyhow::{bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Tessellation {
    vertices: Vec<Vec3>,
    faces: Vec<[usize; 3]>,
    half_vertices_count: usize,
}

impl Tessellation {
    /// Subdivided icosahedron; `subdivisions = s` gives `5 * 4^s + 1`
    /// half-sphere vertices.
    pub fn icosahedron(subdivisions: usize) -> Result<Self> {
        if subdivisions > 6 {
            bail!("At most 6 subdivisions are supported.");
        }
        let (vertices, faces) = create_icosphere(subdivisions);
        let (vertices, faces) = pair_antipodes(vertices, faces)?;
        let half_vertices_count = vertices.len() / 2;
        Ok(Self {
            vertices,
            faces,
            half_vertices_count,
        })
    }

    /// Wraps an externally supplied table; vertices must be unit length and
    /// ordered so that `i + half` is the antipode of `i`.
    pub fn from_parts(vertices: Vec<Vec3>, faces: Vec<[usize; 3]>) -> Result<Self> {
        if vertices.is_empty() || vertices.len() % 2 != 0 {
            bail!("A tessellation needs an even, non-zero number of vertices.");
        }
        let half = vertices.len() / 2;
        for (i, v) in vertices.iter().enumerate() {
            if (v.norm() - 1.0).abs() > 1e-3 {
                bail!("Vertex {} is not unit length.", i);
            }
        }
        for i in 0..half {
            if (vertices[i] + vertices[i + half]).norm() > 1e-3 {
                bail!("Vertex {} is not the antipode of vertex {}.", i + half, i);
            }
        }
        if let Some(face) = faces.iter().find(|f| f.iter().any(|&v| v >= vertices.len())) {
            bail!("Face {:?} references a missing vertex.", face);
        }
        Ok(Self {
            vertices,
            faces,
            half_vertices_count: half,
        })
    }

    pub fn half_vertices_count(&self) -> usize {
        self.half_vertices_count
    }

    pub fn vertices_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, index: usize) -> Vec3 {
        self.vertices[index]
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    pub fn vertices_cos(&self, i: usize, j: usize) -> f32 {
        self.vertices[i].dot(&self.vertices[j])
    }

    /// Half-sphere vertex closest to the axis of `direction`.
    pub fn nearest_vertex(&self, direction: &Vec3) -> usize {
        let mut best = 0;
        let mut best_cos = f32::MIN;
        for i in 0..self.half_vertices_count {
            let cos = self.vertices[i].dot(direction).abs();
            if cos > best_cos {
                best_cos = cos;
                best = i;
            }
        }
        best
    }
}

fn create_icosphere(subdivisions: usize) -> (Vec<[f64; 3]>, Vec<[usize; 3]>) {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;

    let mut vertices: Vec<[f64; 3]> = vec![
        [-1.0, phi, 0.0],
        [1.0, phi, 0.0],
        [-1.0, -phi, 0.0],
        [1.0, -phi, 0.0],
        [0.0, -1.0, phi],
        [0.0, 1.0, phi],
        [0.0, -1.0, -phi],
        [0.0, 1.0, -phi],
        [phi, 0.0, -1.0],
        [phi, 0.0, 1.0],
        [-phi, 0.0, -1.0],
        [-phi, 0.0, 1.0],
    ];
    vertices.iter_mut().for_each(normalize);

    let mut faces: Vec<[usize; 3]> = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    for _ in 0..subdivisions {
        let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
        let mut next_faces = Vec::with_capacity(faces.len() * 4);
        let mut midpoint = |a: usize, b: usize, vertices: &mut Vec<[f64; 3]>| -> usize {
            let key = if a < b { (a, b) } else { (b, a) };
            if let Some(&index) = midpoints.get(&key) {
                return index;
            }
            let (va, vb) = (vertices[a], vertices[b]);
            let mut mid = [
                (va[0] + vb[0]) / 2.0,
                (va[1] + vb[1]) / 2.0,
                (va[2] + vb[2]) / 2.0,
            ];
            normalize(&mut mid);
            vertices.push(mid);
            midpoints.insert(key, vertices.len() - 1);
            vertices.len() - 1
        };
        for &[v0, v1, v2] in &faces {
            let m01 = midpoint(v0, v1, &mut vertices);
            let m12 = midpoint(v1, v2, &mut vertices);
            let m20 = midpoint(v2, v0, &mut vertices);
            next_faces.push([v0, m01, m20]);
            next_faces.push([v1, m12, m01]);
            next_faces.push([v2, m20, m12]);
            next_faces.push([m01, m12, m20]);
        }
        faces = next_faces;
    }

    (vertices, faces)
}

fn normalize(v: &mut [f64; 3]) {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    v.iter_mut().for_each(|c| *c /= norm);
}

fn in_upper_hemisphere(v: &[f64; 3]) -> bool {
    const EPS: f64 = 1e-9;
    if v[2].abs() > EPS {
        return v[2] > 0.0;
    }
    if v[1].abs() > EPS {
        return v[1] > 0.0;
    }
    v[0] > 0.0
}

/// Reorders vertices so the upper hemisphere comes first and each lower
/// vertex sits `half` slots after its antipode; faces are remapped.
fn pair_antipodes(
    vertices: Vec<[f64; 3]>,
    faces: Vec<[usize; 3]>,
) -> Result<(Vec<Vec3>, Vec<[usize; 3]>)> {
    let upper: Vec<usize> = (0..vertices.len())
        .filter(|&i| in_upper_hemisphere(&vertices[i]))
        .collect();
    let half = upper.len();
    if half * 2 != vertices.len() {
        bail!("Tessellation is not antipodally symmetric.");
    }

    let mut remap = vec![usize::MAX; vertices.len()];
    for (slot, &i) in upper.iter().enumerate() {
        remap[i] = slot;
    }
    for (slot, &i) in upper.iter().enumerate() {
        let target = [-vertices[i][0], -vertices[i][1], -vertices[i][2]];
        let antipode = (0..vertices.len())
            .filter(|&j| remap[j] == usize::MAX)
            .min_by(|&a, &b| {
                distance2(&vertices[a], &target).total_cmp(&distance2(&vertices[b], &target))
            });
        match antipode {
            Some(j) if distance2(&vertices[j], &target) < 1e-12 => remap[j] = slot + half,
            _ => bail!("Vertex {} has no antipode.", i),
        }
    }

    let mut ordered = vec![Vec3::zeros(); vertices.len()];
    for (i, v) in vertices.iter().enumerate() {
        ordered[remap[i]] = Vec3::new(v[0] as f32, v[1] as f32, v[2] as f32);
    }
    let faces = faces
        .iter()
        .map(|f| [remap[f[0]], remap[f[1]], remap[f[2]]])
        .collect();
    Ok((ordered, faces))
}

fn distance2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}
