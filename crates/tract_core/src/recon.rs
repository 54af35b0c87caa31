//! Turns a volume of ODF samples into a finalized `OrientedField`.
//!
//! Work is split into stages run in sequence: every stage is initialized,
//! then each voxel passes through every stage, then every stage finalizes
//! into the shared output.

use crate::field::{OrientedField, VolumeShape};
use crate::odf::{FiberOrientationResolver, PeakPolicy};
use crate::tessellation::Tessellation;
use anyhow::{anyhow, bail, Result};
use log::{debug, info};

/// Half-sphere ODF samples for every voxel, voxel-major.
#[derive(Debug, Clone)]
pub struct OdfVolume {
    shape: VolumeShape,
    voxel_size: [f32; 3],
    half_vertices_count: usize,
    samples: Vec<f32>,
    mask: Option<Vec<bool>>,
}

impl OdfVolume {
    pub fn new(
        shape: VolumeShape,
        voxel_size: [f32; 3],
        half_vertices_count: usize,
        samples: Vec<f32>,
    ) -> Result<Self> {
        if half_vertices_count == 0 {
            bail!("ODF volumes need at least one sample per voxel.");
        }
        if samples.len() != shape.size() * half_vertices_count {
            bail!(
                "Expected {} ODF samples ({} voxels x {}), got {}.",
                shape.size() * half_vertices_count,
                shape.size(),
                half_vertices_count,
                samples.len()
            );
        }
        Ok(Self {
            shape,
            voxel_size,
            half_vertices_count,
            samples,
            mask: None,
        })
    }

    /// Restricts processing to voxels where `mask` is set.
    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != self.shape.size() {
            bail!("Mask has {} voxels, volume has {}.", mask.len(), self.shape.size());
        }
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn voxel_size(&self) -> [f32; 3] {
        self.voxel_size
    }

    pub fn half_vertices_count(&self) -> usize {
        self.half_vertices_count
    }

    pub fn voxel_odf(&self, index: usize) -> &[f32] {
        let n = self.half_vertices_count;
        &self.samples[index * n..(index + 1) * n]
    }

    pub fn is_masked_in(&self, index: usize) -> bool {
        self.mask.as_ref().map_or(true, |m| m[index])
    }
}

/// Shared configuration and running state of one reconstruction.
#[derive(Debug, Clone)]
pub struct ReconContext {
    pub shape: VolumeShape,
    pub voxel_size: [f32; 3],
    pub max_fiber_number: usize,
    pub policy: PeakPolicy,
    pub tessellation: Tessellation,
    /// Largest isotropic component seen so far.
    pub z0: f32,
}

/// Per-voxel scratch passed through the stages.
#[derive(Debug, Clone)]
pub struct VoxelData {
    pub voxel_index: usize,
    pub odf: Vec<f32>,
    pub min_odf: f32,
    pub dir_index: Vec<usize>,
    pub fa: Vec<f32>,
}

impl VoxelData {
    fn reset(&mut self, voxel_index: usize, odf: &[f32]) {
        self.voxel_index = voxel_index;
        self.odf.clear();
        self.odf.extend_from_slice(odf);
        self.min_odf = 0.0;
        self.dir_index.iter_mut().for_each(|d| *d = 0);
        self.fa.iter_mut().for_each(|f| *f = 0.0);
    }
}

/// Everything the stages produce.
#[derive(Debug, Clone, Default)]
pub struct ReconOutput {
    pub fa: Vec<Vec<f32>>,
    pub dir_index: Vec<Vec<usize>>,
    pub iso: Vec<f32>,
    pub gfa: Vec<f32>,
    pub z0: f32,
}

impl ReconOutput {
    /// Builds the tracking field from peak indices and normalized anisotropy.
    pub fn build_field(&self, context: &ReconContext) -> Result<OrientedField> {
        if self.fa.is_empty() || self.dir_index.len() != self.fa.len() {
            bail!("Reconstruction produced no fiber slots.");
        }
        let size = context.shape.size();
        let mut dir = vec![vec![0.0f32; size * 3]; self.fa.len()];
        for (slot, indices) in self.dir_index.iter().enumerate() {
            for (voxel, &vertex) in indices.iter().enumerate() {
                if self.fa[slot][voxel] <= 0.0 {
                    continue;
                }
                let v = context.tessellation.vertex(vertex);
                dir[slot][voxel * 3..voxel * 3 + 3].copy_from_slice(&[v.x, v.y, v.z]);
            }
        }
        OrientedField::new(context.shape, context.voxel_size, self.fa.clone(), dir)
    }
}

pub trait ReconstructionStage: Send {
    fn name(&self) -> &'static str;
    fn init(&mut self, context: &mut ReconContext) -> Result<()>;
    fn run(&mut self, context: &mut ReconContext, data: &mut VoxelData) -> Result<()>;
    fn finalize(&mut self, context: &mut ReconContext, output: &mut ReconOutput) -> Result<()>;
}

/// Resolves peak directions and strengths for each voxel.
#[derive(Debug, Default)]
pub struct DetermineFiberDirections {
    resolver: Option<FiberOrientationResolver>,
}

impl ReconstructionStage for DetermineFiberDirections {
    fn name(&self) -> &'static str {
        "determine_fiber_directions"
    }

    fn init(&mut self, context: &mut ReconContext) -> Result<()> {
        self.resolver = Some(FiberOrientationResolver::new(
            &context.tessellation,
            context.policy,
            context.max_fiber_number,
        )?);
        Ok(())
    }

    fn run(&mut self, _context: &mut ReconContext, data: &mut VoxelData) -> Result<()> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| anyhow!("Stage '{}' was not initialized.", self.name()))?;
        data.min_odf = data.odf.iter().fold(f32::MAX, |a, &b| a.min(b));
        for (slot, peak) in resolver.resolve(&data.odf)?.into_iter().enumerate() {
            data.dir_index[slot] = peak.direction_index;
            data.fa[slot] = peak.strength;
        }
        Ok(())
    }

    fn finalize(&mut self, _context: &mut ReconContext, _output: &mut ReconOutput) -> Result<()> {
        Ok(())
    }
}

/// Records anisotropy, isotropic component and GFA, normalized by `z0`.
#[derive(Debug, Default)]
pub struct RecordMetrics {
    fa: Vec<Vec<f32>>,
    dir_index: Vec<Vec<usize>>,
    iso: Vec<f32>,
    gfa: Vec<f32>,
}

impl ReconstructionStage for RecordMetrics {
    fn name(&self) -> &'static str {
        "record_metrics"
    }

    fn init(&mut self, context: &mut ReconContext) -> Result<()> {
        let size = context.shape.size();
        self.fa = vec![vec![0.0; size]; context.max_fiber_number];
        self.dir_index = vec![vec![0; size]; context.max_fiber_number];
        self.iso = vec![0.0; size];
        self.gfa = vec![0.0; size];
        context.z0 = 0.0;
        Ok(())
    }

    fn run(&mut self, context: &mut ReconContext, data: &mut VoxelData) -> Result<()> {
        let v = data.voxel_index;
        self.iso[v] = data.min_odf;
        self.gfa[v] = generalized_fa(&data.odf);
        for slot in 0..context.max_fiber_number {
            self.fa[slot][v] = data.fa[slot];
            self.dir_index[slot][v] = data.dir_index[slot];
        }
        if data.min_odf > context.z0 {
            context.z0 = data.min_odf;
        }
        Ok(())
    }

    fn finalize(&mut self, context: &mut ReconContext, output: &mut ReconOutput) -> Result<()> {
        if context.z0 + 1.0 == 1.0 {
            context.z0 = 1.0;
        }
        let z0 = context.z0;
        for slot in self.fa.iter_mut() {
            slot.iter_mut().for_each(|f| *f /= z0);
        }
        self.iso.iter_mut().for_each(|f| *f /= z0);

        output.fa = std::mem::take(&mut self.fa);
        output.dir_index = std::mem::take(&mut self.dir_index);
        output.iso = std::mem::take(&mut self.iso);
        output.gfa = std::mem::take(&mut self.gfa);
        output.z0 = z0;
        Ok(())
    }
}

/// Generalized fractional anisotropy of one ODF.
pub fn generalized_fa(odf: &[f32]) -> f32 {
    let n = odf.len() as f32;
    if odf.len() < 2 {
        return 0.0;
    }
    let (m1, m2) = odf
        .iter()
        .fold((0.0f32, 0.0f32), |(s, s2), &t| (s + t, s2 + t * t));
    if m2 == 0.0 {
        return 0.0;
    }
    let spread = (m2 - m1 * m1 / n).max(0.0);
    (n / (n - 1.0) * spread / m2).sqrt()
}

pub struct ReconstructionPipeline {
    stages: Vec<Box<dyn ReconstructionStage>>,
}

impl ReconstructionPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Peak extraction followed by metric recording.
    pub fn standard() -> Self {
        let mut pipeline = Self::new();
        pipeline.push(Box::new(DetermineFiberDirections::default()));
        pipeline.push(Box::new(RecordMetrics::default()));
        pipeline
    }

    pub fn push(&mut self, stage: Box<dyn ReconstructionStage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&mut self, volume: &OdfVolume, context: &mut ReconContext) -> Result<ReconOutput> {
        if volume.half_vertices_count() != context.tessellation.half_vertices_count() {
            bail!(
                "ODF volume has {} samples per voxel but the tessellation has {} half-sphere vertices.",
                volume.half_vertices_count(),
                context.tessellation.half_vertices_count()
            );
        }
        if volume.shape() != context.shape {
            bail!("ODF volume shape does not match the reconstruction shape.");
        }
        if context.max_fiber_number == 0 {
            bail!("max_fiber_number must be at least 1.");
        }

        for stage in self.stages.iter_mut() {
            debug!("initializing stage {}", stage.name());
            stage.init(context)?;
        }

        let mut data = VoxelData {
            voxel_index: 0,
            odf: Vec::with_capacity(volume.half_vertices_count()),
            min_odf: 0.0,
            dir_index: vec![0; context.max_fiber_number],
            fa: vec![0.0; context.max_fiber_number],
        };
        let mut processed = 0usize;
        for index in 0..context.shape.size() {
            if !volume.is_masked_in(index) {
                continue;
            }
            data.reset(index, volume.voxel_odf(index));
            for stage in self.stages.iter_mut() {
                stage.run(context, &mut data)?;
            }
            processed += 1;
        }

        let mut output = ReconOutput::default();
        for stage in self.stages.iter_mut() {
            stage.finalize(context, &mut output)?;
        }
        info!(
            "reconstructed {} voxels with {} stages, z0 = {}",
            processed,
            self.stages.len(),
            output.z0
        );
        Ok(output)
    }
}

impl Default for ReconstructionPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

/// Runs the standard pipeline and builds the tracking field.
pub fn reconstruct_field(
    volume: &OdfVolume,
    tessellation: Tessellation,
    policy: PeakPolicy,
    max_fiber_number: usize,
) -> Result<(OrientedField, ReconOutput)> {
    let mut context = ReconContext {
        shape: volume.shape(),
        voxel_size: volume.voxel_size(),
        max_fiber_number,
        policy,
        tessellation,
        z0: 0.0,
    };
    let output = ReconstructionPipeline::standard().run(volume, &mut context)?;
    let field = output.build_field(&context)?;
    Ok((field, output))
}
