//! Per-streamline state machine: seeding, bidirectional stepping, buffer
//! management and acceptance gating.

use crate::field::OrientedField;
use crate::interpolation::{FieldInterpolator, InterpolationKind, SamplingThresholds};
use crate::params::{InitialDirection, TrackingMethodKind, TrackingParameters, MAX_TRACE_POINTS};
use crate::random::SeedRng;
use crate::roi::RegionConstraintSet;
use crate::solvers::StepRule;
use crate::traits::{DirectionField, StepOutcome, StepSettings, StepState, Vec3};
use anyhow::{bail, Result};

/// Settings drawn once per streamline from the run parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingSettings {
    pub fa_threshold: f32,
    pub dt_threshold: f32,
    pub cull_cos_angle: f32,
    pub smoothing: f32,
    pub step_size_mm: f32,
    pub step_in_voxel: Vec3,
    pub min_points: usize,
    pub max_points: usize,
    pub method: TrackingMethodKind,
    pub interpolation: InterpolationKind,
    pub initial: InitialDirection,
    pub check_ending: bool,
}

impl TrackingSettings {
    /// Resolves sentinel parameters with draws from `rng`.
    ///
    /// `otsu` is the slot-0 Otsu threshold of the field; it scales the
    /// random anisotropy threshold.
    pub fn draw(
        params: &TrackingParameters,
        voxel_size: [f32; 3],
        otsu: f32,
        rng: &mut SeedRng,
    ) -> Result<Self> {
        let method = params.method()?;
        let initial = params.initial()?;
        let interpolation = match method {
            TrackingMethodKind::Voxel => InterpolationKind::Nearest,
            _ => params.interpolation()?,
        };

        let fa_threshold = if params.threshold == 0.0 {
            rng.uniform_range(0.5, 1.0) * otsu * params.default_otsu
        } else {
            params.threshold
        };
        let cull_cos_angle = if params.cull_cos_angle == 1.0 {
            rng.uniform_range(15.0, 90.0).to_radians().cos()
        } else {
            params.cull_cos_angle
        };
        let smoothing = if params.smooth_fraction == 1.0 {
            rng.uniform_range(0.0, 0.95)
        } else {
            params.smooth_fraction
        };
        let step_size_mm = if params.step_size == 0.0 {
            rng.uniform_range(0.5, 1.5) * voxel_size[0]
        } else {
            params.step_size
        };
        if !step_size_mm.is_finite() || step_size_mm <= 0.0 {
            bail!("Step size must be positive, got {}.", step_size_mm);
        }
        if params.max_length / step_size_mm > MAX_TRACE_POINTS as f32 {
            bail!(
                "Step size {} mm is too small for a maximum length of {} mm.",
                step_size_mm,
                params.max_length
            );
        }

        Ok(Self {
            fa_threshold,
            dt_threshold: params.dt_threshold,
            cull_cos_angle,
            smoothing,
            step_size_mm,
            step_in_voxel: Vec3::new(
                step_size_mm / voxel_size[0],
                step_size_mm / voxel_size[1],
                step_size_mm / voxel_size[2],
            ),
            min_points: (params.min_length / step_size_mm).ceil().max(1.0) as usize,
            max_points: (params.max_length / step_size_mm).floor() as usize + 1,
            method,
            interpolation,
            initial,
            check_ending: params.check_ending != 0,
        })
    }

    fn step_settings(&self) -> StepSettings {
        StepSettings {
            step_in_voxel: self.step_in_voxel,
            smoothing: self.smoothing,
            cull_cos_angle: self.cull_cos_angle,
        }
    }

    fn thresholds(&self) -> SamplingThresholds {
        SamplingThresholds {
            fa_threshold: self.fa_threshold,
            cull_cos_angle: self.cull_cos_angle,
            dt_threshold: self.dt_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoInitialDirection,
    Excluded,
    Overflow,
    TooShort,
    MissingInclude,
    EndPoint,
    PrematureEnding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorState {
    Init,
    ForwardTracing,
    BackwardTracing,
    Accepted,
    Rejected(RejectReason),
}

/// Traces one streamline at a time into a reusable buffer.
///
/// The buffer holds `2 * max_points` points; the seed sits in the middle,
/// the forward half grows toward the back and the backward half toward the
/// front.
#[derive(Debug, Clone)]
pub struct StreamlineIntegrator {
    buffer: Vec<f32>,
    reverse: Vec<f32>,
    smoothed: Vec<f32>,
    front: usize,
    back: usize,
    state: IntegratorState,
    init_fib_index: usize,
    rule: StepRule,
}

impl Default for StreamlineIntegrator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamlineIntegrator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            reverse: Vec::new(),
            smoothed: Vec::new(),
            front: 0,
            back: 0,
            state: IntegratorState::Init,
            init_fib_index: 0,
            rule: StepRule::build(TrackingMethodKind::Euler),
        }
    }

    pub fn state(&self) -> IntegratorState {
        self.state
    }

    pub fn point_count(&self) -> usize {
        (self.back - self.front) / 3
    }

    /// Capacity of the trace buffer in floats.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.len()
    }

    /// True while the all-directions policy has untried peaks at the last
    /// seed.
    pub fn has_pending_direction(&self) -> bool {
        self.init_fib_index != 0
    }

    /// Picks the starting direction at `seed`.
    pub fn init_direction(
        &mut self,
        field: &OrientedField,
        sampler: &impl DirectionField,
        settings: &TrackingSettings,
        seed: &Vec3,
        rng: &mut SeedRng,
    ) -> Option<Vec3> {
        let index = field.shape().index_of_point(seed)?;
        match settings.initial {
            InitialDirection::Principal => {
                let fa = field.anisotropy(index, 0);
                if fa == 0.0 || fa < settings.fa_threshold {
                    return None;
                }
                Some(field.direction(index, 0))
            }
            InitialDirection::Random => {
                for _ in 0..10 {
                    let guess = rng.unit_vector();
                    if let Some(direction) = sampler.sample(seed, &guess) {
                        return Some(direction);
                    }
                }
                None
            }
            InitialDirection::AllDirections => {
                let slot = self.init_fib_index;
                if slot >= field.fib_num() {
                    self.init_fib_index = 0;
                    return None;
                }
                let fa = field.anisotropy(index, slot);
                if fa == 0.0 || fa < settings.fa_threshold {
                    self.init_fib_index = 0;
                    return None;
                }
                self.init_fib_index = if slot + 1 < field.fib_num() { slot + 1 } else { 0 };
                Some(field.direction(index, slot))
            }
        }
    }

    /// Runs the full state machine from `seed`. Returns the accepted points
    /// (flat xyz, canonical orientation) or `None` on rejection.
    pub fn trace(
        &mut self,
        field: &OrientedField,
        roi: &RegionConstraintSet,
        settings: &TrackingSettings,
        seed: Vec3,
        rng: &mut SeedRng,
    ) -> Option<&[f32]> {
        self.state = IntegratorState::Init;
        self.prepare(settings);
        let seed = match settings.method {
            TrackingMethodKind::Voxel => seed.map(|v| v.round()),
            _ => seed,
        };
        let sampler = FieldInterpolator::new(field, settings.interpolation, settings.thresholds());

        let Some(direction) = self.init_direction(field, &sampler, settings, &seed, rng) else {
            return self.reject(RejectReason::NoInitialDirection);
        };

        if let Err(reason) = self.run_halves(roi, &sampler, settings, seed, direction) {
            return self.reject(reason);
        }

        if settings.method == TrackingMethodKind::Voxel {
            self.smooth_voxel_trace();
        }
        self.state = IntegratorState::Accepted;
        Some(self.canonical_result())
    }

    fn reject(&mut self, reason: RejectReason) -> Option<&[f32]> {
        self.state = IntegratorState::Rejected(reason);
        None
    }

    fn prepare(&mut self, settings: &TrackingSettings) {
        let half = settings.max_points * 3;
        if self.buffer.len() != half * 2 {
            self.buffer.resize(half * 2, 0.0);
            self.reverse.resize(half * 2, 0.0);
        }
        self.front = half;
        self.back = half;
        if self.rule.kind() != settings.method {
            self.rule = StepRule::build(settings.method);
        }
    }

    fn push_back(&mut self, p: &Vec3) {
        self.buffer[self.back..self.back + 3].copy_from_slice(&[p.x, p.y, p.z]);
        self.back += 3;
    }

    fn push_front(&mut self, p: &Vec3) {
        self.front -= 3;
        self.buffer[self.front..self.front + 3].copy_from_slice(&[p.x, p.y, p.z]);
    }

    fn run_halves(
        &mut self,
        roi: &RegionConstraintSet,
        sampler: &FieldInterpolator<'_>,
        settings: &TrackingSettings,
        seed: Vec3,
        direction: Vec3,
    ) -> std::result::Result<(), RejectReason> {
        let step_settings = settings.step_settings();

        self.state = IntegratorState::ForwardTracing;
        let mut walker = StepState {
            position: seed,
            direction,
        };
        let mut forward_stop = None;
        loop {
            if self.point_count() >= settings.max_points || self.back + 3 > self.buffer.len() {
                return Err(RejectReason::Overflow);
            }
            if roi.is_excluded_point(&walker.position) {
                return Err(RejectReason::Excluded);
            }
            self.push_back(&walker.position);
            if roi.is_terminate_point(&walker.position) {
                break;
            }
            if self.rule.step(sampler, &mut walker, &step_settings) == StepOutcome::Stopped {
                forward_stop = Some(walker.position);
                break;
            }
        }

        self.state = IntegratorState::BackwardTracing;
        let mut walker = StepState {
            position: seed,
            direction: -direction,
        };
        let mut backward_stop = None;
        loop {
            if self.rule.step(sampler, &mut walker, &step_settings) == StepOutcome::Stopped {
                backward_stop = Some(walker.position);
                break;
            }
            if self.point_count() >= settings.max_points || self.front < 3 {
                return Err(RejectReason::Overflow);
            }
            if roi.is_excluded_point(&walker.position) {
                return Err(RejectReason::Excluded);
            }
            self.push_front(&walker.position);
            if roi.is_terminate_point(&walker.position) {
                break;
            }
        }

        if self.point_count() < settings.min_points {
            return Err(RejectReason::TooShort);
        }
        if !roi.have_include(&self.buffer[self.front..self.back]) {
            return Err(RejectReason::MissingInclude);
        }
        let head = self.point_at(self.front);
        let tail = self.point_at(self.back - 3);
        if !roi.fulfill_end_point(&head, &tail) {
            return Err(RejectReason::EndPoint);
        }
        if settings.check_ending {
            let in_tissue = |stop: Option<Vec3>| {
                stop.map_or(false, |p| {
                    let fa = sampler.anisotropy_at(&p);
                    fa > 0.0 && fa >= settings.fa_threshold
                })
            };
            if in_tissue(forward_stop) || in_tissue(backward_stop) {
                return Err(RejectReason::PrematureEnding);
            }
        }
        Ok(())
    }

    fn point_at(&self, at: usize) -> Vec3 {
        Vec3::new(self.buffer[at], self.buffer[at + 1], self.buffer[at + 2])
    }

    /// 5-tap (1,2,4,2,1) smoothing over neighboring points; taps past either
    /// end are left out of the weighted mean.
    fn smooth_voxel_trace(&mut self) {
        const WEIGHTS: [f32; 5] = [1.0, 2.0, 4.0, 2.0, 1.0];
        const OFFSETS: [isize; 5] = [-6, -3, 0, 3, 6];
        self.smoothed.clear();
        self.smoothed.resize(self.back - self.front, 0.0);
        for index in self.front..self.back {
            let mut sum = 0.0;
            let mut sum_w = 0.0;
            for (w, offset) in WEIGHTS.iter().zip(OFFSETS.iter()) {
                let at = index as isize + offset;
                if at < self.front as isize || at >= self.back as isize {
                    continue;
                }
                sum += w * self.buffer[at as usize];
                sum_w += w;
            }
            self.smoothed[index - self.front] = sum / sum_w;
        }
        let (front, back) = (self.front, self.back);
        self.buffer[front..back].copy_from_slice(&self.smoothed);
    }

    fn canonical_result(&mut self) -> &[f32] {
        let len = self.back - self.front;
        if needs_reversal(&self.buffer[self.front..self.back]) {
            reverse_points(&self.buffer[self.front..self.back], &mut self.reverse[..len]);
            &self.reverse[..len]
        } else {
            &self.buffer[self.front..self.back]
        }
    }
}

/// True when the head-to-tail displacement is negative along a strictly
/// dominant axis.
pub fn needs_reversal(points: &[f32]) -> bool {
    if points.len() < 6 {
        return false;
    }
    let n = points.len();
    let d = [
        points[n - 3] - points[0],
        points[n - 2] - points[1],
        points[n - 1] - points[2],
    ];
    let a = d.map(f32::abs);
    (a[0] > a[1] && a[0] > a[2] && d[0] < 0.0)
        || (a[1] > a[0] && a[1] > a[2] && d[1] < 0.0)
        || (a[2] > a[1] && a[2] > a[0] && d[2] < 0.0)
}

/// Copies `points` into `out` in reverse point order.
pub fn reverse_points(points: &[f32], out: &mut [f32]) {
    for (dst, src) in out.chunks_exact_mut(3).zip(points.chunks_exact(3).rev()) {
        dst.copy_from_slice(src);
    }
}

/// Reverses `points` in place when its orientation is not canonical.
pub fn canonicalize(points: &mut Vec<f32>) {
    if needs_reversal(points) {
        let mut reversed = vec![0.0; points.len()];
        reverse_points(points, &mut reversed);
        *points = reversed;
    }
}
