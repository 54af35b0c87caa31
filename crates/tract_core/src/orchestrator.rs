//! Multi-threaded seeding loop and its single-threaded stepped twin.

use crate::error::TrackingError;
use crate::field::OrientedField;
use crate::params::{InitialDirection, TrackingParameters};
use crate::random::{clock_entropy, SeedRng};
use crate::roi::{RegionConstraintSet, RegionRole};
use crate::tract::TractCollection;
use crate::tracking::{StreamlineIntegrator, TrackingSettings};
use crate::traits::Vec3;
use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Attempt cap per requested tract when stopping by tract count without an
/// explicit seed budget.
const ATTEMPTS_PER_TRACT: usize = 1000;

/// Worker count used when the caller does not pick one.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Read-only inputs shared by every worker of one run.
#[derive(Debug, Clone)]
struct RunContext {
    field: Arc<OrientedField>,
    roi: Arc<RegionConstraintSet>,
    params: TrackingParameters,
    otsu: f32,
    attempt_limit: usize,
    accept_limit: usize,
}

impl RunContext {
    fn new(
        field: Arc<OrientedField>,
        roi: Arc<RegionConstraintSet>,
        params: TrackingParameters,
        otsu: f32,
    ) -> Self {
        let termination = params.termination_count as usize;
        let max_seeds = params.max_seed_count as usize;
        let (attempt_limit, accept_limit) = if params.stop_by_tract != 0 {
            let attempts = if max_seeds > 0 {
                max_seeds
            } else {
                termination.saturating_mul(ATTEMPTS_PER_TRACT)
            };
            (attempts, termination)
        } else {
            let attempts = match (termination, max_seeds) {
                (0, m) => m,
                (t, 0) => t,
                (t, m) => t.min(m),
            };
            (attempts, usize::MAX)
        };
        Self {
            field,
            roi,
            params,
            otsu,
            attempt_limit,
            accept_limit,
        }
    }
}

/// Counters and the accepted-streamline store shared across workers.
#[derive(Debug, Default)]
struct SharedState {
    terminated: AtomicBool,
    seed_attempts: AtomicUsize,
    accepted: AtomicUsize,
    running: AtomicUsize,
    tracts: Mutex<Vec<Vec<f32>>>,
}

impl SharedState {
    fn claim_attempt(&self, limit: usize) -> Option<usize> {
        if self.terminated.load(Ordering::Relaxed) {
            return None;
        }
        self.seed_attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
    }

    fn claim_accept(&self, limit: usize) -> bool {
        self.accepted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn store(&self, points: &[f32]) -> Result<()> {
        let mut tracts = self
            .tracts
            .lock()
            .map_err(|_| anyhow!("Streamline store lock was poisoned."))?;
        tracts.push(points.to_vec());
        Ok(())
    }

    fn take_tracts(&self) -> Result<Vec<Vec<f32>>> {
        let mut tracts = self
            .tracts
            .lock()
            .map_err(|_| anyhow!("Streamline store lock was poisoned."))?;
        Ok(std::mem::take(&mut *tracts))
    }
}

/// Decrements the running-worker count when a worker exits, including by
/// panic; a panicking worker also stops the others.
struct RunningGuard<'a>(&'a SharedState);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.terminated.store(true, Ordering::Release);
        }
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One worker's integrator, random stream and all-directions seed memory.
struct SeedingWorker {
    id: u32,
    integrator: StreamlineIntegrator,
    rng: SeedRng,
    pending_seed: Option<Vec3>,
    attempts: usize,
}

impl SeedingWorker {
    fn new(id: u32, entropy: u32) -> Self {
        Self {
            id,
            integrator: StreamlineIntegrator::new(),
            rng: SeedRng::for_worker(id, entropy),
            pending_seed: None,
            attempts: 0,
        }
    }

    /// Runs one seed attempt; `Ok(false)` once the run is over.
    fn run_one(&mut self, ctx: &RunContext, shared: &SharedState) -> Result<bool> {
        if shared.accepted.load(Ordering::Acquire) >= ctx.accept_limit {
            return Ok(false);
        }
        let Some(attempt) = shared.claim_attempt(ctx.attempt_limit) else {
            return Ok(false);
        };
        self.attempts += 1;

        let seed = match self.pending_seed.take() {
            Some(seed) => seed,
            None => self.draw_seed(ctx, attempt)?,
        };
        let settings = TrackingSettings::draw(
            &ctx.params,
            ctx.field.voxel_size(),
            ctx.otsu,
            &mut self.rng,
        )?;
        let accepted = self
            .integrator
            .trace(&ctx.field, &ctx.roi, &settings, seed, &mut self.rng);
        if let Some(points) = accepted {
            if shared.claim_accept(ctx.accept_limit) {
                shared.store(points)?;
            }
        }
        if settings.initial == InitialDirection::AllDirections
            && self.integrator.has_pending_direction()
        {
            self.pending_seed = Some(seed);
        }
        Ok(true)
    }

    fn draw_seed(&mut self, ctx: &RunContext, attempt: usize) -> Result<Vec3> {
        let count = ctx.roi.seed_count();
        if count == 0 {
            return Err(TrackingError::NoSeedRegion("the seed list is empty".to_string()).into());
        }
        let position = if ctx.params.center_seed != 0 {
            ctx.roi.seed_position(attempt % count, None)
        } else {
            let index = self.rng.below(count);
            ctx.roi.seed_position(index, Some(&mut self.rng))
        };
        position.ok_or_else(|| anyhow!("Seed {} is out of range.", attempt))
    }
}

/// Snapshot of a run's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackingProgress {
    pub seed_count: usize,
    pub tract_count: usize,
    pub done: bool,
}

/// Owns the global parameters and drives tracking over a field.
#[derive(Debug, Clone)]
pub struct TrackingOrchestrator {
    field: Arc<OrientedField>,
    roi: Arc<RegionConstraintSet>,
    params: TrackingParameters,
    otsu: f32,
}

impl TrackingOrchestrator {
    pub fn new(
        field: Arc<OrientedField>,
        roi: RegionConstraintSet,
        params: TrackingParameters,
    ) -> Result<Self> {
        params.validate()?;
        if roi.shape() != field.shape() {
            return Err(TrackingError::FieldShapeMismatch(format!(
                "regions are defined on {:?} but the field is {:?}",
                roi.shape(),
                field.shape()
            ))
            .into());
        }
        let otsu = field.otsu_threshold();
        Ok(Self {
            field,
            roi: Arc::new(roi),
            params,
            otsu,
        })
    }

    pub fn field(&self) -> &OrientedField {
        &self.field
    }

    pub fn params(&self) -> &TrackingParameters {
        &self.params
    }

    pub fn roi(&self) -> &RegionConstraintSet {
        &self.roi
    }

    /// Mutable regions; clones them if a running job still holds them.
    pub fn roi_mut(&mut self) -> &mut RegionConstraintSet {
        Arc::make_mut(&mut self.roi)
    }

    pub fn otsu_threshold(&self) -> f32 {
        self.otsu
    }

    /// Parameter report followed by the region summary.
    pub fn report(&self) -> String {
        format!("{}{}", self.params.report(), self.roi.summary())
    }

    /// Falls back to whole-brain seeding when no seed region is set.
    fn ensure_seeds(&mut self) -> Result<()> {
        if self.roi.has_seeds() {
            return Ok(());
        }
        let threshold = if self.params.threshold == 0.0 {
            self.otsu * self.params.default_otsu
        } else {
            self.params.threshold
        };
        let field = Arc::clone(&self.field);
        let added = self.roi_mut().set_whole_brain_seed(&field, threshold);
        if added == 0 {
            return Err(TrackingError::NoSeedRegion(format!(
                "no voxel exceeds the whole-brain threshold {}",
                threshold
            ))
            .into());
        }
        Ok(())
    }

    fn context(&mut self) -> Result<RunContext> {
        self.ensure_seeds()?;
        Ok(RunContext::new(
            Arc::clone(&self.field),
            Arc::clone(&self.roi),
            self.params,
            self.otsu,
        ))
    }

    /// Spawns `thread_count` workers and returns immediately.
    pub fn start(&mut self, thread_count: usize) -> Result<TrackingJob> {
        if thread_count == 0 {
            return Err(TrackingError::InvalidThreadCount(thread_count).into());
        }
        let ctx = self.context()?;
        let entropy = if self.params.random_seed != 0 {
            clock_entropy()
        } else {
            0
        };
        info!(
            "tracking started: {} seed voxels, {} threads, seed budget {}",
            ctx.roi.seed_count(),
            thread_count,
            ctx.attempt_limit
        );

        let shared = Arc::new(SharedState::default());
        shared.running.store(thread_count, Ordering::Release);
        let mut handles = Vec::with_capacity(thread_count);
        for id in 0..thread_count {
            let ctx = ctx.clone();
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("tracking-{}", id))
                .spawn(move || {
                    let _running = RunningGuard(&worker_shared);
                    let mut worker = SeedingWorker::new(id as u32, entropy);
                    let result = loop {
                        match worker.run_one(&ctx, &worker_shared) {
                            Ok(true) => continue,
                            Ok(false) => break Ok(()),
                            Err(err) => {
                                worker_shared.terminated.store(true, Ordering::Release);
                                break Err(err);
                            }
                        }
                    };
                    debug!("worker {} finished after {} seeds", worker.id, worker.attempts);
                    result
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shared.terminated.store(true, Ordering::Release);
                    let missing = thread_count - handles.len();
                    shared.running.fetch_sub(missing, Ordering::AcqRel);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    bail!("Failed to spawn tracking worker {}: {}", id, err);
                }
            }
        }

        Ok(TrackingJob {
            shared,
            handles,
            field: Arc::clone(&self.field),
            started: Instant::now(),
        })
    }

    /// Blocking run; returns the accepted streamlines.
    pub fn run(&mut self, thread_count: usize) -> Result<TractCollection> {
        self.start(thread_count)?.join()
    }

    /// Single-threaded stepped runner. `entropy` only matters when the
    /// parameters ask for a time-dependent seed.
    pub fn runner(&mut self, entropy: u32) -> Result<TrackingRunner> {
        let ctx = self.context()?;
        let entropy = if self.params.random_seed != 0 { entropy } else { 0 };
        Ok(TrackingRunner {
            worker: SeedingWorker::new(0, entropy),
            shared: SharedState::default(),
            done: false,
            ctx,
        })
    }

    /// Trims `rounds` times, reseeds from the surviving voxels and reruns.
    /// The rerun is not pruned; call `apply_tip` afterwards.
    pub fn refine(
        &mut self,
        collection: &mut TractCollection,
        rounds: usize,
        thread_count: usize,
    ) -> Result<()> {
        for _ in 0..rounds {
            collection.trim();
        }
        let voxels = collection.to_voxels();
        if voxels.is_empty() {
            return Err(TrackingError::NoSeedRegion(
                "refinement left no streamline to seed from".to_string(),
            )
            .into());
        }
        let roi = self.roi_mut();
        roi.clear_seeds();
        roi.set_region(RegionRole::Seed, "refine seeding region", &voxels, 1.0)?;
        info!("refine: reseeding from {} voxels", voxels.len());
        collection.clear();
        let refined = self.run(thread_count)?;
        collection.add_tracts(refined.into_tracts());
        Ok(())
    }

    /// Topology-informed pruning with the configured iteration count.
    pub fn apply_tip(&self, collection: &mut TractCollection) -> usize {
        apply_tip(collection, self.params.tip_iteration)
    }
}

fn apply_tip(collection: &mut TractCollection, iterations: u8) -> usize {
    if iterations == 0 {
        return 0;
    }
    let removed = collection.topology_informed_pruning(iterations as usize, 1);
    info!(
        "topology-informed pruning removed {} tracts in {} iterations",
        removed, iterations
    );
    removed
}

/// Handle to a running multi-threaded job. Dropping it without `join`
/// stops the workers.
pub struct TrackingJob {
    shared: Arc<SharedState>,
    handles: Vec<JoinHandle<Result<()>>>,
    field: Arc<OrientedField>,
    started: Instant,
}

impl Drop for TrackingJob {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::Release);
    }
}

impl TrackingJob {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) > 0
    }

    /// Asks workers to stop after their current streamline.
    pub fn terminate(&self) {
        if !self.shared.terminated.swap(true, Ordering::AcqRel) {
            warn!(
                "tracking cancelled after {} seeds",
                self.shared.seed_attempts.load(Ordering::Acquire)
            );
        }
    }

    pub fn seed_count(&self) -> usize {
        self.shared.seed_attempts.load(Ordering::Acquire)
    }

    pub fn tract_count(&self) -> usize {
        self.shared.accepted.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> TrackingProgress {
        TrackingProgress {
            seed_count: self.seed_count(),
            tract_count: self.tract_count(),
            done: !self.is_running(),
        }
    }

    /// Waits for every worker and collects the accepted streamlines,
    /// unpruned.
    pub fn join(mut self) -> Result<TractCollection> {
        let mut first_error = None;
        for handle in std::mem::take(&mut self.handles) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow!("A tracking worker panicked."));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let mut collection = TractCollection::new(self.field.shape(), self.field.voxel_size());
        collection.add_tracts(self.shared.take_tracts()?);
        info!(
            "tracking finished: {} seeds, {} tracts in {:.2?}",
            self.shared.seed_attempts.load(Ordering::Acquire),
            collection.len(),
            self.started.elapsed()
        );
        Ok(collection)
    }
}

/// Single-threaded runner advanced in caller-sized batches.
pub struct TrackingRunner {
    ctx: RunContext,
    worker: SeedingWorker,
    shared: SharedState,
    done: bool,
}

impl TrackingRunner {
    /// Runs up to `batch` seed attempts; returns how many ran.
    pub fn run_seeds(&mut self, batch: usize) -> Result<usize> {
        let mut ran = 0;
        while ran < batch && !self.done {
            if self.worker.run_one(&self.ctx, &self.shared)? {
                ran += 1;
            } else {
                self.done = true;
            }
        }
        Ok(ran)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn terminate(&mut self) {
        self.done = true;
    }

    pub fn progress(&self) -> TrackingProgress {
        TrackingProgress {
            seed_count: self.shared.seed_attempts.load(Ordering::Acquire),
            tract_count: self.shared.accepted.load(Ordering::Acquire),
            done: self.done,
        }
    }

    /// Accepted streamlines so far, unpruned.
    pub fn take_result(&mut self) -> Result<TractCollection> {
        let mut collection =
            TractCollection::new(self.ctx.field.shape(), self.ctx.field.voxel_size());
        collection.add_tracts(self.shared.take_tracts()?);
        Ok(collection)
    }

    /// Topology-informed pruning with the run's iteration count.
    pub fn apply_tip(&self, collection: &mut TractCollection) -> usize {
        apply_tip(collection, self.ctx.params.tip_iteration)
    }
}
