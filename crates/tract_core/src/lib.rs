pub mod error;
pub mod field;
pub mod interpolation;
pub mod odf;
pub mod orchestrator;
pub mod params;
pub mod random;
pub mod recon;
pub mod roi;
pub mod solvers;
pub mod tessellation;
pub mod tract;
pub mod tracking;
/// The `tract_core` crate is the numerical engine behind fiber tractography.
/// It turns per-voxel fiber orientations into streamlines and extracts those
/// orientations from orientation-distribution samples.
///
/// Key components:
/// - **Traits**: `DirectionField` (sampled orientation field), `Steppable` (stepping rules).
/// - **Reconstruction**: icosahedral `Tessellation`, `FiberOrientationResolver` and a staged pipeline building an `OrientedField`.
/// - **Tracking**: `StreamlineIntegrator` state machine, `RegionConstraintSet` and the multi-threaded `TrackingOrchestrator`.
/// - **Post-processing**: `TractCollection` pruning, clustering and statistics.
pub mod traits;

pub use error::TrackingError;
pub use field::{OrientedField, VolumeShape};
pub use orchestrator::{TrackingJob, TrackingOrchestrator, TrackingProgress, TrackingRunner};
pub use params::TrackingParameters;
pub use roi::{RegionConstraintSet, RegionRole};
pub use tract::TractCollection;
