use nalgebra::Vector3;

/// Position or direction in voxel coordinates.
pub type Vec3 = Vector3<f32>;

/// A direction field sampled at continuous positions.
pub trait DirectionField {
    /// Returns the local fiber direction at `position`, aligned with
    /// `reference`, or `None` when no confident direction exists there.
    fn sample(&self, position: &Vec3, reference: &Vec3) -> Option<Vec3>;

    /// Slot-0 anisotropy of the voxel nearest to `position` (zero outside).
    fn anisotropy_at(&self, position: &Vec3) -> f32;
}

/// Position and heading of one half-trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepState {
    pub position: Vec3,
    pub direction: Vec3,
}

/// Per-streamline stepping settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSettings {
    /// Step length per axis, in voxels.
    pub step_in_voxel: Vec3,
    /// Weight of the previous direction when blending (0 disables smoothing).
    pub smoothing: f32,
    /// Minimal cosine between consecutive directions.
    pub cull_cos_angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The state moved to a new position.
    Advanced,
    /// No confident direction or the turn was too sharp; the state still
    /// holds the position where stepping was attempted.
    Stopped,
}

/// A stepping rule that advances a half-trace by one step.
pub trait Steppable {
    fn step(
        &mut self,
        field: &impl DirectionField,
        state: &mut StepState,
        settings: &StepSettings,
    ) -> StepOutcome;
}
