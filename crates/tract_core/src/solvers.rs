use crate::params::TrackingMethodKind;
use crate::traits::{DirectionField, StepOutcome, StepSettings, StepState, Steppable, Vec3};

/// Blends the sampled direction with the previous one, applies the turning
/// gate and commits the move to `next`.
fn commit(
    state: &mut StepState,
    settings: &StepSettings,
    sampled: Vec3,
    next: Vec3,
) -> StepOutcome {
    state.position = next;
    let blended = if settings.smoothing > 0.0 {
        sampled * (1.0 - settings.smoothing) + state.direction * settings.smoothing
    } else {
        sampled
    };
    let norm = blended.norm();
    if !norm.is_finite() || norm == 0.0 {
        return StepOutcome::Stopped;
    }
    let blended = blended / norm;
    if blended.dot(&state.direction) < settings.cull_cos_angle {
        return StepOutcome::Stopped;
    }
    state.direction = blended;
    StepOutcome::Advanced
}

/// Forward Euler on the direction field.
#[derive(Debug, Default, Clone)]
pub struct Euler;

impl Steppable for Euler {
    fn step(
        &mut self,
        field: &impl DirectionField,
        state: &mut StepState,
        settings: &StepSettings,
    ) -> StepOutcome {
        let next = state.position + settings.step_in_voxel.component_mul(&state.direction);
        match field.sample(&next, &state.direction) {
            Some(sampled) => commit(state, settings, sampled, next),
            None => {
                state.position = next;
                StepOutcome::Stopped
            }
        }
    }
}

/// Classic Runge-Kutta 4th order on the normalized direction field.
#[derive(Debug, Default, Clone)]
pub struct RungeKutta4 {
    k1: Vec3,
    k2: Vec3,
    k3: Vec3,
    k4: Vec3,
    tmp: Vec3,
}

impl RungeKutta4 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Steppable for RungeKutta4 {
    fn step(
        &mut self,
        field: &impl DirectionField,
        state: &mut StepState,
        settings: &StepSettings,
    ) -> StepOutcome {
        let h = settings.step_in_voxel;
        let y = state.position;
        let ahead = y + h.component_mul(&state.direction);

        // k1 = f(y)
        let Some(k1) = field.sample(&y, &state.direction) else {
            state.position = ahead;
            return StepOutcome::Stopped;
        };
        self.k1 = k1;

        // k2 = f(y + h*k1/2)
        self.tmp = y + h.component_mul(&self.k1) * 0.5;
        let Some(k2) = field.sample(&self.tmp, &self.k1) else {
            state.position = ahead;
            return StepOutcome::Stopped;
        };
        self.k2 = k2;

        // k3 = f(y + h*k2/2)
        self.tmp = y + h.component_mul(&self.k2) * 0.5;
        let Some(k3) = field.sample(&self.tmp, &self.k2) else {
            state.position = ahead;
            return StepOutcome::Stopped;
        };
        self.k3 = k3;

        // k4 = f(y + h*k3)
        self.tmp = y + h.component_mul(&self.k3);
        let Some(k4) = field.sample(&self.tmp, &self.k3) else {
            state.position = ahead;
            return StepOutcome::Stopped;
        };
        self.k4 = k4;

        let combined = (self.k1 + self.k2 * 2.0 + self.k3 * 2.0 + self.k4) / 6.0;
        let norm = combined.norm();
        if !norm.is_finite() || norm == 0.0 {
            state.position = ahead;
            return StepOutcome::Stopped;
        }
        let combined = combined / norm;
        let next = y + h.component_mul(&combined);
        commit(state, settings, combined, next)
    }
}

/// Walk between voxel centers; positions stay on integer coordinates.
#[derive(Debug, Default, Clone)]
pub struct VoxelWalk;

impl Steppable for VoxelWalk {
    fn step(
        &mut self,
        field: &impl DirectionField,
        state: &mut StepState,
        settings: &StepSettings,
    ) -> StepOutcome {
        let current = state.position.map(|v| v.round());
        let mut next = (current + settings.step_in_voxel.component_mul(&state.direction))
            .map(|v| v.round());
        if next == current {
            // step shorter than a voxel: move to the neighbor along the
            // dominant axes instead of standing still
            let dominant = state.direction.abs().max();
            if dominant == 0.0 {
                return StepOutcome::Stopped;
            }
            next = current + (state.direction / dominant).map(|v| v.round());
        }
        match field.sample(&next, &state.direction) {
            Some(sampled) => commit(state, settings, sampled, next),
            None => {
                state.position = next;
                StepOutcome::Stopped
            }
        }
    }
}

/// Closed set of stepping rules selected by the tracking method.
#[derive(Debug, Clone)]
pub enum StepRule {
    Euler(Euler),
    RungeKutta4(RungeKutta4),
    Voxel(VoxelWalk),
}

impl StepRule {
    pub fn build(kind: TrackingMethodKind) -> Self {
        match kind {
            TrackingMethodKind::Euler => StepRule::Euler(Euler),
            TrackingMethodKind::RungeKutta4 => StepRule::RungeKutta4(RungeKutta4::new()),
            TrackingMethodKind::Voxel => StepRule::Voxel(VoxelWalk),
        }
    }

    pub fn kind(&self) -> TrackingMethodKind {
        match self {
            StepRule::Euler(_) => TrackingMethodKind::Euler,
            StepRule::RungeKutta4(_) => TrackingMethodKind::RungeKutta4,
            StepRule::Voxel(_) => TrackingMethodKind::Voxel,
        }
    }

    pub fn step(
        &mut self,
        field: &impl DirectionField,
        state: &mut StepState,
        settings: &StepSettings,
    ) -> StepOutcome {
        match self {
            StepRule::Euler(s) => s.step(field, state, settings),
            StepRule::RungeKutta4(s) => s.step(field, state, settings),
            StepRule::Voxel(s) => s.step(field, state, settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Circular flow around the z axis with optional dead zone.
    struct Swirl {
        dead_beyond_x: f32,
    }

    impl DirectionField for Swirl {
        fn sample(&self, position: &Vec3, reference: &Vec3) -> Option<Vec3> {
            if position.x > self.dead_beyond_x {
                return None;
            }
            let tangent = Vec3::new(-position.y, position.x, 0.0);
            let norm = tangent.norm();
            if norm == 0.0 {
                return None;
            }
            let tangent = tangent / norm;
            Some(if tangent.dot(reference) < 0.0 { -tangent } else { tangent })
        }

        fn anisotropy_at(&self, _position: &Vec3) -> f32 {
            1.0
        }
    }

    struct Uniform(Vec3);

    impl DirectionField for Uniform {
        fn sample(&self, _position: &Vec3, reference: &Vec3) -> Option<Vec3> {
            Some(if self.0.dot(reference) < 0.0 { -self.0 } else { self.0 })
        }

        fn anisotropy_at(&self, _position: &Vec3) -> f32 {
            1.0
        }
    }

    fn settings(step: f32) -> StepSettings {
        StepSettings {
            step_in_voxel: Vec3::new(step, step, step),
            smoothing: 0.0,
            cull_cos_angle: 0.5,
        }
    }

    #[test]
    fn euler_moves_along_the_field() {
        let field = Uniform(Vec3::x());
        let mut state = StepState {
            position: Vec3::zeros(),
            direction: Vec3::x(),
        };
        let mut euler = Euler;
        assert_eq!(euler.step(&field, &mut state, &settings(0.5)), StepOutcome::Advanced);
        assert!((state.position - Vec3::new(0.5, 0.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn rk4_stays_closer_to_the_circle_than_euler() {
        let field = Swirl {
            dead_beyond_x: f32::MAX,
        };
        let start = StepState {
            position: Vec3::new(5.0, 0.0, 0.0),
            direction: Vec3::y(),
        };
        let cfg = settings(0.5);
        let (mut e, mut r) = (start, start);
        let mut euler = Euler;
        let mut rk4 = RungeKutta4::new();
        for _ in 0..20 {
            assert_eq!(euler.step(&field, &mut e, &cfg), StepOutcome::Advanced);
            assert_eq!(rk4.step(&field, &mut r, &cfg), StepOutcome::Advanced);
        }
        let euler_drift = (e.position.norm() - 5.0).abs();
        let rk4_drift = (r.position.norm() - 5.0).abs();
        assert!(rk4_drift < euler_drift, "rk4 {rk4_drift} euler {euler_drift}");
    }

    #[test]
    fn failed_sample_stops_one_step_ahead() {
        let field = Swirl { dead_beyond_x: 0.0 };
        let mut state = StepState {
            position: Vec3::new(-0.25, 1.0, 0.0),
            direction: Vec3::x(),
        };
        let mut euler = Euler;
        assert_eq!(euler.step(&field, &mut state, &settings(1.0)), StepOutcome::Stopped);
        assert!((state.position - Vec3::new(0.75, 1.0, 0.0)).norm() < 1e-6);
        assert_eq!(state.direction, Vec3::x());
    }

    #[test]
    fn turning_gate_stops_sharp_turns() {
        let field = Uniform(Vec3::y());
        let mut state = StepState {
            position: Vec3::zeros(),
            direction: Vec3::x(),
        };
        let cfg = StepSettings {
            cull_cos_angle: 0.9,
            ..settings(1.0)
        };
        assert_eq!(Euler.step(&field, &mut state, &cfg), StepOutcome::Stopped);
    }

    #[test]
    fn smoothing_keeps_part_of_the_previous_direction() {
        let field = Uniform(Vec3::new(1.0, 1.0, 0.0).normalize());
        let mut state = StepState {
            position: Vec3::zeros(),
            direction: Vec3::x(),
        };
        let cfg = StepSettings {
            smoothing: 0.5,
            ..settings(1.0)
        };
        assert_eq!(Euler.step(&field, &mut state, &cfg), StepOutcome::Advanced);
        let angle = state.direction.y.atan2(state.direction.x).to_degrees();
        assert!(angle > 1.0 && angle < 44.0, "angle {angle}");
    }

    #[test]
    fn voxel_walk_lands_on_voxel_centers() {
        let field = Uniform(Vec3::new(1.0, 0.2, 0.0).normalize());
        let mut state = StepState {
            position: Vec3::new(2.0, 2.0, 2.0),
            direction: Vec3::new(1.0, 0.2, 0.0).normalize(),
        };
        let mut rule = StepRule::build(TrackingMethodKind::Voxel);
        assert_eq!(rule.kind(), TrackingMethodKind::Voxel);
        for _ in 0..3 {
            assert_eq!(rule.step(&field, &mut state, &settings(0.4)), StepOutcome::Advanced);
            assert_eq!(state.position, state.position.map(|v| v.round()));
        }
        assert_eq!(state.position, Vec3::new(5.0, 2.0, 2.0));
    }
}
