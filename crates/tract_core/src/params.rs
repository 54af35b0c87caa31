use crate::error::TrackingError;
use crate::interpolation::InterpolationKind;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Size of the serialized parameter record.
pub const PARAMETER_RECORD_SIZE: usize = 52;

/// Each filler symbol stands for two copies of the one before it.
const FILLER: [u8; 8] = *b"0abcdefg";

/// Upper bound on the points one streamline may hold, i.e. on
/// `max_length / step_size`.
pub const MAX_TRACE_POINTS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingMethodKind {
    Euler = 0,
    RungeKutta4 = 1,
    Voxel = 2,
}

impl TrackingMethodKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TrackingMethodKind::Euler),
            1 => Some(TrackingMethodKind::RungeKutta4),
            2 => Some(TrackingMethodKind::Voxel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialDirection {
    Principal = 0,
    Random = 1,
    AllDirections = 2,
}

impl InitialDirection {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InitialDirection::Principal),
            1 => Some(InitialDirection::Random),
            2 => Some(InitialDirection::AllDirections),
            _ => None,
        }
    }
}

/// Everything that shapes one tracking run.
///
/// Sentinel values select per-streamline randomization: `threshold == 0`,
/// `cull_cos_angle == 1`, `step_size == 0` and `smooth_fraction == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParameters {
    pub threshold: f32,
    pub default_otsu: f32,
    pub cull_cos_angle: f32,
    /// Millimetres.
    pub step_size: f32,
    pub smooth_fraction: f32,
    pub min_length: f32,
    pub max_length: f32,
    pub termination_count: u32,
    pub max_seed_count: u32,
    pub stop_by_tract: u8,
    pub center_seed: u8,
    pub check_ending: u8,
    pub interpolation_strategy: u8,
    pub tracking_method: u8,
    pub initial_direction: u8,
    pub random_seed: u8,
    pub tip_iteration: u8,
    pub dt_threshold: f32,
    pub reserved: [u8; 4],
}

impl Default for TrackingParameters {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            default_otsu: 0.6,
            cull_cos_angle: 1.0,
            step_size: 0.0,
            smooth_fraction: 0.0,
            min_length: 30.0,
            max_length: 300.0,
            termination_count: 100_000,
            max_seed_count: 0,
            stop_by_tract: 1,
            center_seed: 0,
            check_ending: 0,
            interpolation_strategy: 0,
            tracking_method: 0,
            initial_direction: 0,
            random_seed: 0,
            tip_iteration: 0,
            dt_threshold: 0.0,
            reserved: [0; 4],
        }
    }
}

impl TrackingParameters {
    pub fn to_bytes(&self) -> [u8; PARAMETER_RECORD_SIZE] {
        let mut out = [0u8; PARAMETER_RECORD_SIZE];
        let floats = [
            self.threshold,
            self.default_otsu,
            self.cull_cos_angle,
            self.step_size,
            self.smooth_fraction,
            self.min_length,
            self.max_length,
        ];
        for (i, value) in floats.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[28..32].copy_from_slice(&self.termination_count.to_le_bytes());
        out[32..36].copy_from_slice(&self.max_seed_count.to_le_bytes());
        out[36..44].copy_from_slice(&[
            self.stop_by_tract,
            self.center_seed,
            self.check_ending,
            self.interpolation_strategy,
            self.tracking_method,
            self.initial_direction,
            self.random_seed,
            self.tip_iteration,
        ]);
        out[44..48].copy_from_slice(&self.dt_threshold.to_le_bytes());
        out[48..52].copy_from_slice(&self.reserved);
        out
    }

    pub fn from_bytes(bytes: &[u8; PARAMETER_RECORD_SIZE]) -> Self {
        let f = |at: usize| f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            threshold: f(0),
            default_otsu: f(4),
            cull_cos_angle: f(8),
            step_size: f(12),
            smooth_fraction: f(16),
            min_length: f(20),
            max_length: f(24),
            termination_count: u(28),
            max_seed_count: u(32),
            stop_by_tract: bytes[36],
            center_seed: bytes[37],
            check_ending: bytes[38],
            interpolation_strategy: bytes[39],
            tracking_method: bytes[40],
            initial_direction: bytes[41],
            random_seed: bytes[42],
            tip_iteration: bytes[43],
            dt_threshold: f(44),
            reserved: [bytes[48], bytes[49], bytes[50], bytes[51]],
        }
    }

    /// Compact reproducibility code: upper-case hex of the record with runs
    /// of zero nibbles folded into the filler alphabet.
    pub fn code(&self) -> String {
        let mut code: Vec<u8> = Vec::with_capacity(PARAMETER_RECORD_SIZE * 2);
        for byte in self.to_bytes() {
            code.push(hex_digit(byte >> 4));
            code.push(hex_digit(byte & 15));
        }
        for i in 0..FILLER.len() - 1 {
            let mut j = 1;
            while j < code.len() {
                if code[j - 1] == code[j] && code[j] == FILLER[i] {
                    code[j - 1] = FILLER[i + 1];
                    code.remove(j);
                } else {
                    j += 1;
                }
            }
        }
        code.into_iter().map(char::from).collect()
    }

    /// Overwrites the leading fields with the record encoded in `code`;
    /// fields past a short code keep their current values.
    pub fn apply_code(&mut self, code: &str) -> Result<()> {
        let mut expanded: Vec<u8> = code.bytes().collect();
        for i in (1..FILLER.len()).rev() {
            let mut j = 0;
            while j < expanded.len() {
                if expanded[j] == FILLER[i] {
                    expanded[j] = FILLER[i - 1];
                    expanded.insert(j, FILLER[i - 1]);
                }
                j += 1;
            }
            if expanded.len() > PARAMETER_RECORD_SIZE * 2 {
                return Err(invalid_code(code, "it encodes more than the parameter record"));
            }
        }
        if expanded.len() % 2 != 0 {
            return Err(invalid_code(code, "it has an odd number of digits"));
        }

        let mut bytes = self.to_bytes();
        for (slot, pair) in expanded.chunks(2).enumerate() {
            let (Some(high), Some(low)) = (hex_value(pair[0]), hex_value(pair[1])) else {
                return Err(invalid_code(code, "it contains a character outside the code alphabet"));
            };
            bytes[slot] = (high << 4) | low;
        }
        *self = Self::from_bytes(&bytes);
        Ok(())
    }

    pub fn from_code(code: &str) -> Result<Self> {
        let mut params = Self::default();
        params.apply_code(code)?;
        Ok(params)
    }

    pub fn method(&self) -> Result<TrackingMethodKind> {
        TrackingMethodKind::from_code(self.tracking_method)
            .ok_or_else(|| anyhow::anyhow!("Unknown tracking method {}.", self.tracking_method))
    }

    pub fn initial(&self) -> Result<InitialDirection> {
        InitialDirection::from_code(self.initial_direction).ok_or_else(|| {
            anyhow::anyhow!("Unknown initial direction policy {}.", self.initial_direction)
        })
    }

    pub fn interpolation(&self) -> Result<InterpolationKind> {
        InterpolationKind::from_code(self.interpolation_strategy).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown interpolation strategy {}.",
                self.interpolation_strategy
            )
        })
    }

    pub fn set_turning_angle_degrees(&mut self, degrees: f32) {
        self.cull_cos_angle = degrees.to_radians().cos();
    }

    /// `None` when the angle is picked per streamline.
    pub fn turning_angle_degrees(&self) -> Option<f32> {
        if self.cull_cos_angle == 1.0 {
            None
        } else {
            Some(self.cull_cos_angle.clamp(-1.0, 1.0).acos().to_degrees())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.method()?;
        self.initial()?;
        self.interpolation()?;
        let finite = [
            self.threshold,
            self.default_otsu,
            self.cull_cos_angle,
            self.step_size,
            self.smooth_fraction,
            self.min_length,
            self.max_length,
            self.dt_threshold,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            bail!("Tracking parameters must be finite.");
        }
        if self.threshold < 0.0 || self.default_otsu < 0.0 || self.dt_threshold < 0.0 {
            bail!("Thresholds must be non-negative.");
        }
        if !(-1.0..=1.0).contains(&self.cull_cos_angle) {
            bail!("cull_cos_angle must lie in [-1, 1].");
        }
        if self.step_size < 0.0 {
            bail!("Step size must be non-negative.");
        }
        if self.step_size > 0.0 && self.max_length / self.step_size > MAX_TRACE_POINTS as f32 {
            bail!(
                "Step size {} mm is too small for a maximum length of {} mm.",
                self.step_size,
                self.max_length
            );
        }
        if !(0.0..=1.0).contains(&self.smooth_fraction) {
            bail!("smooth_fraction must lie in [0, 1].");
        }
        if self.min_length < 0.0 || self.max_length <= 0.0 || self.min_length > self.max_length {
            bail!(
                "Length bounds are inconsistent (min {}, max {}).",
                self.min_length,
                self.max_length
            );
        }
        if self.stop_by_tract == 1 && self.termination_count == 0 {
            bail!("termination_count must be positive.");
        }
        if self.stop_by_tract == 0 && self.termination_count == 0 && self.max_seed_count == 0 {
            bail!("A seed budget is required when stopping by seed count.");
        }
        Ok(())
    }

    /// Human-readable provenance sentence ending with the parameter code.
    pub fn report(&self) -> String {
        let mut report = String::new();
        if self.threshold == 0.0 {
            report.push_str(" The anisotropy threshold was randomly selected.");
        } else {
            let _ = write!(report, " The anisotropy threshold was {}.", self.threshold);
        }

        match self.turning_angle_degrees() {
            Some(angle) => {
                let _ = write!(
                    report,
                    " The angular threshold was {} degrees.",
                    angle.round() as i32
                );
            }
            None => report
                .push_str(" The angular threshold was randomly selected from 15 degrees to 90 degrees."),
        }

        if self.step_size != 0.0 {
            let _ = write!(report, " The step size was {} mm.", self.step_size);
        } else {
            report.push_str(" The step size was randomly selected from 0.5 voxel to 1.5 voxels.");
        }

        if self.smooth_fraction != 0.0 {
            if self.smooth_fraction != 1.0 {
                let _ = write!(
                    report,
                    " The fiber trajectories were smoothed by averaging the propagation direction with {}% of the previous direction.",
                    (self.smooth_fraction * 100.0).round() as i32
                );
            } else {
                report.push_str(" The fiber trajectories were smoothed by averaging the propagation direction with a percentage of the previous direction. The percentage was randomly selected from 0% to 95%.");
            }
        }

        let _ = write!(
            report,
            " Tracks with length shorter than {} or longer than {} mm were discarded.",
            self.min_length, self.max_length
        );
        let _ = write!(
            report,
            " A total of {} {}",
            self.termination_count,
            if self.stop_by_tract != 0 {
                "tracts were calculated."
            } else {
                "seeds were placed."
            }
        );
        if self.tip_iteration != 0 {
            let _ = write!(
                report,
                " Topology-informed pruning (Yeh et al. Neurotherapeutics, 16(1), 52-58, 2019) was applied to the tractography with {} iteration(s) to remove false connections.",
                self.tip_iteration
            );
        }
        let _ = write!(report, " parameter_id={} ", self.code());
        report
    }
}

fn hex_digit(nibble: u8) -> u8 {
    if nibble < 10 {
        b'0' + nibble
    } else {
        b'A' + nibble - 10
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn invalid_code(code: &str, reason: &str) -> anyhow::Error {
    TrackingError::InvalidParameterCode(format!("'{}' is rejected because {}", code, reason)).into()
}
