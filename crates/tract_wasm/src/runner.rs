//! Stepped tracking runner for hosts without threads.

use crate::parameters_from;
use serde::{Deserialize, Serialize};
use serde_wasm_bindgen::{from_value, to_value};
use std::sync::Arc;
use tract_core::field::{OrientedField, VolumeShape};
use tract_core::orchestrator::{TrackingOrchestrator, TrackingRunner};
use tract_core::roi::{RegionConstraintSet, RegionRole};
use wasm_bindgen::prelude::*;

fn unit_ratio() -> f32 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
struct RegionInput {
    role: u8,
    name: String,
    points: Vec<[i32; 3]>,
    #[serde(default = "unit_ratio")]
    ratio: f32,
}

#[derive(Serialize)]
struct TrackingResult {
    tracts: Vec<Vec<f32>>,
    seed_count: usize,
    report: String,
}

/// WASM-exported tracking runner.
/// Runs seed attempts in caller-sized batches so the host can report progress.
#[wasm_bindgen]
pub struct WasmTrackingRunner {
    runner: Option<TrackingRunner>,
    report: String,
}

#[wasm_bindgen]
impl WasmTrackingRunner {
    /// `fa` holds one volume per fiber slot back to back; `dir` holds the
    /// matching xyz triples. `regions_val` is a list of
    /// `{ role, name, points, ratio? }` with the role codes
    /// roi=0, roa=1, end=2, seed=3, terminate=4.
    #[wasm_bindgen(constructor)]
    pub fn new(
        dims: Vec<u32>,
        voxel_size: Vec<f32>,
        fa: Vec<f32>,
        dir: Vec<f32>,
        params_val: JsValue,
        regions_val: JsValue,
    ) -> Result<WasmTrackingRunner, JsValue> {
        console_error_panic_hook::set_once();

        let (shape, voxel_size) = match (dims.as_slice(), voxel_size.as_slice()) {
            ([w, h, d], [vx, vy, vz]) => (
                VolumeShape::new(*w as usize, *h as usize, *d as usize),
                [*vx, *vy, *vz],
            ),
            _ => return Err(JsValue::from_str("dims and voxel_size need three entries each")),
        };
        let size = shape.size();
        if size == 0 || fa.len() % size != 0 {
            return Err(JsValue::from_str(&format!(
                "fa length {} is not a multiple of the volume size {}",
                fa.len(),
                size
            )));
        }
        let fa: Vec<Vec<f32>> = fa.chunks(size).map(|c| c.to_vec()).collect();
        let dir: Vec<Vec<f32>> = dir.chunks(size * 3).map(|c| c.to_vec()).collect();
        let field = OrientedField::new(shape, voxel_size, fa, dir)
            .map_err(|e| JsValue::from_str(&format!("Invalid field: {}", e)))?;

        let params = parameters_from(params_val)?;
        let regions: Vec<RegionInput> = if regions_val.is_undefined() || regions_val.is_null() {
            Vec::new()
        } else {
            from_value(regions_val)
                .map_err(|e| JsValue::from_str(&format!("Invalid regions: {}", e)))?
        };
        let mut roi = RegionConstraintSet::new(shape);
        for region in &regions {
            let role = RegionRole::from_code(region.role)
                .map_err(|e| JsValue::from_str(&format!("{}", e)))?;
            roi.set_region(role, &region.name, &region.points, region.ratio)
                .map_err(|e| JsValue::from_str(&format!("{}", e)))?;
        }

        let mut orchestrator = TrackingOrchestrator::new(Arc::new(field), roi, params)
            .map_err(|e| JsValue::from_str(&format!("Tracking setup failed: {}", e)))?;
        let entropy = js_sys::Date::now() as u64 as u32;
        let runner = orchestrator
            .runner(entropy)
            .map_err(|e| JsValue::from_str(&format!("Tracking setup failed: {}", e)))?;

        Ok(WasmTrackingRunner {
            runner: Some(runner),
            report: orchestrator.report(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.runner.as_ref().map_or(true, |runner| runner.is_done())
    }

    /// Run a batch of seed attempts and return progress.
    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        runner
            .run_seeds(batch_size as usize)
            .map_err(|e| JsValue::from_str(&format!("Tracking step failed: {}", e)))?;

        to_value(&runner.progress())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        to_value(&runner.progress())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn terminate(&mut self) {
        if let Some(runner) = self.runner.as_mut() {
            runner.terminate();
        }
    }

    pub fn get_report(&self) -> String {
        self.report.clone()
    }

    /// Accepted streamlines as flat xyz arrays in voxel coordinates, after
    /// topology-informed pruning when the parameters ask for it.
    pub fn get_result(&mut self) -> Result<JsValue, JsValue> {
        let mut runner = self
            .runner
            .take()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        let seed_count = runner.progress().seed_count;
        let mut collection = runner
            .take_result()
            .map_err(|e| JsValue::from_str(&format!("{}", e)))?;
        runner.apply_tip(&mut collection);
        let result = TrackingResult {
            tracts: collection.into_tracts(),
            seed_count,
            report: self.report.clone(),
        };

        to_value(&result).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use tract_core::params::TrackingParameters;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[derive(Deserialize)]
    struct ResultView {
        tracts: Vec<Vec<f32>>,
        seed_count: usize,
    }

    #[derive(Deserialize)]
    struct ProgressView {
        seed_count: usize,
        done: bool,
    }

    fn straight_inputs(n: u32) -> (Vec<u32>, Vec<f32>, Vec<f32>, Vec<f32>) {
        let size = (n * n * n) as usize;
        (
            vec![n, n, n],
            vec![1.0; 3],
            vec![1.0; size],
            [1.0f32, 0.0, 0.0].repeat(size),
        )
    }

    fn params_value(termination_count: u32) -> JsValue {
        let mut params = TrackingParameters {
            threshold: 0.5,
            step_size: 1.0,
            min_length: 3.0,
            stop_by_tract: 0,
            termination_count,
            ..TrackingParameters::default()
        };
        params.set_turning_angle_degrees(60.0);
        to_value(&params).expect("params")
    }

    #[wasm_bindgen_test]
    fn runner_reports_progress_until_done() {
        let (dims, voxel, fa, dir) = straight_inputs(6);
        let mut runner = WasmTrackingRunner::new(
            dims,
            voxel,
            fa,
            dir,
            params_value(12),
            JsValue::UNDEFINED,
        )
        .expect("runner");

        let progress: ProgressView =
            from_value(runner.run_steps(5).expect("batch")).expect("progress");
        assert_eq!(progress.seed_count, 5);
        assert!(!progress.done);
        while !runner.is_done() {
            runner.run_steps(5).expect("batch");
        }
        let result: ResultView = from_value(runner.get_result().expect("result")).expect("view");
        assert_eq!(result.seed_count, 12);
        assert!(result.tracts.len() <= 12);
        assert!(runner.get_progress().is_err());
    }

    #[wasm_bindgen_test]
    fn unknown_region_role_is_rejected() {
        #[derive(Serialize)]
        struct Region {
            role: u8,
            name: &'static str,
            points: Vec<[i32; 3]>,
        }
        let (dims, voxel, fa, dir) = straight_inputs(4);
        let regions = to_value(&vec![Region {
            role: 9,
            name: "bad",
            points: vec![[1, 1, 1]],
        }])
        .expect("regions");
        let err = WasmTrackingRunner::new(dims, voxel, fa, dir, params_value(4), regions)
            .err()
            .expect("should fail");
        assert!(err.as_string().unwrap_or_default().contains("Unknown region role"));
    }
}
