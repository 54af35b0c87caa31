//! Per-voxel fiber peak resolution.

use serde_wasm_bindgen::to_value;
use tract_core::odf::{FiberOrientationResolver, PeakPolicy};
use tract_core::tessellation::Tessellation;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmOdfResolver {
    tessellation: Tessellation,
    resolver: FiberOrientationResolver,
}

#[wasm_bindgen]
impl WasmOdfResolver {
    /// `policy` is `"local_maximum"` or `"shape_resolving"`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        subdivisions: u32,
        policy: &str,
        max_fiber_number: u32,
    ) -> Result<WasmOdfResolver, JsValue> {
        console_error_panic_hook::set_once();

        let tessellation = Tessellation::icosahedron(subdivisions as usize)
            .map_err(|e| JsValue::from_str(&format!("{}", e)))?;
        let policy = PeakPolicy::parse(policy).map_err(|e| JsValue::from_str(&format!("{}", e)))?;
        let resolver =
            FiberOrientationResolver::new(&tessellation, policy, max_fiber_number as usize)
                .map_err(|e| JsValue::from_str(&format!("{}", e)))?;

        Ok(WasmOdfResolver {
            tessellation,
            resolver,
        })
    }

    pub fn half_vertices_count(&self) -> usize {
        self.tessellation.half_vertices_count()
    }

    /// Half-sphere vertex coordinates as flat xyz.
    pub fn vertices(&self) -> Vec<f32> {
        self.tessellation.vertices()[..self.tessellation.half_vertices_count()]
            .iter()
            .flat_map(|v| [v.x, v.y, v.z])
            .collect()
    }

    /// Resolves one voxel's ODF into `{ direction_index, strength }` peaks.
    pub fn resolve(&self, odf: &[f32]) -> Result<JsValue, JsValue> {
        let peaks = self
            .resolver
            .resolve(odf)
            .map_err(|e| JsValue::from_str(&format!("Peak resolution failed: {}", e)))?;

        to_value(&peaks).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Unit direction of a vertex, flat xyz.
    pub fn direction(&self, index: usize) -> Result<Vec<f32>, JsValue> {
        if index >= self.tessellation.vertices_count() {
            return Err(JsValue::from_str(&format!("Vertex {} is out of range", index)));
        }
        let v = self.tessellation.vertex(index);
        Ok(vec![v.x, v.y, v.z])
    }
}
