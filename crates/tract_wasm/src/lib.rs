use tract_core::params::TrackingParameters;
use wasm_bindgen::prelude::*;

mod peaks;
mod runner;

pub use peaks::WasmOdfResolver;
pub use runner::WasmTrackingRunner;

pub(crate) fn parameters_from(params_val: JsValue) -> Result<TrackingParameters, JsValue> {
    let params: TrackingParameters = serde_wasm_bindgen::from_value(params_val)
        .map_err(|e| JsValue::from_str(&format!("Invalid tracking parameters: {}", e)))?;
    params
        .validate()
        .map_err(|e| JsValue::from_str(&format!("Invalid tracking parameters: {}", e)))?;
    Ok(params)
}

/// Default tracking parameters as a plain object.
#[wasm_bindgen]
pub fn default_parameters() -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(&TrackingParameters::default())
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

/// Compact, round-trippable code for a parameter object.
#[wasm_bindgen]
pub fn encode_parameter_code(params_val: JsValue) -> Result<String, JsValue> {
    console_error_panic_hook::set_once();
    Ok(parameters_from(params_val)?.code())
}

#[wasm_bindgen]
pub fn decode_parameter_code(code: &str) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();
    let params = TrackingParameters::from_code(code)
        .map_err(|e| JsValue::from_str(&format!("{}", e)))?;
    serde_wasm_bindgen::to_value(&params)
        .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

/// Provenance sentence for a parameter object.
#[wasm_bindgen]
pub fn tracking_report(params_val: JsValue) -> Result<String, JsValue> {
    Ok(parameters_from(params_val)?.report())
}
