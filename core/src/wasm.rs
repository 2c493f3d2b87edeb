//! WASM bindings for dpe-core.
//!
//! Exposes profile validation, simulation and palette metadata to the editor.

use wasm_bindgen::prelude::*;

use crate::{
    static_handles, CapabilityRegistry, EngineConfig, Profile, ProfileDefinition, RequestContext,
    SimulationResponse, Simulator, ThresholdRanges,
};

// ═══════════════════════════════════════════════════════════════════════════
// Profile API
// ═══════════════════════════════════════════════════════════════════════════

/// A wrapper around ProfileDefinition for WASM.
#[wasm_bindgen]
pub struct WasmProfile {
    inner: ProfileDefinition,
}

#[wasm_bindgen]
impl WasmProfile {
    /// Create an empty profile with the given id and name.
    #[wasm_bindgen(constructor)]
    pub fn new(id: &str, name: &str) -> WasmProfile {
        WasmProfile {
            inner: ProfileDefinition {
                id: id.to_string(),
                name: name.to_string(),
                priority: 0,
                builtin: false,
                default_action: None,
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    #[wasm_bindgen(js_name = fromJson)]
    pub fn from_json(json: &str) -> Result<WasmProfile, JsError> {
        let inner = ProfileDefinition::from_json(json).map_err(|e| JsError::new(&e.to_string()))?;
        Ok(WasmProfile { inner })
    }

    #[wasm_bindgen(js_name = fromRon)]
    pub fn from_ron(ron: &str) -> Result<WasmProfile, JsError> {
        let inner = ProfileDefinition::from_ron(ron).map_err(|e| JsError::new(&e.to_string()))?;
        Ok(WasmProfile { inner })
    }

    #[wasm_bindgen(js_name = toJson)]
    pub fn to_json(&self) -> Result<String, JsError> {
        serde_json::to_string_pretty(&self.inner).map_err(|e| JsError::new(&e.to_string()))
    }

    #[wasm_bindgen(js_name = toRon)]
    pub fn to_ron(&self) -> Result<String, JsError> {
        self.inner.to_ron().map_err(|e| JsError::new(&e.to_string()))
    }

    #[wasm_bindgen(getter)]
    pub fn id(&self) -> String {
        self.inner.id.clone()
    }

    #[wasm_bindgen(getter)]
    pub fn name(&self) -> String {
        self.inner.name.clone()
    }

    #[wasm_bindgen(setter)]
    pub fn set_name(&mut self, name: &str) {
        self.inner.name = name.to_string();
    }

    #[wasm_bindgen(getter)]
    pub fn priority(&self) -> i64 {
        self.inner.priority
    }

    #[wasm_bindgen(setter)]
    pub fn set_priority(&mut self, priority: i64) {
        self.inner.priority = priority;
    }

    /// Validate the profile. Returns every problem found; an empty array means valid.
    #[wasm_bindgen]
    pub fn validate(&self) -> Result<JsValue, JsError> {
        serde_wasm_bindgen::to_value(&validation_messages(&self.inner)).map_err(|e| JsError::new(&e.to_string()))
    }

    #[wasm_bindgen(js_name = isValid)]
    pub fn is_valid(&self) -> bool {
        validation_messages(&self.inner).is_empty()
    }

    /// Run the profile against a request (JSON), returning the simulation response JSON.
    #[wasm_bindgen]
    pub fn simulate(&self, request_json: &str) -> Result<String, JsError> {
        let json = serde_json::to_string(&self.inner).map_err(|e| JsError::new(&e.to_string()))?;
        Ok(simulate_json(&json, request_json).to_json())
    }
}

/// Compile errors plus capability problems against the builtin registry.
fn validation_messages(definition: &ProfileDefinition) -> Vec<String> {
    let config = EngineConfig::default();
    match Profile::compile_with_limit(definition, config.max_node_visits) {
        Ok(profile) => crate::snapshot::check_capabilities(&profile, &CapabilityRegistry::with_builtins())
            .iter()
            .map(ToString::to_string)
            .collect(),
        Err(errors) => errors.messages(),
    }
}

fn simulate_json(profile_json: &str, request_json: &str) -> SimulationResponse {
    let registry = CapabilityRegistry::with_builtins();
    let config = EngineConfig::default();
    Simulator::new(&registry, &config).simulate_json(profile_json, request_json)
}

// ═══════════════════════════════════════════════════════════════════════════
// Simulation API
// ═══════════════════════════════════════════════════════════════════════════

/// Simulate a profile (JSON) against a request (JSON).
#[wasm_bindgen(js_name = simulateProfile)]
pub fn simulate_profile(profile_json: &str, request_json: &str) -> String {
    simulate_json(profile_json, request_json).to_json()
}

/// Simulate a profile against a canned contact-form submission.
#[wasm_bindgen(js_name = simulateWithMockRequest)]
pub fn simulate_with_mock_request(profile_json: &str) -> Result<String, JsError> {
    let request = serde_json::to_string(&RequestContext::mock()).map_err(|e| JsError::new(&e.to_string()))?;
    Ok(simulate_json(profile_json, &request).to_json())
}

// ═══════════════════════════════════════════════════════════════════════════
// Schema/Metadata API (for UI building)
// ═══════════════════════════════════════════════════════════════════════════

fn node_handles(node_type: &str, subtype: &str) -> Vec<String> {
    match (node_type, subtype) {
        ("operator", "threshold_branch") => ThresholdRanges::default_ranges().outputs().map(str::to_string).collect(),
        _ => static_handles(node_type, subtype)
            .unwrap_or_default()
            .iter()
            .map(|h| h.to_string())
            .collect(),
    }
}

/// Output handles for a node palette entry. Threshold branches report the default ranges.
#[wasm_bindgen(js_name = getNodeHandles)]
pub fn get_node_handles(node_type: &str, subtype: &str) -> Result<JsValue, JsError> {
    serde_wasm_bindgen::to_value(&node_handles(node_type, subtype)).map_err(|e| JsError::new(&e.to_string()))
}

#[wasm_bindgen(js_name = getDefaultThresholdRanges)]
pub fn get_default_threshold_ranges() -> Result<String, JsError> {
    serde_json::to_string(&ThresholdRanges::default_ranges()).map_err(|e| JsError::new(&e.to_string()))
}

/// Defense subtypes with a builtin capability.
#[wasm_bindgen(js_name = getDefenseSubtypes)]
pub fn get_defense_subtypes() -> Vec<String> {
    CapabilityRegistry::with_builtins().subtypes().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_handles_for_palette() {
        assert_eq!(node_handles("defense", "ip_allowlist"), vec!["allowed", "continue"]);
        assert_eq!(node_handles("operator", "threshold_branch"), vec!["low", "medium", "high", "critical"]);
        assert!(node_handles("action", "block").is_empty());
        assert!(node_handles("widget", "").is_empty());
    }

    #[test]
    fn test_validation_messages_cover_graph_and_capabilities() {
        let def = ProfileDefinition::from_json(r#"{
            "id": "p",
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "d", "type": "defense", "subtype": "timing_token"},
                {"id": "a", "type": "action", "subtype": "allow"}
            ],
            "edges": [
                {"from": "s", "handle": "next", "to": "d"},
                {"from": "d", "handle": "continue", "to": "a"}
            ]
        }"#)
        .unwrap();
        let messages = validation_messages(&def);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("timing_token"));
    }

    #[test]
    fn test_simulate_with_mock_request_allows_clean_form() {
        let profile = r#"{
            "id": "p",
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "hp", "type": "defense", "subtype": "honeypot"},
                {"id": "a", "type": "action", "subtype": "allow"},
                {"id": "b", "type": "action", "subtype": "block"}
            ],
            "edges": [
                {"from": "s", "handle": "next", "to": "hp"},
                {"from": "hp", "handle": "continue", "to": "a"},
                {"from": "hp", "handle": "blocked", "to": "b"}
            ]
        }"#;
        let request = serde_json::to_string(&RequestContext::mock()).unwrap();
        let response = simulate_json(profile, &request);
        assert_eq!(response.report().unwrap().action, crate::FinalAction::Allow);
    }
}
