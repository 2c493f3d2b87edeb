//! Dry-run a profile against a synthetic request.
//!
//! Backs `POST /defense-profiles/{id}/simulate` on the edge service and
//! `simulateProfile` in the editor bindings. Input problems come back as an
//! `{errors: [...]}` body rather than a Rust error so callers can forward it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::EngineConfig;
use crate::graph::{Profile, ProfileDefinition};
use crate::interpreter::ProfileExecutor;
use crate::registry::CapabilityRegistry;
use crate::result::{ExecutionResult, FinalAction};
use crate::snapshot::{check_capabilities, EngineSnapshot};
use crate::value::{ConfigMap, RequestContext, Verdict};

/// Request body of a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub form_data: ConfigMap,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Pre-resolved verdicts for injected capabilities.
    #[serde(default)]
    pub signals: BTreeMap<String, Verdict>,
}

impl SimulationRequest {
    pub fn into_context(self) -> Result<RequestContext, String> {
        let client_ip = match self.client_ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(ip) => Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| format!("client_ip '{}' is not a valid IP address", ip))?,
            ),
        };
        let mut ctx = RequestContext {
            client_ip,
            host: self.host,
            path: self.path,
            method: self.method,
            form_data: self.form_data,
            headers: self.headers,
            signals: self.signals,
        };
        ctx.normalize_headers();
        Ok(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub action: FinalAction,
    pub score: f64,
    pub execution_time_ms: f64,
    pub nodes_executed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarpit_delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub flags: Vec<String>,
    pub details: ConfigMap,
}

impl From<ExecutionResult> for SimulationReport {
    fn from(result: ExecutionResult) -> Self {
        Self {
            action: result.action,
            score: result.score,
            execution_time_ms: result.execution_time_ms,
            nodes_executed: result.nodes_executed,
            block_reason: result.block_reason,
            allow_reason: result.allow_reason,
            tarpit_delay: result.tarpit_delay,
            http_status: result.http_status,
            flags: result.flags,
            details: result.details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SimulationResponse {
    Simulation { simulation: SimulationReport },
    Errors { errors: Vec<String> },
}

impl SimulationResponse {
    pub fn errors(errors: Vec<String>) -> Self {
        SimulationResponse::Errors { errors }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SimulationResponse::Simulation { .. })
    }

    pub fn report(&self) -> Option<&SimulationReport> {
        match self {
            SimulationResponse::Simulation { simulation } => Some(simulation),
            SimulationResponse::Errors { .. } => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"errors":["{}"]}}"#, e))
    }
}

fn parse_request(body: &str) -> Result<RequestContext, Vec<String>> {
    let request: SimulationRequest = if body.trim().is_empty() {
        SimulationRequest::default()
    } else {
        serde_json::from_str(body).map_err(|e| vec![format!("invalid simulation request: {}", e)])?
    };
    request.into_context().map_err(|e| vec![e])
}

/// Runs simulations against a capability registry.
pub struct Simulator<'a> {
    registry: &'a CapabilityRegistry,
    config: &'a EngineConfig,
}

impl<'a> Simulator<'a> {
    pub fn new(registry: &'a CapabilityRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Validate `profile_json` and run it. Every validation problem is listed.
    pub fn simulate_json(&self, profile_json: &str, request_body: &str) -> SimulationResponse {
        let definition = match ProfileDefinition::from_json(profile_json) {
            Ok(def) => def,
            Err(e) => return SimulationResponse::errors(vec![e.to_string()]),
        };
        let profile = match Profile::compile_with_limit(&definition, self.config.max_node_visits) {
            Ok(profile) => profile,
            Err(errors) => return SimulationResponse::errors(errors.messages()),
        };
        let capability_errors = check_capabilities(&profile, self.registry);
        if !capability_errors.is_empty() {
            return SimulationResponse::errors(capability_errors.iter().map(ToString::to_string).collect());
        }
        self.simulate(&profile, request_body)
    }

    pub fn simulate(&self, profile: &Profile, request_body: &str) -> SimulationResponse {
        match parse_request(request_body) {
            Ok(ctx) => {
                let result = ProfileExecutor::new(self.registry, self.config).execute(profile, &ctx);
                SimulationResponse::Simulation {
                    simulation: result.into(),
                }
            }
            Err(errors) => SimulationResponse::errors(errors),
        }
    }
}

/// Simulate a profile from the loaded snapshot by id.
pub fn simulate_snapshot(snapshot: &EngineSnapshot, profile_id: &str, request_body: &str) -> SimulationResponse {
    match snapshot.profile(profile_id) {
        Some(profile) => Simulator::new(snapshot.registry(), &snapshot.config).simulate(profile, request_body),
        None => SimulationResponse::errors(vec![format!("unknown defense profile '{}'", profile_id)]),
    }
}
