//! Per-request audit record written to the `security_logs` endpoint.

use chrono::Utc;
use dpe_core::{ExecutionResult, RequestContext};
use serde::Serialize;
use uuid::Uuid;

/// Fastly log endpoint receiving one JSON line per request.
pub const LOG_ENDPOINT: &str = "security_logs";

#[derive(Debug, Clone, Serialize)]
pub struct WafLog {
    pub request_id: String,
    pub timestamp: String,
    pub client_ip: Option<String>,
    pub host: String,
    pub path: String,
    pub method: String,
    pub final_action: String,
    pub blocked: bool,
    pub score: f64,
    pub flags: Vec<String>,
    pub nodes_executed: usize,
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub response_status: Option<u16>,
    pub snapshot_version: String,
    pub total_time_ms: f64,
}

impl WafLog {
    pub fn new(ctx: &RequestContext) -> Self {
        Self {
            request_id: Uuid::now_v7().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            client_ip: ctx.client_ip.map(|ip| ip.to_string()),
            host: ctx.host.clone(),
            path: ctx.path.clone(),
            method: ctx.method.clone(),
            final_action: String::new(),
            blocked: false,
            score: 0.0,
            flags: Vec::new(),
            nodes_executed: 0,
            execution_time_ms: 0.0,
            reason: None,
            endpoint: None,
            response_status: None,
            snapshot_version: String::new(),
            total_time_ms: 0.0,
        }
    }

    pub fn set_final_action(&mut self, action: &str) {
        self.final_action = action.to_string();
    }

    /// Copies the engine's decision into the record.
    pub fn record(&mut self, result: &ExecutionResult, snapshot_version: &str) {
        self.final_action = result.action.as_str().to_string();
        self.blocked = result.is_block();
        self.score = result.score;
        self.flags = result.flags.clone();
        self.nodes_executed = result.nodes_executed;
        self.execution_time_ms = result.execution_time_ms;
        self.reason = result.block_reason.clone().or_else(|| result.allow_reason.clone());
        self.endpoint = result.details.get("endpoint").and_then(|v| v.as_str()).map(str::to_string);
        self.snapshot_version = snapshot_version.to_string();
    }

    pub fn set_response_status(&mut self, status: u16) {
        self.response_status = Some(status);
    }

    pub fn finalize(&mut self, total_time_ms: f64) {
        self.total_time_ms = total_time_ms;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
