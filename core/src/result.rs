//! Execution results.

use serde::{Deserialize, Serialize};

use crate::value::ConfigMap;

/// The terminal decision for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalAction {
    Allow,
    Block,
    Captcha,
    Tarpit,
    Flag,
    #[default]
    Monitor,
}

impl FinalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Allow => "allow",
            FinalAction::Block => "block",
            FinalAction::Captcha => "captcha",
            FinalAction::Tarpit => "tarpit",
            FinalAction::Flag => "flag",
            FinalAction::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(FinalAction::Allow),
            "block" => Some(FinalAction::Block),
            "captcha" => Some(FinalAction::Captcha),
            "tarpit" => Some(FinalAction::Tarpit),
            "flag" => Some(FinalAction::Flag),
            "monitor" => Some(FinalAction::Monitor),
            _ => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, FinalAction::Block)
    }

    /// Whether the request reaches the backend (`flag`/`monitor` are allow with annotation).
    pub fn forwards_request(&self) -> bool {
        matches!(self, FinalAction::Allow | FinalAction::Flag | FinalAction::Monitor)
    }
}

impl std::fmt::Display for FinalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one or more profiles against one request.
///
/// Built once per request and never mutated after it is handed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action: FinalAction,
    pub score: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub details: ConfigMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarpit_delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub nodes_executed: usize,
    pub execution_time_ms: f64,
}

impl ExecutionResult {
    pub fn new(action: FinalAction) -> Self {
        Self {
            action,
            score: 0.0,
            flags: Vec::new(),
            details: ConfigMap::new(),
            block_reason: None,
            allow_reason: None,
            tarpit_delay: None,
            http_status: None,
            nodes_executed: 0,
            execution_time_ms: 0.0,
        }
    }

    pub fn allow(reason: impl Into<String>) -> Self {
        let mut result = Self::new(FinalAction::Allow);
        result.allow_reason = Some(reason.into());
        result
    }

    pub fn is_block(&self) -> bool {
        self.action.is_block()
    }

    /// Copy with the timing field zeroed, for comparing two evaluations.
    pub fn without_timing(&self) -> Self {
        Self {
            execution_time_ms: 0.0,
            ..self.clone()
        }
    }

    pub(crate) fn push_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }
}

/// Wall-clock stopwatch. Browser WASM has no monotonic clock, so it reads zero there.
pub(crate) struct Stopwatch {
    #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
    started: std::time::Instant,
}

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self {
            #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
            started: std::time::Instant::now(),
        }
    }

    pub(crate) fn elapsed_ms(&self) -> f64 {
        #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
        {
            self.started.elapsed().as_secs_f64() * 1000.0
        }
        #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
        {
            0.0
        }
    }
}
