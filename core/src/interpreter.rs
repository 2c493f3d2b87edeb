//! Profile executor.
//!
//! Walks one compiled [`Profile`] from its start node to a terminal action,
//! invoking the [`NodeEvaluator`] per node and carrying the running score and
//! flags along the way.
//!
//! A walk ends in one of four ways:
//!
//! ```text
//! Walking ──► Terminated(action)      action node reached
//!        ├──► Allowlisted             ip_allowlist hit with allow_action = skip_all
//!        ├──► Halted(node, handle)    handle left unconnected, default action applies
//!        └──► Faulted(EngineFault)    runtime invariant broken, default action + engine_fault
//! ```

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::defense_line::ConfigOverlay;
use crate::error::EngineFault;
use crate::evaluator::{NodeEvaluator, WalkState};
use crate::graph::{NodeIndex, Profile};
use crate::nodes::{ActionSpec, AllowAction, NodeKind};
use crate::ports::CONTINUE;
use crate::registry::CapabilityRegistry;
use crate::result::{ExecutionResult, FinalAction, Stopwatch};
use crate::value::{ConfigMap, RequestContext};

pub const ENGINE_FAULT_FLAG: &str = "engine_fault";

enum Ending {
    Terminated(ActionSpec),
    Allowlisted(String),
    Halted { node: String, handle: String },
    Faulted(EngineFault),
}

/// Runs profiles against requests. Holds no per-request state.
pub struct ProfileExecutor<'a> {
    registry: &'a CapabilityRegistry,
    config: &'a EngineConfig,
}

impl<'a> ProfileExecutor<'a> {
    pub fn new(registry: &'a CapabilityRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn execute(&self, profile: &Profile, ctx: &RequestContext) -> ExecutionResult {
        self.execute_with(profile, &ConfigOverlay::default(), ctx)
    }

    /// Execute with defense node configs replaced per `overlay`.
    pub fn execute_with(&self, profile: &Profile, overlay: &ConfigOverlay, ctx: &RequestContext) -> ExecutionResult {
        let watch = Stopwatch::start();
        let evaluator = NodeEvaluator::new(self.registry, self.config);

        let mut state = WalkState::default();
        let mut path: Vec<String> = Vec::new();
        let mut observations: Vec<String> = Vec::new();
        let mut node_details = ConfigMap::new();
        let mut visits = 0usize;
        let mut current: NodeIndex = profile.start();

        let ending = loop {
            let node = profile.node(current);
            if !matches!(node.kind, NodeKind::Start) {
                if visits >= self.config.max_node_visits {
                    break Ending::Faulted(EngineFault::VisitCeilingExceeded {
                        profile: profile.id.clone(),
                        limit: self.config.max_node_visits,
                    });
                }
                visits += 1;
            }
            path.push(node.id.clone());

            let outcome = match evaluator.evaluate(&profile.id, node, overlay.get(current), ctx, &mut state) {
                Ok(outcome) => outcome,
                Err(fault) => break Ending::Faulted(fault),
            };
            state.apply(&outcome);
            if !outcome.details.is_empty() {
                node_details.insert(node.id.clone(), Value::Object(outcome.details.clone()));
            }
            if matches!(node.kind, NodeKind::Observation { .. }) {
                observations.push(node.id.clone());
            }

            if let Some(spec) = outcome.terminal {
                break Ending::Terminated(spec.clone());
            }

            let mut handle = outcome.next_handle.unwrap_or(CONTINUE);
            if outcome.allowlisted {
                if let NodeKind::Defense(settings) = &node.kind {
                    match settings.allow_action {
                        AllowAction::SkipAll => break Ending::Allowlisted(node.id.clone()),
                        AllowAction::SkipThis => {}
                        AllowAction::ReduceScore => {
                            state.scale(0.5);
                            handle = CONTINUE;
                        }
                    }
                }
            }

            match profile.next(current, handle) {
                Some(next) => current = next,
                None => {
                    break Ending::Halted {
                        node: node.id.clone(),
                        handle: handle.to_string(),
                    }
                }
            }
        };

        let mut result = match ending {
            Ending::Terminated(spec) => self.settle(&spec, profile, &state),
            Ending::Allowlisted(node) => {
                let mut result = ExecutionResult::allow(format!("client ip allowlisted at node '{}'", node));
                result.flags = state.flags.clone();
                result.details.insert("allowlisted".to_string(), json!(node));
                result
            }
            Ending::Halted { node, handle } => {
                let action = self.default_action(profile);
                warn!(
                    profile_id = %profile.id,
                    node = %node,
                    handle = %handle,
                    action = %action,
                    "walk halted on unconnected handle"
                );
                let mut result = self.settle(&ActionSpec::default_for(action), profile, &state);
                result
                    .details
                    .insert("halted".to_string(), json!({ "node": node, "handle": handle }));
                result
            }
            Ending::Faulted(fault) => {
                let action = self.default_action(profile);
                error!(profile_id = %profile.id, fault = %fault, action = %action, "engine fault during walk");
                let mut result = self.settle(&ActionSpec::default_for(action), profile, &state);
                result.push_flag(ENGINE_FAULT_FLAG);
                result.details.insert("fault".to_string(), json!(fault.to_string()));
                result
            }
        };

        result.nodes_executed = visits;
        result.details.insert("profile_id".to_string(), json!(profile.id));
        result.details.insert("builtin".to_string(), json!(profile.builtin));
        result.details.insert("path".to_string(), json!(path));
        if !observations.is_empty() {
            result.details.insert("observations".to_string(), json!(observations));
        }
        if !node_details.is_empty() {
            result.details.insert("nodes".to_string(), Value::Object(node_details));
        }
        if !state.capability_errors.is_empty() {
            result
                .details
                .insert("capability_errors".to_string(), Value::Array(state.capability_errors));
        }
        result.execution_time_ms = watch.elapsed_ms();

        debug!(
            profile_id = %profile.id,
            action = %result.action,
            score = result.score,
            nodes_executed = result.nodes_executed,
            "profile executed"
        );
        result
    }

    fn default_action(&self, profile: &Profile) -> FinalAction {
        profile.default_action.unwrap_or(self.config.default_action)
    }

    /// Turn a terminal action into a result carrying the walk's score and flags.
    fn settle(&self, spec: &ActionSpec, profile: &Profile, state: &WalkState) -> ExecutionResult {
        let mut result = ExecutionResult::new(spec.final_action());
        result.score = state.running_score;
        result.flags = state.flags.clone();

        match spec {
            ActionSpec::Allow => {
                result.allow_reason = Some(format!("allowed by profile '{}'", profile.id));
            }
            ActionSpec::Block { http_status, reason } => {
                result.http_status = Some(*http_status);
                result.block_reason = Some(
                    reason
                        .clone()
                        .or_else(|| state.last_block_reason.clone())
                        .unwrap_or_else(|| format!("blocked by profile '{}'", profile.id)),
                );
            }
            ActionSpec::Tarpit { delay_seconds, then } => {
                result.tarpit_delay = Some(*delay_seconds);
                result.http_status = Some(then.http_status());
                result.details.insert("tarpit_then".to_string(), json!(then.as_str()));
                if let Some(reason) = &state.last_block_reason {
                    result.block_reason = Some(reason.clone());
                }
            }
            ActionSpec::Captcha => {
                if let Some(reason) = &state.last_block_reason {
                    result.details.insert("challenge_reason".to_string(), json!(reason));
                }
            }
            ActionSpec::Flag { label } => {
                result.push_flag(label);
                result.details.insert("flag_label".to_string(), json!(label));
            }
            ActionSpec::Monitor => {
                result.details.insert("score_trace".to_string(), json!(state.running_score));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProfileDefinition;
    use crate::value::Verdict;

    fn compile(json: &str) -> Profile {
        let def: ProfileDefinition = serde_json::from_str(json).unwrap();
        Profile::compile(&def).unwrap()
    }

    fn run(profile: &Profile, ctx: &RequestContext) -> ExecutionResult {
        let registry = CapabilityRegistry::with_builtins();
        let config = EngineConfig::default();
        ProfileExecutor::new(&registry, &config).execute(profile, ctx)
    }

    const SCORING_PROFILE: &str = r#"{
        "id": "scoring",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "rep", "type": "defense", "subtype": "ip_reputation", "config": {"output_mode": "score"}},
            {"id": "kw", "type": "defense", "subtype": "keyword_filter",
             "config": {"output_mode": "score", "keywords": ["casino"], "score_per_match": 15}},
            {"id": "sum", "type": "operator", "subtype": "sum"},
            {"id": "branch", "type": "operator", "subtype": "threshold_branch"},
            {"id": "allow", "type": "action", "subtype": "allow"},
            {"id": "flag", "type": "action", "subtype": "flag", "config": {"flag_label": "review"}},
            {"id": "captcha", "type": "action", "subtype": "captcha"},
            {"id": "block", "type": "action", "subtype": "block", "config": {"http_status": 429}}
        ],
        "edges": [
            {"from": "start", "handle": "next", "to": "rep"},
            {"from": "rep", "handle": "continue", "to": "kw"},
            {"from": "kw", "handle": "continue", "to": "sum"},
            {"from": "sum", "handle": "next", "to": "branch"},
            {"from": "branch", "handle": "low", "to": "allow"},
            {"from": "branch", "handle": "medium", "to": "flag"},
            {"from": "branch", "handle": "high", "to": "captcha"},
            {"from": "branch", "handle": "critical", "to": "block"}
        ]
    }"#;

    #[test]
    fn test_score_stream_routes_through_threshold() {
        let profile = compile(SCORING_PROFILE);
        let ctx = RequestContext::new()
            .with_signal("ip_reputation", Verdict::blocked("bad neighbourhood").with_score(30.0))
            .with_form_field("comment", "win at the casino");
        let result = run(&profile, &ctx);
        assert_eq!(result.action, FinalAction::Flag);
        assert_eq!(result.score, 45.0);
        assert!(result.flags.contains(&"review".to_string()));
        assert!(result.flags.contains(&"keyword_match".to_string()));
        assert_eq!(result.nodes_executed, 5);
        assert_eq!(
            result.details["path"],
            json!(["start", "rep", "kw", "sum", "branch", "flag"])
        );
    }

    #[test]
    fn test_clean_request_is_allowed() {
        let profile = compile(SCORING_PROFILE);
        let result = run(&profile, &RequestContext::new().with_form_field("comment", "hello"));
        assert_eq!(result.action, FinalAction::Allow);
        assert_eq!(result.score, 0.0);
        assert!(result.allow_reason.is_some());
    }

    #[test]
    fn test_critical_score_blocks_with_configured_status() {
        let profile = compile(SCORING_PROFILE);
        let ctx = RequestContext::new().with_signal("ip_reputation", Verdict::pass().with_score(120.0));
        let result = run(&profile, &ctx);
        assert_eq!(result.action, FinalAction::Block);
        assert_eq!(result.http_status, Some(429));
        assert_eq!(result.block_reason.as_deref(), Some("blocked by profile 'scoring'"));
    }

    const ALLOWLIST_PROFILE: &str = r#"{
        "id": "allowlist",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "al", "type": "defense", "subtype": "ip_allowlist",
             "config": {"ips": ["10.0.0.0/8"], "allow_action": "ALLOW_ACTION"}},
            {"id": "rep", "type": "defense", "subtype": "ip_reputation", "config": {"output_mode": "both"}},
            {"id": "allow", "type": "action", "subtype": "allow"},
            {"id": "block", "type": "action", "subtype": "block"}
        ],
        "edges": [
            {"from": "start", "handle": "next", "to": "al"},
            {"from": "al", "handle": "allowed", "to": "allow"},
            {"from": "al", "handle": "continue", "to": "rep"},
            {"from": "rep", "handle": "blocked", "to": "block"},
            {"from": "rep", "handle": "continue", "to": "allow"}
        ]
    }"#;

    fn allowlist_profile(allow_action: &str) -> Profile {
        compile(&ALLOWLIST_PROFILE.replace("ALLOW_ACTION", allow_action))
    }

    fn listed_bad_client() -> RequestContext {
        RequestContext::new()
            .with_client_ip("10.2.3.4".parse().unwrap())
            .with_signal("ip_reputation", Verdict::blocked("tor exit").with_score(80.0))
    }

    #[test]
    fn test_skip_this_follows_allowed_edge() {
        let result = run(&allowlist_profile("skip_this"), &listed_bad_client());
        assert_eq!(result.action, FinalAction::Allow);
        assert_eq!(result.nodes_executed, 2);
        assert!(result.details.get("allowlisted").is_none());
    }

    #[test]
    fn test_reduce_score_halves_and_continues() {
        let result = run(&allowlist_profile("reduce_score"), &listed_bad_client());
        assert_eq!(result.action, FinalAction::Block);
        assert_eq!(result.score, 80.0);
        assert_eq!(result.block_reason.as_deref(), Some("tor exit"));
    }

    #[test]
    fn test_skip_all_bypasses_graph() {
        let result = run(&allowlist_profile("skip_all"), &listed_bad_client());
        assert_eq!(result.action, FinalAction::Allow);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.nodes_executed, 1);
        assert_eq!(result.details["allowlisted"], "al");
    }

    #[test]
    fn test_unlisted_client_continues() {
        let ctx = RequestContext::new()
            .with_client_ip("203.0.113.9".parse().unwrap())
            .with_signal("ip_reputation", Verdict::blocked("tor exit").with_score(80.0));
        let result = run(&allowlist_profile("skip_all"), &ctx);
        assert_eq!(result.action, FinalAction::Block);
        assert_eq!(result.http_status, Some(403));
    }

    const PARTIAL_PROFILE: &str = r#"{
        "id": "partial",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "hp", "type": "defense", "subtype": "honeypot"},
            {"id": "block", "type": "action", "subtype": "block"}
        ],
        "edges": [
            {"from": "start", "handle": "next", "to": "hp"},
            {"from": "hp", "handle": "blocked", "to": "block"}
        ]
    }"#;

    #[test]
    fn test_unconnected_handle_halts_to_default_action() {
        let profile = compile(PARTIAL_PROFILE);
        let result = run(&profile, &RequestContext::new());
        assert_eq!(result.action, FinalAction::Monitor);
        assert_eq!(result.details["halted"], json!({"node": "hp", "handle": "continue"}));
    }

    #[test]
    fn test_profile_default_action_overrides_engine_default() {
        let json = PARTIAL_PROFILE.replace(r#""id": "partial","#, r#""id": "partial", "default_action": "captcha","#);
        let result = run(&compile(&json), &RequestContext::new());
        assert_eq!(result.action, FinalAction::Captcha);
    }

    #[test]
    fn test_visit_ceiling_faults_to_default_action() {
        let profile = compile(SCORING_PROFILE);
        let registry = CapabilityRegistry::with_builtins();
        let config = EngineConfig {
            max_node_visits: 2,
            default_action: FinalAction::Block,
            ..EngineConfig::default()
        };
        let result = ProfileExecutor::new(&registry, &config).execute(&profile, &RequestContext::new());
        assert_eq!(result.action, FinalAction::Block);
        assert!(result.flags.contains(&ENGINE_FAULT_FLAG.to_string()));
        assert!(result.details["fault"].as_str().unwrap().contains("ceiling"));
        assert_eq!(result.nodes_executed, 2);
        // the node that hit the ceiling never ran
        assert_eq!(result.details["path"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_tarpit_reports_delay_and_status() {
        let profile = compile(r#"{
            "id": "slow",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "tp", "type": "action", "subtype": "tarpit", "config": {"delay_seconds": 5, "then": "reject"}}
            ],
            "edges": [{"from": "start", "handle": "next", "to": "tp"}]
        }"#);
        let result = run(&profile, &RequestContext::new());
        assert_eq!(result.action, FinalAction::Tarpit);
        assert_eq!(result.tarpit_delay, Some(5));
        assert_eq!(result.http_status, Some(429));
    }

    #[test]
    fn test_observation_recorded_but_inert() {
        let profile = compile(r#"{
            "id": "learn",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "fl", "type": "observation", "subtype": "field_learning"},
                {"id": "allow", "type": "action", "subtype": "allow"}
            ],
            "edges": [
                {"from": "start", "handle": "next", "to": "fl"},
                {"from": "fl", "handle": "continue", "to": "allow"}
            ]
        }"#);
        let result = run(&profile, &RequestContext::new());
        assert_eq!(result.action, FinalAction::Allow);
        assert_eq!(result.details["observations"], json!(["fl"]));
        assert!(result.flags.is_empty());
    }

    #[test]
    fn test_repeat_execution_is_identical() {
        let profile = compile(SCORING_PROFILE);
        let ctx = RequestContext::new().with_form_field("comment", "casino casino");
        let first = run(&profile, &ctx);
        let second = run(&profile, &ctx);
        assert_eq!(first.without_timing(), second.without_timing());
    }
}
