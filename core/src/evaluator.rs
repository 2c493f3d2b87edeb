//! Node evaluator: runs one node against the accumulated walk state.

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineFault;
use crate::graph::Node;
use crate::nodes::{ActionSpec, DefenseSettings, NodeKind, OperatorKind, OutputMode};
use crate::ports::{ALLOWED, BLOCKED, CONTINUE, NEXT};
use crate::registry::{CapabilityRegistry, NodeConfig};
use crate::value::{ConfigMap, RequestContext};

/// Accumulated state of one profile walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalkState {
    pub running_score: f64,
    pub flags: Vec<String>,
    /// Score contributions feeding the next `sum`/`max`/`min` operator.
    pub contributions: Vec<f64>,
    /// Blocked signals feeding the next `and`/`or` operator.
    pub block_signals: Vec<bool>,
    /// Reason given by the most recent blocking verdict.
    pub last_block_reason: Option<String>,
    pub capability_errors: Vec<serde_json::Value>,
}

impl WalkState {
    pub(crate) fn apply(&mut self, outcome: &NodeOutcome<'_>) {
        self.running_score += outcome.score_delta;
        for flag in &outcome.flags {
            if !self.flags.contains(flag) {
                self.flags.push(flag.clone());
            }
        }
    }

    /// Multiply the running score and every pending contribution.
    pub(crate) fn scale(&mut self, factor: f64) {
        self.running_score *= factor;
        for c in &mut self.contributions {
            *c *= factor;
        }
    }
}

/// Result of evaluating one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutcome<'n> {
    /// Handle to follow. `None` for terminal nodes.
    pub next_handle: Option<&'n str>,
    pub score_delta: f64,
    pub blocked: bool,
    pub flags: Vec<String>,
    pub details: ConfigMap,
    /// Set by action nodes.
    pub terminal: Option<&'n ActionSpec>,
    /// Set when an `ip_allowlist` node matched.
    pub allowlisted: bool,
}

impl<'n> NodeOutcome<'n> {
    fn route(handle: &'n str) -> Self {
        Self {
            next_handle: Some(handle),
            ..Self::default()
        }
    }
}

/// Evaluates nodes against a registry of capabilities.
pub struct NodeEvaluator<'a> {
    registry: &'a CapabilityRegistry,
    config: &'a EngineConfig,
}

impl<'a> NodeEvaluator<'a> {
    pub fn new(registry: &'a CapabilityRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Evaluate `node`. `config_override` replaces a defense node's static config
    /// (signature merge). Score and signal bookkeeping is updated in `state`.
    pub fn evaluate<'n>(
        &self,
        profile_id: &str,
        node: &'n Node,
        config_override: Option<&NodeConfig>,
        ctx: &RequestContext,
        state: &mut WalkState,
    ) -> Result<NodeOutcome<'n>, EngineFault> {
        let outcome = match &node.kind {
            NodeKind::Start => NodeOutcome::route(NEXT),
            NodeKind::Defense(settings) => self.evaluate_defense(profile_id, node, settings, config_override, ctx, state),
            NodeKind::Operator(op) => evaluate_operator(profile_id, node, op, state)?,
            NodeKind::Action(spec) => {
                let mut outcome = NodeOutcome {
                    terminal: Some(spec),
                    ..NodeOutcome::default()
                };
                if let ActionSpec::Flag { label } = spec {
                    outcome.flags.push(label.clone());
                }
                outcome
            }
            NodeKind::Observation { .. } => NodeOutcome::route(CONTINUE),
        };

        debug!(
            profile_id,
            node = %node.id,
            handle = outcome.next_handle.unwrap_or("-"),
            score_delta = outcome.score_delta,
            blocked = outcome.blocked,
            "node evaluated"
        );
        Ok(outcome)
    }

    fn evaluate_defense<'n>(
        &self,
        profile_id: &str,
        node: &'n Node,
        settings: &'n DefenseSettings,
        config_override: Option<&NodeConfig>,
        ctx: &RequestContext,
        state: &mut WalkState,
    ) -> NodeOutcome<'n> {
        let config = config_override.unwrap_or(settings.config.as_ref());
        let verdict = match self.registry.invoke(&settings.subtype, config, ctx) {
            Ok(verdict) => verdict,
            Err(error) => {
                let policy = self.config.fail_policy(&settings.subtype);
                warn!(
                    profile_id,
                    node = %node.id,
                    subtype = %settings.subtype,
                    ?policy,
                    error = %error,
                    "capability error, applying fail policy"
                );
                state.capability_errors.push(serde_json::json!({
                    "node": node.id,
                    "subtype": settings.subtype,
                    "error": error.to_string(),
                }));
                policy.fallback_verdict(&error)
            }
        };

        if settings.is_allowlist() {
            return NodeOutcome {
                next_handle: Some(if verdict.blocked { ALLOWED } else { CONTINUE }),
                allowlisted: verdict.blocked,
                flags: verdict.flags,
                details: verdict.details,
                ..NodeOutcome::default()
            };
        }

        let weighted = verdict.score * settings.score_weight;
        let (score_delta, blocked) = match settings.output_mode {
            OutputMode::Binary => (0.0, verdict.blocked),
            OutputMode::Score => (weighted, false),
            OutputMode::Both => (weighted, verdict.blocked),
        };

        if settings.output_mode != OutputMode::Binary {
            state.contributions.push(score_delta);
        }
        state.block_signals.push(blocked);
        if blocked {
            state.last_block_reason = Some(
                verdict
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{} check blocked at node '{}'", settings.subtype, node.id)),
            );
        }

        NodeOutcome {
            next_handle: Some(if blocked { BLOCKED } else { CONTINUE }),
            score_delta,
            blocked,
            flags: verdict.flags,
            details: verdict.details,
            ..NodeOutcome::default()
        }
    }
}

fn evaluate_operator<'n>(
    profile_id: &str,
    node: &'n Node,
    op: &'n OperatorKind,
    state: &mut WalkState,
) -> Result<NodeOutcome<'n>, EngineFault> {
    let current = state.running_score;
    match op {
        OperatorKind::Sum | OperatorKind::Max | OperatorKind::Min => {
            let combined = if state.contributions.is_empty() {
                current
            } else {
                match op {
                    OperatorKind::Max => state.contributions.iter().copied().fold(f64::MIN, f64::max),
                    OperatorKind::Min => state.contributions.iter().copied().fold(f64::MAX, f64::min),
                    _ => current,
                }
            };
            // The combined value becomes the single contribution seen downstream.
            state.contributions = vec![combined];
            Ok(NodeOutcome {
                next_handle: Some(NEXT),
                score_delta: combined - current,
                ..NodeOutcome::default()
            })
        }
        OperatorKind::And | OperatorKind::Or => {
            let blocked = match op {
                OperatorKind::And => !state.block_signals.is_empty() && state.block_signals.iter().all(|b| *b),
                _ => state.block_signals.iter().any(|b| *b),
            };
            state.block_signals = vec![blocked];
            Ok(NodeOutcome {
                next_handle: Some(if blocked { BLOCKED } else { CONTINUE }),
                blocked,
                ..NodeOutcome::default()
            })
        }
        OperatorKind::ThresholdBranch(ranges) => match ranges.route(current) {
            Some(output) => Ok(NodeOutcome::route(output)),
            None => Err(EngineFault::NoMatchingRange {
                profile: profile_id.to_string(),
                node: node.id.clone(),
                score: current,
            }),
        },
    }
}
