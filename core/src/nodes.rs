//! Node type definitions.
//!
//! Nodes are authored as `{type, subtype, config}` triples. At load time each
//! one is parsed into a [`NodeKind`] so the evaluator matches on typed
//! variants instead of re-reading JSON on every request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ports;
use crate::registry::NodeConfig;
use crate::result::FinalAction;
use crate::threshold::{ThresholdRange, ThresholdRanges};
use crate::value::{config_f64, config_str, ConfigMap};

/// Authored node category (`type` in the profile JSON).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    Defense,
    Operator,
    Action,
    Observation,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::Defense => "defense",
            NodeType::Operator => "operator",
            NodeType::Action => "action",
            NodeType::Observation => "observation",
        }
    }
}

/// How a defense verdict feeds the walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Route on `blocked`, no score.
    #[default]
    Binary,
    /// Add the weighted score, always route `continue`.
    Score,
    /// Add the weighted score and route on `blocked`.
    Both,
}

/// What a positive `ip_allowlist` match means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowAction {
    /// Stop the walk and allow immediately.
    SkipAll,
    /// Follow the `allowed` edge.
    #[default]
    SkipThis,
    /// Halve the running score and follow `continue`.
    ReduceScore,
}

/// Typed settings of a defense node.
#[derive(Debug, Clone, PartialEq)]
pub struct DefenseSettings {
    pub subtype: String,
    pub output_mode: OutputMode,
    pub score_weight: f64,
    pub allow_action: AllowAction,
    /// Config handed to the capability.
    pub config: Arc<NodeConfig>,
}

impl DefenseSettings {
    pub fn is_allowlist(&self) -> bool {
        self.subtype == ports::IP_ALLOWLIST
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    Sum,
    Max,
    Min,
    And,
    Or,
    ThresholdBranch(ThresholdRanges),
}

impl OperatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Sum => "sum",
            OperatorKind::Max => "max",
            OperatorKind::Min => "min",
            OperatorKind::And => "and",
            OperatorKind::Or => "or",
            OperatorKind::ThresholdBranch(_) => "threshold_branch",
        }
    }
}

/// What a tarpit resolves to once the delay has elapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarpitThen {
    #[default]
    Block,
    Reject,
}

impl TarpitThen {
    pub fn http_status(&self) -> u16 {
        match self {
            TarpitThen::Block => 403,
            TarpitThen::Reject => 429,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TarpitThen::Block => "block",
            TarpitThen::Reject => "reject",
        }
    }
}

pub const BLOCK_STATUSES: [u16; 3] = [403, 429, 503];
pub const DEFAULT_BLOCK_STATUS: u16 = 403;
pub const DEFAULT_TARPIT_DELAY: u32 = 10;
pub const TARPIT_DELAY_RANGE: std::ops::RangeInclusive<u32> = 1..=60;
pub const DEFAULT_FLAG_LABEL: &str = "flagged";

/// Terminal behavior of an action node.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpec {
    Allow,
    Block {
        http_status: u16,
        reason: Option<String>,
    },
    Tarpit {
        delay_seconds: u32,
        then: TarpitThen,
    },
    Captcha,
    Flag {
        label: String,
    },
    Monitor,
}

impl ActionSpec {
    pub fn final_action(&self) -> FinalAction {
        match self {
            ActionSpec::Allow => FinalAction::Allow,
            ActionSpec::Block { .. } => FinalAction::Block,
            ActionSpec::Tarpit { .. } => FinalAction::Tarpit,
            ActionSpec::Captcha => FinalAction::Captcha,
            ActionSpec::Flag { .. } => FinalAction::Flag,
            ActionSpec::Monitor => FinalAction::Monitor,
        }
    }

    /// Action spec with default settings, used for halts and faults.
    pub fn default_for(action: FinalAction) -> Self {
        match action {
            FinalAction::Allow => ActionSpec::Allow,
            FinalAction::Block => ActionSpec::Block {
                http_status: DEFAULT_BLOCK_STATUS,
                reason: None,
            },
            FinalAction::Tarpit => ActionSpec::Tarpit {
                delay_seconds: DEFAULT_TARPIT_DELAY,
                then: TarpitThen::Block,
            },
            FinalAction::Captcha => ActionSpec::Captcha,
            FinalAction::Flag => ActionSpec::Flag {
                label: DEFAULT_FLAG_LABEL.to_string(),
            },
            FinalAction::Monitor => ActionSpec::Monitor,
        }
    }

    fn parse(subtype: &str, config: &ConfigMap) -> Result<Self, String> {
        let action = FinalAction::parse(subtype)
            .ok_or_else(|| format!("unknown action subtype '{}'", subtype))?;
        Ok(match action {
            FinalAction::Allow => ActionSpec::Allow,
            FinalAction::Captcha => ActionSpec::Captcha,
            FinalAction::Monitor => ActionSpec::Monitor,
            FinalAction::Block => {
                let http_status = match config.get("http_status") {
                    None => DEFAULT_BLOCK_STATUS,
                    Some(v) => v
                        .as_u64()
                        .and_then(|s| u16::try_from(s).ok())
                        .filter(|s| BLOCK_STATUSES.contains(s))
                        .ok_or_else(|| format!("http_status must be one of 403, 429, 503, got {}", v))?,
                };
                let reason = config_str(config, "reason")
                    .or_else(|| config_str(config, "message"))
                    .map(str::to_string);
                ActionSpec::Block { http_status, reason }
            }
            FinalAction::Tarpit => {
                let delay_seconds = match config.get("delay_seconds") {
                    None => DEFAULT_TARPIT_DELAY,
                    Some(v) => v
                        .as_u64()
                        .and_then(|d| u32::try_from(d).ok())
                        .filter(|d| TARPIT_DELAY_RANGE.contains(d))
                        .ok_or_else(|| format!("delay_seconds must be between 1 and 60, got {}", v))?,
                };
                let then = match config_str(config, "then") {
                    None => TarpitThen::Block,
                    Some("block") => TarpitThen::Block,
                    Some("reject") => TarpitThen::Reject,
                    Some(other) => return Err(format!("then must be 'block' or 'reject', got '{}'", other)),
                };
                ActionSpec::Tarpit { delay_seconds, then }
            }
            FinalAction::Flag => ActionSpec::Flag {
                label: config_str(config, "flag_label")
                    .filter(|l| !l.is_empty())
                    .unwrap_or(DEFAULT_FLAG_LABEL)
                    .to_string(),
            },
        })
    }
}

/// A node's behavior, keyed by `(type, subtype)`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Defense(DefenseSettings),
    Operator(OperatorKind),
    Action(ActionSpec),
    Observation { subtype: String },
}

impl NodeKind {
    /// Parse an authored node. The error is a human-readable reason.
    pub fn parse(node_type: NodeType, subtype: &str, config: &ConfigMap) -> Result<Self, NodeConfigError> {
        match node_type {
            NodeType::Start => Ok(NodeKind::Start),
            NodeType::Observation => Ok(NodeKind::Observation {
                subtype: subtype.to_string(),
            }),
            NodeType::Action => ActionSpec::parse(subtype, config)
                .map(NodeKind::Action)
                .map_err(NodeConfigError::Config),
            NodeType::Defense => parse_defense(subtype, config)
                .map(NodeKind::Defense)
                .map_err(NodeConfigError::Config),
            NodeType::Operator => parse_operator(subtype, config).map(NodeKind::Operator),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::Defense(_) => NodeType::Defense,
            NodeKind::Operator(_) => NodeType::Operator,
            NodeKind::Action(_) => NodeType::Action,
            NodeKind::Observation { .. } => NodeType::Observation,
        }
    }

    /// Legal output handles of this node. Everything but `threshold_branch`
    /// comes from the static table in [`ports`].
    pub fn handles(&self) -> Vec<&str> {
        let subtype = match self {
            NodeKind::Operator(OperatorKind::ThresholdBranch(ranges)) => return ranges.outputs().collect(),
            NodeKind::Defense(d) => d.subtype.as_str(),
            NodeKind::Operator(op) => op.as_str(),
            NodeKind::Observation { subtype } => subtype.as_str(),
            NodeKind::Start | NodeKind::Action(_) => "",
        };
        ports::static_handles(self.node_type().as_str(), subtype)
            .unwrap_or_default()
            .to_vec()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Action(_))
    }
}

/// Why an authored node could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfigError {
    Config(String),
    Ranges(Vec<String>),
}

fn parse_defense(subtype: &str, config: &ConfigMap) -> Result<DefenseSettings, String> {
    if subtype.is_empty() {
        return Err("defense node requires a subtype".to_string());
    }
    let output_mode = match config.get("output_mode") {
        None => OutputMode::Binary,
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| format!("output_mode must be binary, score or both, got {}", v))?,
    };
    let score_weight = match config.get("score_weight") {
        None => 1.0,
        Some(_) => config_f64(config, "score_weight")
            .filter(|w| w.is_finite() && *w >= 0.0)
            .ok_or_else(|| "score_weight must be a finite non-negative number".to_string())?,
    };
    let allow_action = match config.get("allow_action") {
        None => AllowAction::default(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| format!("allow_action must be skip_all, skip_this or reduce_score, got {}", v))?,
    };
    Ok(DefenseSettings {
        subtype: subtype.to_string(),
        output_mode,
        score_weight,
        allow_action,
        config: Arc::new(NodeConfig::new(config.clone())),
    })
}

fn parse_operator(subtype: &str, config: &ConfigMap) -> Result<OperatorKind, NodeConfigError> {
    match subtype {
        "sum" => Ok(OperatorKind::Sum),
        "max" => Ok(OperatorKind::Max),
        "min" => Ok(OperatorKind::Min),
        "and" => Ok(OperatorKind::And),
        "or" => Ok(OperatorKind::Or),
        "threshold_branch" => {
            let ranges = match config.get("ranges") {
                None => return Ok(OperatorKind::ThresholdBranch(ThresholdRanges::default_ranges())),
                Some(v) => serde_json::from_value::<Vec<ThresholdRange>>(v.clone())
                    .map_err(|e| NodeConfigError::Ranges(vec![format!("malformed ranges: {}", e)]))?,
            };
            ThresholdRanges::new(ranges)
                .map(OperatorKind::ThresholdBranch)
                .map_err(NodeConfigError::Ranges)
        }
        other => Err(NodeConfigError::Config(format!("unknown operator subtype '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ConfigMap {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defense_defaults() {
        let kind = NodeKind::parse(NodeType::Defense, "honeypot", &config("{}")).unwrap();
        match kind {
            NodeKind::Defense(d) => {
                assert_eq!(d.output_mode, OutputMode::Binary);
                assert_eq!(d.score_weight, 1.0);
                assert_eq!(d.allow_action, AllowAction::SkipThis);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_defense_rejects_unknown_output_mode() {
        let err = NodeKind::parse(NodeType::Defense, "honeypot", &config(r#"{"output_mode":"loud"}"#)).unwrap_err();
        assert!(matches!(err, NodeConfigError::Config(msg) if msg.contains("output_mode")));
    }

    #[test]
    fn test_allowlist_handles() {
        let kind = NodeKind::parse(NodeType::Defense, "ip_allowlist", &config(r#"{"allow_action":"skip_all"}"#)).unwrap();
        assert_eq!(kind.handles(), vec!["allowed", "continue"]);
    }

    #[test]
    fn test_block_status_bounds() {
        let ok = NodeKind::parse(NodeType::Action, "block", &config(r#"{"http_status":429}"#)).unwrap();
        assert_eq!(ok, NodeKind::Action(ActionSpec::Block { http_status: 429, reason: None }));

        let err = NodeKind::parse(NodeType::Action, "block", &config(r#"{"http_status":500}"#));
        assert!(err.is_err());
    }

    #[test]
    fn test_tarpit_defaults_and_bounds() {
        let kind = NodeKind::parse(NodeType::Action, "tarpit", &config("{}")).unwrap();
        assert_eq!(kind, NodeKind::Action(ActionSpec::Tarpit { delay_seconds: 10, then: TarpitThen::Block }));

        let reject = NodeKind::parse(NodeType::Action, "tarpit", &config(r#"{"delay_seconds":5,"then":"reject"}"#)).unwrap();
        assert_eq!(reject, NodeKind::Action(ActionSpec::Tarpit { delay_seconds: 5, then: TarpitThen::Reject }));

        assert!(NodeKind::parse(NodeType::Action, "tarpit", &config(r#"{"delay_seconds":61}"#)).is_err());
        assert!(NodeKind::parse(NodeType::Action, "tarpit", &config(r#"{"delay_seconds":0}"#)).is_err());
    }

    #[test]
    fn test_flag_label() {
        let kind = NodeKind::parse(NodeType::Action, "flag", &config(r#"{"flag_label":"suspicious"}"#)).unwrap();
        assert_eq!(kind, NodeKind::Action(ActionSpec::Flag { label: "suspicious".to_string() }));
    }

    #[test]
    fn test_threshold_branch_uses_default_ranges() {
        let kind = NodeKind::parse(NodeType::Operator, "threshold_branch", &config("{}")).unwrap();
        assert_eq!(kind.handles(), vec!["low", "medium", "high", "critical"]);
    }

    #[test]
    fn test_threshold_branch_reports_range_problems() {
        let json = r#"{"ranges":[{"min":0,"max":10,"output":"a"},{"min":20,"max":null,"output":"b"}]}"#;
        let err = NodeKind::parse(NodeType::Operator, "threshold_branch", &config(json)).unwrap_err();
        assert!(matches!(err, NodeConfigError::Ranges(_)));
    }

    #[test]
    fn test_unknown_action_subtype() {
        assert!(NodeKind::parse(NodeType::Action, "redirect", &config("{}")).is_err());
    }

    #[test]
    fn test_handles_agree_with_static_table() {
        let cases = [
            (NodeType::Start, "", "{}"),
            (NodeType::Defense, "honeypot", "{}"),
            (NodeType::Defense, "ip_allowlist", "{}"),
            (NodeType::Operator, "sum", "{}"),
            (NodeType::Operator, "or", "{}"),
            (NodeType::Action, "block", "{}"),
            (NodeType::Observation, "field_learning", "{}"),
        ];
        for (node_type, subtype, cfg) in cases {
            let kind = NodeKind::parse(node_type, subtype, &config(cfg)).unwrap();
            let expected = ports::static_handles(node_type.as_str(), subtype).unwrap().to_vec();
            assert_eq!(kind.handles(), expected, "{} {}", node_type.as_str(), subtype);
        }
    }
}
