//! Multi-profile orchestrator.
//!
//! Runs every profile attached to an endpoint in priority order and folds the
//! per-profile results into one decision.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::defense_line::ConfigOverlay;
use crate::graph::Profile;
use crate::interpreter::ProfileExecutor;
use crate::registry::CapabilityRegistry;
use crate::result::{ExecutionResult, FinalAction, Stopwatch};
use crate::value::RequestContext;

/// How per-profile block decisions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    #[default]
    Or,
    And,
    Majority,
}

impl Aggregation {
    fn is_block(&self, blocks: usize, total: usize) -> bool {
        match self {
            Aggregation::Or => blocks > 0,
            Aggregation::And => total > 0 && blocks == total,
            Aggregation::Majority => blocks * 2 > total,
        }
    }

    /// Whether the outcome is fixed whatever the remaining profiles return.
    /// `total` counts evaluated and pending profiles.
    fn is_decided(&self, blocks: usize, non_blocks: usize, total: usize) -> bool {
        match self {
            Aggregation::Or => blocks > 0,
            Aggregation::And => non_blocks > 0,
            Aggregation::Majority => blocks * 2 > total || non_blocks * 2 >= total,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Or => "OR",
            Aggregation::And => "AND",
            Aggregation::Majority => "MAJORITY",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreAggregation {
    #[default]
    Sum,
    Max,
    WeightedAvg,
}

impl ScoreAggregation {
    /// Combine `(score, weight)` pairs.
    pub fn combine(&self, scores: &[(f64, f64)]) -> f64 {
        match self {
            ScoreAggregation::Sum => scores.iter().map(|(s, _)| s).sum(),
            ScoreAggregation::Max => scores.iter().map(|(s, _)| *s).fold(0.0, f64::max),
            ScoreAggregation::WeightedAvg => {
                let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
                if total_weight <= 0.0 {
                    0.0
                } else {
                    scores.iter().map(|(s, w)| s * w).sum::<f64>() / total_weight
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreAggregation::Sum => "SUM",
            ScoreAggregation::Max => "MAX",
            ScoreAggregation::WeightedAvg => "WEIGHTED_AVG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    /// Falls back to the profile's own priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl ProfileRef {
    pub fn new(id: &str, priority: i64, weight: f64) -> Self {
        Self {
            id: id.to_string(),
            priority: Some(priority),
            weight,
        }
    }
}

/// Endpoint-level profile attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseProfileAttachment {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub profiles: Vec<ProfileRef>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub score_aggregation: ScoreAggregation,
    #[serde(default)]
    pub short_circuit: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for DefenseProfileAttachment {
    fn default() -> Self {
        Self {
            enabled: true,
            profiles: Vec::new(),
            aggregation: Aggregation::default(),
            score_aggregation: ScoreAggregation::default(),
            short_circuit: false,
        }
    }
}

/// Where the orchestrator finds compiled profiles and their per-request overlays.
pub trait ProfileSource {
    fn profile(&self, id: &str) -> Option<&Profile>;

    fn overlay(&self, _profile: &Profile, _ctx: &RequestContext) -> Cow<'_, ConfigOverlay> {
        Cow::Owned(ConfigOverlay::default())
    }
}

impl ProfileSource for HashMap<String, Profile> {
    fn profile(&self, id: &str) -> Option<&Profile> {
        self.get(id)
    }
}

impl ProfileSource for HashMap<String, Arc<Profile>> {
    fn profile(&self, id: &str) -> Option<&Profile> {
        self.get(id).map(|p| p.as_ref())
    }
}

pub struct Orchestrator<'a> {
    executor: ProfileExecutor<'a>,
    config: &'a EngineConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(registry: &'a CapabilityRegistry, config: &'a EngineConfig) -> Self {
        Self {
            executor: ProfileExecutor::new(registry, config),
            config,
        }
    }

    pub fn run<S: ProfileSource + ?Sized>(
        &self,
        attachment: &DefenseProfileAttachment,
        source: &S,
        ctx: &RequestContext,
    ) -> ExecutionResult {
        let watch = Stopwatch::start();
        if !attachment.enabled || attachment.profiles.is_empty() {
            let mut result = ExecutionResult::allow("no defense profiles attached");
            result.execution_time_ms = watch.elapsed_ms();
            return result;
        }

        let mut ordered: Vec<(usize, &ProfileRef, Option<&Profile>)> = attachment
            .profiles
            .iter()
            .enumerate()
            .map(|(pos, r)| (pos, r, source.profile(&r.id)))
            .collect();
        ordered.sort_by_key(|(pos, r, p)| (r.priority.or(p.map(|p| p.priority)).unwrap_or(0), *pos));

        let mut runs: Vec<(&ProfileRef, ExecutionResult)> = Vec::with_capacity(ordered.len());
        let mut missing: Vec<&str> = Vec::new();
        let mut skipped: Vec<&str> = Vec::new();
        let mut blocks = 0usize;

        for (_, profile_ref, profile) in &ordered {
            let total = ordered.len() - missing.len();
            if attachment.short_circuit && attachment.aggregation.is_decided(blocks, runs.len() - blocks, total) {
                skipped.push(&profile_ref.id);
                continue;
            }
            let Some(profile) = profile else {
                warn!(profile_id = %profile_ref.id, "attached profile not found");
                missing.push(&profile_ref.id);
                continue;
            };
            let overlay = source.overlay(profile, ctx);
            let result = self.executor.execute_with(profile, &overlay, ctx);
            if result.is_block() {
                blocks += 1;
            }
            runs.push((*profile_ref, result));
        }

        let mut combined = if runs.is_empty() {
            warn!(missing = missing.len(), "no attached profile could be evaluated");
            ExecutionResult::new(self.config.default_action)
        } else {
            self.combine(attachment, &runs, blocks)
        };

        combined.nodes_executed = runs.iter().map(|(_, r)| r.nodes_executed).sum();
        combined.details.insert(
            "profiles".to_string(),
            json!(runs
                .iter()
                .map(|(r, res)| json!({
                    "id": r.id,
                    "action": res.action,
                    "score": res.score,
                    "weight": r.weight,
                    "flags": res.flags,
                    "nodes_executed": res.nodes_executed,
                    "details": res.details,
                }))
                .collect::<Vec<_>>()),
        );
        combined
            .details
            .insert("aggregation".to_string(), json!(attachment.aggregation.as_str()));
        combined
            .details
            .insert("score_aggregation".to_string(), json!(attachment.score_aggregation.as_str()));
        if !skipped.is_empty() {
            combined.details.insert("skipped_profiles".to_string(), json!(skipped));
        }
        if !missing.is_empty() {
            combined.details.insert("missing_profiles".to_string(), json!(missing));
        }
        combined.execution_time_ms = watch.elapsed_ms();

        debug!(
            action = %combined.action,
            score = combined.score,
            evaluated = runs.len(),
            skipped = skipped.len(),
            "profiles combined"
        );
        combined
    }

    fn combine(
        &self,
        attachment: &DefenseProfileAttachment,
        runs: &[(&ProfileRef, ExecutionResult)],
        blocks: usize,
    ) -> ExecutionResult {
        let scores: Vec<(f64, f64)> = runs.iter().map(|(r, res)| (res.score, r.weight)).collect();
        let score = attachment.score_aggregation.combine(&scores);

        let mut combined = if attachment.aggregation.is_block(blocks, runs.len()) {
            let mut result = ExecutionResult::new(FinalAction::Block);
            if let Some((_, first)) = runs.iter().find(|(_, res)| res.is_block()) {
                result.http_status = first.http_status;
                result.block_reason = first.block_reason.clone();
            }
            result
        } else {
            // Runs are in priority order, so the first non-allow proposal wins.
            match runs
                .iter()
                .find(|(_, res)| !res.is_block() && res.action != FinalAction::Allow)
            {
                Some((_, winner)) => {
                    let mut result = ExecutionResult::new(winner.action);
                    result.http_status = winner.http_status;
                    result.tarpit_delay = winner.tarpit_delay;
                    result.block_reason = winner.block_reason.clone();
                    result
                }
                None => {
                    let reason = runs
                        .iter()
                        .find_map(|(_, res)| res.allow_reason.clone())
                        .unwrap_or_else(|| "no profile reached a blocking decision".to_string());
                    ExecutionResult::allow(reason)
                }
            }
        };

        combined.score = score;
        for (_, res) in runs {
            for flag in &res.flags {
                combined.push_flag(flag);
            }
        }
        combined
    }
}
