//! Engine-wide settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::FailPolicy;
use crate::result::FinalAction;

/// Upper bound on nodes visited by a single profile walk.
pub const DEFAULT_MAX_NODE_VISITS: usize = 10_000;

/// Engine settings carried in the configuration bundle under `engine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Walk ceiling. Profiles whose longest walk exceeds it are rejected at load.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,

    /// Action used when a walk halts on an unconnected handle or faults.
    #[serde(default)]
    pub default_action: FinalAction,

    /// Per-subtype behavior when a capability errors. Unlisted subtypes fail open.
    #[serde(default)]
    pub fail_policies: BTreeMap<String, FailPolicy>,

    /// When false, callers resolve tarpits immediately instead of sleeping.
    #[serde(default = "default_true")]
    pub tarpit_enabled: bool,
}

fn default_max_node_visits() -> usize {
    DEFAULT_MAX_NODE_VISITS
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
            default_action: FinalAction::Monitor,
            fail_policies: BTreeMap::new(),
            tarpit_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn fail_policy(&self, subtype: &str) -> FailPolicy {
        self.fail_policies.get(subtype).copied().unwrap_or_default()
    }
}
