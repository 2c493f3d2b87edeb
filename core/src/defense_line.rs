//! Attack signatures and the defense line resolver.
//!
//! A defense line pairs one profile with a prioritized list of attack
//! signatures. Before a profile runs, the resolver folds the signatures'
//! pattern lists into the configs of the defense nodes that consume them and
//! hands the executor a [`ConfigOverlay`]. The profile itself is never mutated.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CapabilityError, ConfigError};
use crate::graph::{NodeIndex, Profile};
use crate::nodes::NodeKind;
use crate::registry::{CapabilityRegistry, NodeConfig};
use crate::value::{config_strings, ConfigMap, RequestContext};

/// Pattern lists keyed by config key (`keywords`, `patterns`, `ips`, ...).
pub type PatternSet = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSignature {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Defense subtype to pattern lists.
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureItem {
    pub signature_id: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    #[default]
    Union,
    FirstMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackSignatureAttachment {
    #[serde(default)]
    pub items: Vec<SignatureItem>,
    #[serde(default)]
    pub merge_mode: MergeMode,
}

/// Endpoint-level pairing of a profile with signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseLine {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub profile_id: String,
    /// Shorthand for enabled items prioritized by position.
    #[serde(default)]
    pub signature_ids: Vec<String>,
    #[serde(default)]
    pub items: Vec<SignatureItem>,
    #[serde(default)]
    pub merge_mode: MergeMode,
}

fn enabled_by_default() -> bool {
    true
}

impl DefenseLine {
    /// Normalized attachment: explicit items followed by `signature_ids`.
    pub fn attachment(&self) -> AttackSignatureAttachment {
        let offset = self.items.len() as i64;
        let mut items = self.items.clone();
        items.extend(self.signature_ids.iter().enumerate().map(|(i, id)| SignatureItem {
            signature_id: id.clone(),
            priority: offset + i as i64,
            enabled: true,
        }));
        AttackSignatureAttachment {
            items,
            merge_mode: self.merge_mode,
        }
    }
}

/// Per-request replacement configs for defense nodes, by node index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverlay {
    configs: HashMap<NodeIndex, Arc<NodeConfig>>,
}

impl ConfigOverlay {
    pub fn get(&self, index: NodeIndex) -> Option<&NodeConfig> {
        self.configs.get(&index).map(|c| c.as_ref())
    }

    pub fn insert(&mut self, index: NodeIndex, config: ConfigMap) {
        self.configs.insert(index, Arc::new(NodeConfig::new(config)));
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    fn entries(&self) -> impl Iterator<Item = (NodeIndex, &NodeConfig)> {
        self.configs.iter().map(|(index, config)| (*index, config.as_ref()))
    }
}

/// One defense node config holding only a signature's own patterns.
#[derive(Debug, Clone)]
struct Probe {
    node: String,
    subtype: String,
    config: Arc<NodeConfig>,
}

/// A `FIRST_MATCH` candidate: the probes that decide whether the signature
/// matches, and the overlay it supplies when it does.
#[derive(Debug, Clone)]
struct SignatureTrial {
    signature_id: String,
    probes: Vec<Probe>,
    overlay: ConfigOverlay,
}

/// A defense line resolved against one compiled profile.
///
/// Every config the line can hand out is built here, so requests only pick
/// between precompiled overlays.
#[derive(Debug, Clone)]
pub struct ResolvedDefenseLine {
    pub profile_id: String,
    pub merge_mode: MergeMode,
    /// Enabled signatures in ascending priority.
    signatures: Vec<Arc<AttackSignature>>,
    /// `UNION` result; empty under `FIRST_MATCH`, where it is the fallback.
    union_overlay: ConfigOverlay,
    /// `FIRST_MATCH` candidates in priority order.
    trials: Vec<SignatureTrial>,
}

impl ResolvedDefenseLine {
    pub fn resolve(
        endpoint: &str,
        line: &DefenseLine,
        profile: &Profile,
        catalog: &HashMap<String, Arc<AttackSignature>>,
        registry: &CapabilityRegistry,
    ) -> Result<Self, ConfigError> {
        let attachment = line.attachment();
        let mut items: Vec<(usize, &SignatureItem)> = attachment.items.iter().filter(|i| i.enabled).enumerate().collect();
        items.sort_by_key(|(pos, item)| (item.priority, *pos));

        let mut signatures = Vec::with_capacity(items.len());
        for (_, item) in items {
            let signature = catalog.get(&item.signature_id).ok_or_else(|| ConfigError::UnknownSignature {
                endpoint: endpoint.to_string(),
                signature: item.signature_id.clone(),
            })?;
            signatures.push(Arc::clone(signature));
        }

        let (union_overlay, trials) = match attachment.merge_mode {
            MergeMode::Union => (union_overlay(profile, &signatures), Vec::new()),
            MergeMode::FirstMatch => (
                ConfigOverlay::default(),
                signatures.iter().map(|s| signature_trial(profile, s, registry)).collect(),
            ),
        };

        prepare_overlay(profile, &union_overlay, registry)?;
        for trial in &trials {
            prepare_overlay(profile, &trial.overlay, registry)?;
            for probe in trial.probes.iter().filter(|p| registry.contains(&p.subtype)) {
                registry
                    .prepare(&probe.subtype, &probe.config)
                    .map_err(|e| invalid_config(profile, &probe.node, &probe.subtype, &e))?;
            }
        }

        Ok(Self {
            profile_id: profile.id.clone(),
            merge_mode: attachment.merge_mode,
            signatures,
            union_overlay,
            trials,
        })
    }

    pub fn signatures(&self) -> impl Iterator<Item = &AttackSignature> {
        self.signatures.iter().map(|s| s.as_ref())
    }

    /// Overlay to run the profile with for this request.
    ///
    /// Under `FIRST_MATCH` a signature matches when any of its probes reports
    /// a detection. No match leaves the static configs in place.
    pub fn overlay_for(&self, registry: &CapabilityRegistry, ctx: &RequestContext) -> Cow<'_, ConfigOverlay> {
        if self.merge_mode == MergeMode::Union {
            return Cow::Borrowed(&self.union_overlay);
        }
        for trial in &self.trials {
            if trial.probes.iter().any(|probe| self.probe_matches(trial, probe, registry, ctx)) {
                debug!(profile_id = %self.profile_id, signature = %trial.signature_id, "first matching signature selected");
                return Cow::Borrowed(&trial.overlay);
            }
        }
        Cow::Borrowed(&self.union_overlay)
    }

    fn probe_matches(
        &self,
        trial: &SignatureTrial,
        probe: &Probe,
        registry: &CapabilityRegistry,
        ctx: &RequestContext,
    ) -> bool {
        match registry.matches(&probe.subtype, &probe.config, ctx) {
            Ok(matched) => matched,
            Err(error) => {
                warn!(
                    profile_id = %self.profile_id,
                    node = %probe.node,
                    signature = %trial.signature_id,
                    error = %error,
                    "signature trial failed, treating as no match"
                );
                false
            }
        }
    }
}

fn union_overlay(profile: &Profile, signatures: &[Arc<AttackSignature>]) -> ConfigOverlay {
    let mut overlay = ConfigOverlay::default();
    for (index, _, settings) in profile.defense_nodes() {
        let contributions: Vec<&PatternSet> = signatures
            .iter()
            .filter_map(|s| s.patterns.get(&settings.subtype))
            .collect();
        if !contributions.is_empty() {
            overlay.insert(index, merge_patterns(settings.config.map(), contributions));
        }
    }
    overlay
}

fn signature_trial(profile: &Profile, signature: &Arc<AttackSignature>, registry: &CapabilityRegistry) -> SignatureTrial {
    let probes = profile
        .defense_nodes()
        .filter_map(|(_, node, settings)| {
            let patterns = signature.patterns.get(&settings.subtype)?;
            Some(Probe {
                node: node.id.clone(),
                subtype: settings.subtype.clone(),
                config: Arc::new(NodeConfig::new(probe_config(
                    settings.config.map(),
                    registry.pattern_keys(&settings.subtype),
                    patterns,
                ))),
            })
        })
        .collect();
    SignatureTrial {
        signature_id: signature.id.clone(),
        probes,
        overlay: union_overlay(profile, std::slice::from_ref(signature)),
    }
}

/// Static config stripped of its own patterns, carrying `patterns` instead.
fn probe_config(base: &ConfigMap, pattern_keys: &[&str], patterns: &PatternSet) -> ConfigMap {
    let mut config: ConfigMap = base
        .iter()
        .filter(|(key, _)| !pattern_keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, values) in patterns {
        config.insert(key.clone(), serde_json::json!(values));
    }
    config
}

fn prepare_overlay(profile: &Profile, overlay: &ConfigOverlay, registry: &CapabilityRegistry) -> Result<(), ConfigError> {
    for (index, config) in overlay.entries() {
        let node = profile.node(index);
        let NodeKind::Defense(settings) = &node.kind else {
            continue;
        };
        // unregistered subtypes are reported by the profile check
        if !registry.contains(&settings.subtype) {
            continue;
        }
        registry
            .prepare(&settings.subtype, config)
            .map_err(|e| invalid_config(profile, &node.id, &settings.subtype, &e))?;
    }
    Ok(())
}

fn invalid_config(profile: &Profile, node: &str, subtype: &str, error: &CapabilityError) -> ConfigError {
    ConfigError::InvalidCapabilityConfig {
        profile: profile.id.clone(),
        node: node.to_string(),
        subtype: subtype.to_string(),
        reason: error.to_string(),
    }
}

/// Static config with every contribution's lists appended, order kept, duplicates dropped.
fn merge_patterns(base: &ConfigMap, contributions: Vec<&PatternSet>) -> ConfigMap {
    let mut merged = base.clone();
    let mut lists: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for set in contributions {
        for (key, values) in set {
            let list = lists
                .entry(key.as_str())
                .or_insert_with(|| config_strings(base, key));
            for value in values {
                if !list.contains(value) {
                    list.push(value.clone());
                }
            }
        }
    }
    for (key, list) in lists {
        merged.insert(key.to_string(), serde_json::json!(list));
    }
    merged
}
