//! Immutable engine snapshots and the store that swaps them.
//!
//! A snapshot is everything the hot path reads: compiled profiles, attack
//! signatures, endpoint attachments with their resolved defense lines, and the
//! capability registry. It is built and validated in full before it becomes
//! visible, and never changes afterwards. Reloads build a new snapshot and
//! swap the pointer; requests already holding the previous one finish on it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::defense_line::{AttackSignature, ConfigOverlay, DefenseLine, ResolvedDefenseLine};
use crate::error::{ConfigError, ConfigErrors};
use crate::graph::{Profile, ProfileDefinition};
use crate::orchestrator::{DefenseProfileAttachment, Orchestrator, ProfileSource};
use crate::interpreter::ProfileExecutor;
use crate::registry::CapabilityRegistry;
use crate::result::ExecutionResult;
use crate::value::RequestContext;

/// A protected endpoint and what runs on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    /// Matches any host when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "root_prefix")]
    pub path_prefix: String,
    #[serde(default)]
    pub defense_profiles: DefenseProfileAttachment,
    #[serde(default)]
    pub defense_lines: Vec<DefenseLine>,
}

fn root_prefix() -> String {
    "/".to_string()
}

impl EndpointConfig {
    fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = match &self.host {
            None => true,
            Some(h) => h.eq_ignore_ascii_case(host),
        };
        host_ok && path.starts_with(&self.path_prefix)
    }
}

/// Configuration bundle as synced to the edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineBundle {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileDefinition>,
    #[serde(default)]
    pub signatures: Vec<AttackSignature>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug)]
struct Endpoint {
    config: EndpointConfig,
    /// Enabled defense lines by profile id.
    lines: HashMap<String, ResolvedDefenseLine>,
}

/// A fully validated, read-only configuration version.
#[derive(Debug)]
pub struct EngineSnapshot {
    pub version: String,
    /// Hex SHA-256 of the source bundle. Empty for the placeholder snapshot.
    pub digest: String,
    pub config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    profiles: HashMap<String, Arc<Profile>>,
    signatures: HashMap<String, Arc<AttackSignature>>,
    endpoints: Vec<Endpoint>,
}

impl EngineSnapshot {
    /// Placeholder used before any configuration has loaded. Matches no endpoint.
    pub fn empty(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            version: String::new(),
            digest: String::new(),
            config: EngineConfig::default(),
            registry,
            profiles: HashMap::new(),
            signatures: HashMap::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.digest.is_empty()
    }

    /// Parse and build from bundle JSON. The digest covers the exact input bytes.
    pub fn from_json(version: &str, json: &str, registry: Arc<CapabilityRegistry>) -> Result<Self, ConfigErrors> {
        let bundle: EngineBundle = serde_json::from_str(json).map_err(ConfigError::from)?;
        let digest = hex::encode(Sha256::digest(json.as_bytes()));
        Self::build(version, digest, bundle, registry)
    }

    /// Validate every part of `bundle` and assemble a snapshot. All problems are reported.
    pub fn build(
        version: &str,
        digest: String,
        bundle: EngineBundle,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, ConfigErrors> {
        let mut errors = Vec::new();
        let engine = bundle.engine;

        let mut profiles: HashMap<String, Arc<Profile>> = HashMap::with_capacity(bundle.profiles.len());
        for definition in &bundle.profiles {
            if profiles.contains_key(&definition.id) {
                errors.push(ConfigError::DuplicateProfile(definition.id.clone()));
                continue;
            }
            let profile = match Profile::compile_with_limit(definition, engine.max_node_visits) {
                Ok(profile) => profile,
                Err(validation) => {
                    errors.push(ConfigError::InvalidProfile {
                        profile: definition.id.clone(),
                        errors: validation,
                    });
                    continue;
                }
            };
            errors.extend(check_capabilities(&profile, &registry));
            profiles.insert(profile.id.clone(), Arc::new(profile));
        }

        let signatures: HashMap<String, Arc<AttackSignature>> = bundle
            .signatures
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(s)))
            .collect();

        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(bundle.endpoints.len());
        for config in bundle.endpoints {
            if endpoints.iter().any(|e| e.config.id == config.id) {
                errors.push(ConfigError::DuplicateEndpoint(config.id.clone()));
                continue;
            }
            for profile_ref in &config.defense_profiles.profiles {
                if !profiles.contains_key(&profile_ref.id) && !is_rejected(&bundle.profiles, &profile_ref.id) {
                    errors.push(ConfigError::UnknownProfile {
                        endpoint: config.id.clone(),
                        profile: profile_ref.id.clone(),
                    });
                }
                if !profile_ref.weight.is_finite() || profile_ref.weight < 0.0 {
                    errors.push(ConfigError::InvalidWeight {
                        endpoint: config.id.clone(),
                        profile: profile_ref.id.clone(),
                    });
                }
            }

            let mut lines = HashMap::new();
            for line in config.defense_lines.iter().filter(|l| l.enabled) {
                let Some(profile) = profiles.get(&line.profile_id) else {
                    if !is_rejected(&bundle.profiles, &line.profile_id) {
                        errors.push(ConfigError::UnknownProfile {
                            endpoint: config.id.clone(),
                            profile: line.profile_id.clone(),
                        });
                    }
                    continue;
                };
                if lines.contains_key(&line.profile_id) {
                    errors.push(ConfigError::DuplicateDefenseLine {
                        endpoint: config.id.clone(),
                        profile: line.profile_id.clone(),
                    });
                    continue;
                }
                match ResolvedDefenseLine::resolve(&config.id, line, profile, &signatures, &registry) {
                    Ok(resolved) => {
                        lines.insert(line.profile_id.clone(), resolved);
                    }
                    Err(e) => errors.push(e),
                }
            }
            endpoints.push(Endpoint { config, lines });
        }

        if !errors.is_empty() {
            return Err(ConfigErrors(errors));
        }

        Ok(Self {
            version: version.to_string(),
            digest,
            config: engine,
            registry,
            profiles,
            signatures,
            endpoints,
        })
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id).map(|p| p.as_ref())
    }

    pub fn profile_ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Endpoint ids in declaration order.
    pub fn endpoint_ids(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| e.config.id.as_str())
    }

    pub fn signature(&self, id: &str) -> Option<&AttackSignature> {
        self.signatures.get(id).map(|s| s.as_ref())
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Endpoint serving `host` + `path`: host must match (or be unset), longest
    /// path prefix wins, earlier declarations win ties.
    pub fn endpoint_for(&self, host: &str, path: &str) -> Option<&EndpointConfig> {
        self.find_endpoint(host, path).map(|e| &e.config)
    }

    fn find_endpoint(&self, host: &str, path: &str) -> Option<&Endpoint> {
        let mut best: Option<&Endpoint> = None;
        for endpoint in &self.endpoints {
            if !endpoint.config.matches(host, path) {
                continue;
            }
            let longer = best.map_or(true, |b| endpoint.config.path_prefix.len() > b.config.path_prefix.len());
            if longer {
                best = Some(endpoint);
            }
        }
        best
    }

    /// Evaluate a request against the endpoint it targets.
    pub fn evaluate(&self, ctx: &RequestContext) -> ExecutionResult {
        let Some(endpoint) = self.find_endpoint(&ctx.host, &ctx.path) else {
            let mut result = ExecutionResult::allow("no endpoint matched");
            result.details.insert("snapshot_version".to_string(), json!(self.version));
            return result;
        };
        let view = EndpointView { snapshot: self, endpoint };
        let mut result = Orchestrator::new(&self.registry, &self.config).run(
            &endpoint.config.defense_profiles,
            &view,
            ctx,
        );
        result.details.insert("endpoint".to_string(), json!(endpoint.config.id));
        result.details.insert("snapshot_version".to_string(), json!(self.version));
        result
    }

    /// Run one profile on its own, with static node configs.
    pub fn evaluate_profile(&self, profile_id: &str, ctx: &RequestContext) -> Option<ExecutionResult> {
        let profile = self.profile(profile_id)?;
        Some(ProfileExecutor::new(&self.registry, &self.config).execute(profile, ctx))
    }
}

fn is_rejected(definitions: &[ProfileDefinition], id: &str) -> bool {
    definitions.iter().any(|d| d.id == id)
}

/// Every defense node must name a registered capability whose config it accepts.
pub(crate) fn check_capabilities(profile: &Profile, registry: &CapabilityRegistry) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    for (_, node, settings) in profile.defense_nodes() {
        if !registry.contains(&settings.subtype) {
            errors.push(ConfigError::UnknownSubtype {
                profile: profile.id.clone(),
                node: node.id.clone(),
                subtype: settings.subtype.clone(),
            });
            continue;
        }
        // compiles the static config for the snapshot's lifetime
        if let Err(e) = registry.prepare(&settings.subtype, &settings.config) {
            errors.push(ConfigError::InvalidCapabilityConfig {
                profile: profile.id.clone(),
                node: node.id.clone(),
                subtype: settings.subtype.clone(),
                reason: e.to_string(),
            });
        }
    }
    errors
}

struct EndpointView<'s> {
    snapshot: &'s EngineSnapshot,
    endpoint: &'s Endpoint,
}

impl ProfileSource for EndpointView<'_> {
    fn profile(&self, id: &str) -> Option<&Profile> {
        self.snapshot.profile(id)
    }

    fn overlay(&self, profile: &Profile, ctx: &RequestContext) -> Cow<'_, ConfigOverlay> {
        match self.endpoint.lines.get(&profile.id) {
            Some(line) => line.overlay_for(&self.snapshot.registry, ctx),
            None => Cow::Owned(ConfigOverlay::default()),
        }
    }
}

/// Holder of the current snapshot.
///
/// Readers clone the `Arc` under a short read lock and evaluate without
/// holding it. A reload that fails validation leaves the current snapshot in
/// place.
#[derive(Debug)]
pub struct SnapshotStore {
    current: RwLock<Arc<EngineSnapshot>>,
}

impl SnapshotStore {
    pub fn new(snapshot: EngineSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<EngineSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install `snapshot`, returning the one it replaced.
    pub fn swap(&self, snapshot: EngineSnapshot) -> Arc<EngineSnapshot> {
        let next = Arc::new(snapshot);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Build from bundle JSON and swap it in. On failure the last good snapshot keeps serving.
    pub fn reload(&self, version: &str, json: &str) -> Result<Arc<EngineSnapshot>, ConfigErrors> {
        let registry = Arc::clone(&self.current().registry);
        match EngineSnapshot::from_json(version, json, registry) {
            Ok(snapshot) => {
                info!(version, digest = %snapshot.digest, profiles = snapshot.profiles.len(), "configuration loaded");
                self.swap(snapshot);
                Ok(self.current())
            }
            Err(errors) => {
                let serving = self.current();
                if serving.is_placeholder() {
                    error!(version, errors = %errors, "configuration rejected and no previous version to serve");
                } else {
                    warn!(
                        version,
                        serving = %serving.version,
                        errors = %errors,
                        "configuration rejected, keeping last good version"
                    );
                }
                Err(errors)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::FinalAction;

    const BUNDLE: &str = r#"{
        "engine": {"default_action": "monitor"},
        "profiles": [
            {
                "id": "honeypot",
                "priority": 10,
                "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "hp", "type": "defense", "subtype": "honeypot", "config": {"fields": ["website"]}},
                    {"id": "block", "type": "action", "subtype": "block"},
                    {"id": "allow", "type": "action", "subtype": "allow"}
                ],
                "edges": [
                    {"from": "start", "handle": "next", "to": "hp"},
                    {"from": "hp", "handle": "blocked", "to": "block"},
                    {"from": "hp", "handle": "continue", "to": "allow"}
                ]
            }
        ],
        "endpoints": [
            {"id": "site", "defense_profiles": {"profiles": [{"id": "honeypot"}]}},
            {"id": "contact", "host": "example.com", "path_prefix": "/contact",
             "defense_profiles": {"profiles": [{"id": "honeypot"}]}}
        ]
    }"#;

    fn registry() -> Arc<CapabilityRegistry> {
        Arc::new(CapabilityRegistry::with_builtins())
    }

    fn request(host: &str, path: &str) -> RequestContext {
        RequestContext {
            host: host.to_string(),
            path: path.to_string(),
            ..RequestContext::new()
        }
    }

    #[test]
    fn test_builds_and_digests_bundle() {
        let snapshot = EngineSnapshot::from_json("v1", BUNDLE, registry()).unwrap();
        assert_eq!(snapshot.version, "v1");
        assert_eq!(snapshot.digest.len(), 64);
        assert!(!snapshot.is_placeholder());
        assert!(snapshot.profile("honeypot").is_some());
    }

    #[test]
    fn test_longest_prefix_endpoint_wins() {
        let snapshot = EngineSnapshot::from_json("v1", BUNDLE, registry()).unwrap();
        assert_eq!(snapshot.endpoint_for("example.com", "/contact/send").unwrap().id, "contact");
        assert_eq!(snapshot.endpoint_for("EXAMPLE.com", "/contact").unwrap().id, "contact");
        assert_eq!(snapshot.endpoint_for("other.org", "/contact").unwrap().id, "site");
        assert_eq!(snapshot.endpoint_for("example.com", "/about").unwrap().id, "site");
    }

    #[test]
    fn test_evaluate_routes_to_endpoint() {
        let snapshot = EngineSnapshot::from_json("v1", BUNDLE, registry()).unwrap();
        let ctx = request("example.com", "/contact").with_form_field("website", "spam.example");
        let result = snapshot.evaluate(&ctx);
        assert_eq!(result.action, FinalAction::Block);
        assert_eq!(result.details["endpoint"], "contact");
        assert_eq!(result.details["snapshot_version"], "v1");
    }

    #[test]
    fn test_placeholder_matches_nothing() {
        let snapshot = EngineSnapshot::empty(registry());
        let result = snapshot.evaluate(&request("example.com", "/"));
        assert_eq!(result.action, FinalAction::Allow);
        assert_eq!(result.allow_reason.as_deref(), Some("no endpoint matched"));
    }

    #[test]
    fn test_rejects_bad_references_all_at_once() {
        let json = r#"{
            "profiles": [
                {"id": "geo", "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "g", "type": "defense", "subtype": "geoip"},
                    {"id": "allow", "type": "action", "subtype": "allow"}
                ], "edges": [
                    {"from": "start", "handle": "next", "to": "g"},
                    {"from": "g", "handle": "continue", "to": "allow"}
                ]}
            ],
            "endpoints": [
                {"id": "a", "defense_profiles": {"profiles": [{"id": "missing", "weight": -1}]},
                 "defense_lines": [{"profile_id": "geo", "signature_ids": ["nope"]}]},
                {"id": "a"}
            ]
        }"#;
        let errors = EngineSnapshot::from_json("v2", json, registry()).unwrap_err().0;
        assert!(errors.iter().any(|e| matches!(e, ConfigError::UnknownSubtype { subtype, .. } if subtype == "geoip")));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::UnknownProfile { profile, .. } if profile == "missing")));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::InvalidWeight { .. })));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::UnknownSignature { .. })));
        assert!(errors.contains(&ConfigError::DuplicateEndpoint("a".to_string())));
    }

    #[test]
    fn test_rejects_invalid_capability_config() {
        let json = BUNDLE.replace(r#""fields": ["website"]"#, r#""action_on_fill": "explode""#);
        let errors = EngineSnapshot::from_json("v3", &json, registry()).unwrap_err().0;
        assert!(matches!(errors[0], ConfigError::InvalidCapabilityConfig { .. }));
    }

    #[test]
    fn test_reload_keeps_last_good_snapshot() {
        let store = SnapshotStore::new(EngineSnapshot::empty(registry()));
        assert!(store.current().is_placeholder());

        store.reload("v1", BUNDLE).unwrap();
        let before = store.current();
        assert_eq!(before.version, "v1");

        assert!(store.reload("v2", "{not json").is_err());
        assert_eq!(store.current().version, "v1");
        assert!(Arc::ptr_eq(&before, &store.current()));
    }

    #[test]
    fn test_evaluate_single_profile() {
        let snapshot = EngineSnapshot::from_json("v1", BUNDLE, registry()).unwrap();
        let ctx = RequestContext::new().with_form_field("website", "spam");
        let result = snapshot.evaluate_profile("honeypot", &ctx).unwrap();
        assert_eq!(result.action, FinalAction::Block);
        assert!(result.details.get("endpoint").is_none());
        assert!(snapshot.evaluate_profile("nope", &ctx).is_none());
    }

    #[test]
    fn test_in_flight_snapshot_survives_swap() {
        let store = SnapshotStore::new(EngineSnapshot::from_json("v1", BUNDLE, registry()).unwrap());
        let held = store.current();
        let old = store.swap(EngineSnapshot::empty(registry()));
        assert_eq!(old.version, "v1");
        assert_eq!(held.version, "v1");
        assert!(held.profile("honeypot").is_some());
        assert!(store.current().is_placeholder());
    }
}
