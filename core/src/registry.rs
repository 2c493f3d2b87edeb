//! Defense capability registry.
//!
//! The engine never implements detection logic itself. Each defense subtype
//! maps to a [`DefenseCapability`] looked up by name at snapshot build.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use crate::capabilities::{Honeypot, InjectedVerdict, IpList, KeywordFilter};
use crate::error::CapabilityError;
use crate::value::{ConfigMap, RequestContext, Verdict};

/// A capability's compiled form of one node config (regexes, parsed CIDRs).
pub type Prepared = Arc<dyn Any + Send + Sync>;

/// A pluggable defense check.
///
/// Implementations must be non-blocking in-process lookups. Anything needing
/// network I/O resolves before the walk and is read from
/// [`RequestContext::signals`].
pub trait DefenseCapability: Send + Sync {
    fn evaluate(&self, config: &ConfigMap, ctx: &RequestContext) -> Result<Verdict, CapabilityError>;

    /// Compile `config` once so requests skip the parsing. `None` means the
    /// capability reads the raw map on every call.
    fn prepare(&self, _config: &ConfigMap) -> Result<Option<Prepared>, CapabilityError> {
        Ok(None)
    }

    /// Evaluate with the output of [`prepare`](Self::prepare).
    fn evaluate_prepared(
        &self,
        config: &ConfigMap,
        _prepared: &Prepared,
        ctx: &RequestContext,
    ) -> Result<Verdict, CapabilityError> {
        self.evaluate(config, ctx)
    }

    /// Config keys that carry match patterns. Signature trials drop these
    /// from the static config so only the signature's own patterns are tested.
    fn pattern_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reject malformed configs at load time.
    fn validate_config(&self, config: &ConfigMap) -> Result<(), CapabilityError> {
        self.prepare(config).map(|_| ())
    }
}

/// A defense node config together with its compiled form.
///
/// The compiled form is built on first use and kept for the lifetime of the
/// config, which for static node configs and precomputed overlays is the
/// lifetime of the snapshot.
#[derive(Default)]
pub struct NodeConfig {
    map: ConfigMap,
    prepared: OnceLock<Result<Option<Prepared>, CapabilityError>>,
}

impl NodeConfig {
    pub fn new(map: ConfigMap) -> Self {
        Self {
            map,
            prepared: OnceLock::new(),
        }
    }

    pub fn map(&self) -> &ConfigMap {
        &self.map
    }

    fn prepared(&self, capability: &dyn DefenseCapability) -> Result<Option<&Prepared>, CapabilityError> {
        match self.prepared.get_or_init(|| capability.prepare(&self.map)) {
            Ok(prepared) => Ok(prepared.as_ref()),
            Err(e) => Err(e.clone()),
        }
    }
}

impl From<ConfigMap> for NodeConfig {
    fn from(map: ConfigMap) -> Self {
        Self::new(map)
    }
}

impl Deref for NodeConfig {
    type Target = ConfigMap;

    fn deref(&self) -> &ConfigMap {
        &self.map
    }
}

impl PartialEq for NodeConfig {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("map", &self.map)
            .field("prepared", &self.prepared.get().map(|p| p.is_ok()))
            .finish()
    }
}

/// What a capability error turns into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// `blocked = false, score = 0`
    #[default]
    Open,
    /// `blocked = true, score = 0`
    Closed,
}

impl FailPolicy {
    pub fn fallback_verdict(&self, error: &CapabilityError) -> Verdict {
        let verdict = match self {
            FailPolicy::Open => Verdict::pass(),
            FailPolicy::Closed => Verdict::blocked(format!("capability error (fail-closed): {}", error)),
        };
        verdict.with_detail("capability_error", error.to_string())
    }
}

/// Subtype name to capability map.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Arc<dyn DefenseCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the reference capabilities shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("honeypot", Honeypot);
        let ip_list: Arc<dyn DefenseCapability> = Arc::new(IpList);
        registry.register_shared("ip_allowlist", Arc::clone(&ip_list));
        registry.register_shared("ip_blocklist", ip_list);
        registry.register("keyword_filter", KeywordFilter);
        registry.register("ip_reputation", InjectedVerdict::new("ip_reputation"));
        registry.register("behavioral", InjectedVerdict::new("behavioral"));
        registry
    }

    pub fn register(&mut self, subtype: &str, capability: impl DefenseCapability + 'static) {
        self.entries.insert(subtype.to_string(), Arc::new(capability));
    }

    pub fn register_shared(&mut self, subtype: &str, capability: Arc<dyn DefenseCapability>) {
        self.entries.insert(subtype.to_string(), capability);
    }

    pub fn get(&self, subtype: &str) -> Option<&Arc<dyn DefenseCapability>> {
        self.entries.get(subtype)
    }

    pub fn contains(&self, subtype: &str) -> bool {
        self.entries.contains_key(subtype)
    }

    pub fn subtypes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Call a capability. Errors (including an unregistered subtype) are
    /// returned alongside so the caller can apply the fail policy and log.
    pub fn invoke(&self, subtype: &str, config: &NodeConfig, ctx: &RequestContext) -> Result<Verdict, CapabilityError> {
        let capability = self.capability(subtype)?;
        match config.prepared(capability.as_ref())? {
            Some(prepared) => capability.evaluate_prepared(config.map(), prepared, ctx),
            None => capability.evaluate(config.map(), ctx),
        }
    }

    /// Whether `config` produces any detection (blocked or a positive score).
    pub fn matches(&self, subtype: &str, config: &NodeConfig, ctx: &RequestContext) -> Result<bool, CapabilityError> {
        self.invoke(subtype, config, ctx).map(|v| v.blocked || v.score > 0.0)
    }

    /// Pattern-carrying config keys of `subtype`, empty when unregistered.
    pub fn pattern_keys(&self, subtype: &str) -> &'static [&'static str] {
        match self.entries.get(subtype) {
            Some(capability) => capability.pattern_keys(),
            None => &[],
        }
    }

    /// Validate and compile `config` ahead of the first request.
    pub fn prepare(&self, subtype: &str, config: &NodeConfig) -> Result<(), CapabilityError> {
        let capability = self.capability(subtype)?;
        capability.validate_config(config.map())?;
        config.prepared(capability.as_ref()).map(|_| ())
    }

    fn capability(&self, subtype: &str) -> Result<&Arc<dyn DefenseCapability>, CapabilityError> {
        self.entries
            .get(subtype)
            .ok_or_else(|| CapabilityError::Unavailable(format!("no capability registered for '{}'", subtype)))
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("subtypes", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
