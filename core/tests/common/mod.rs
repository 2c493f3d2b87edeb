#![allow(dead_code)]

use dpe_core::{
    CapabilityRegistry, EngineConfig, ExecutionResult, InjectedVerdict, Profile, ProfileDefinition, ProfileExecutor,
    RequestContext, Verdict,
};

pub fn compile(json: &str) -> Profile {
    let def: ProfileDefinition = serde_json::from_str(json).expect("fixture parses");
    Profile::compile(&def).expect("fixture compiles")
}

pub fn run(profile: &Profile, ctx: &RequestContext) -> ExecutionResult {
    let registry = CapabilityRegistry::with_builtins();
    let config = EngineConfig::default();
    ProfileExecutor::new(&registry, &config).execute(profile, ctx)
}

/// Builtins plus an injected-verdict capability per extra subtype.
pub fn registry_with(subtypes: &[&str]) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::with_builtins();
    for subtype in subtypes {
        registry.register(subtype, InjectedVerdict::new(subtype));
    }
    registry
}

pub fn scored(score: f64) -> Verdict {
    Verdict::pass().with_score(score)
}

/// start -> honeypot(binary, action_on_fill=block) -> block(403) | allow
pub const HONEYPOT_PROFILE: &str = r#"{
    "id": "honeypot",
    "name": "Honeypot",
    "priority": 10,
    "nodes": [
        {"id": "start", "type": "start"},
        {"id": "hp", "type": "defense", "subtype": "honeypot",
         "config": {"fields": ["website"], "action_on_fill": "block", "output_mode": "binary"}},
        {"id": "block", "type": "action", "subtype": "block", "config": {"http_status": 403}},
        {"id": "allow", "type": "action", "subtype": "allow"}
    ],
    "edges": [
        {"from": "start", "handle": "next", "to": "hp"},
        {"from": "hp", "handle": "blocked", "to": "block"},
        {"from": "hp", "handle": "continue", "to": "allow"}
    ]
}"#;

/// start -> ip_reputation(score) -> threshold_branch(default ranges) -> one action per range
pub const THRESHOLD_PROFILE: &str = r#"{
    "id": "threshold",
    "priority": 20,
    "nodes": [
        {"id": "start", "type": "start"},
        {"id": "rep", "type": "defense", "subtype": "ip_reputation", "config": {"output_mode": "score"}},
        {"id": "branch", "type": "operator", "subtype": "threshold_branch"},
        {"id": "low", "type": "action", "subtype": "allow"},
        {"id": "medium", "type": "action", "subtype": "flag", "config": {"flag_label": "medium_risk"}},
        {"id": "high", "type": "action", "subtype": "captcha"},
        {"id": "critical", "type": "action", "subtype": "block"}
    ],
    "edges": [
        {"from": "start", "handle": "next", "to": "rep"},
        {"from": "rep", "handle": "continue", "to": "branch"},
        {"from": "branch", "handle": "low", "to": "low"},
        {"from": "branch", "handle": "medium", "to": "medium"},
        {"from": "branch", "handle": "high", "to": "high"},
        {"from": "branch", "handle": "critical", "to": "critical"}
    ]
}"#;

/// start -> ip_allowlist(skip_all) -> allowed: block trap | continue: honeypot -> keyword_filter -> block | allow
pub const ALLOWLIST_PROFILE: &str = r#"{
    "id": "allowlist",
    "nodes": [
        {"id": "start", "type": "start"},
        {"id": "al", "type": "defense", "subtype": "ip_allowlist",
         "config": {"ips": ["198.51.100.0/24"], "allow_action": "skip_all"}},
        {"id": "hp", "type": "defense", "subtype": "honeypot", "config": {"fields": ["website"]}},
        {"id": "kw", "type": "defense", "subtype": "keyword_filter", "config": {"keywords": ["casino"]}},
        {"id": "listed_trap", "type": "action", "subtype": "block"},
        {"id": "block", "type": "action", "subtype": "block"},
        {"id": "allow", "type": "action", "subtype": "allow"}
    ],
    "edges": [
        {"from": "start", "handle": "next", "to": "al"},
        {"from": "al", "handle": "allowed", "to": "listed_trap"},
        {"from": "al", "handle": "continue", "to": "hp"},
        {"from": "hp", "handle": "blocked", "to": "block"},
        {"from": "hp", "handle": "continue", "to": "kw"},
        {"from": "kw", "handle": "blocked", "to": "block"},
        {"from": "kw", "handle": "continue", "to": "allow"}
    ]
}"#;

/// start -> `subtype`(score) -> `action`
pub fn signal_profile(id: &str, priority: i64, subtype: &str, action: &str) -> String {
    format!(
        r#"{{
            "id": "{id}",
            "priority": {priority},
            "nodes": [
                {{"id": "start", "type": "start"}},
                {{"id": "sig", "type": "defense", "subtype": "{subtype}", "config": {{"output_mode": "score"}}}},
                {{"id": "end", "type": "action", "subtype": "{action}"}}
            ],
            "edges": [
                {{"from": "start", "handle": "next", "to": "sig"}},
                {{"from": "sig", "handle": "continue", "to": "end"}}
            ]
        }}"#
    )
}
