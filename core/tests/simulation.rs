mod common;

use dpe_core::{simulate_snapshot, CapabilityRegistry, EngineConfig, EngineSnapshot, FinalAction, SimulationResponse, Simulator};
use std::sync::Arc;

const REQUEST: &str = r#"{
    "client_ip": "203.0.113.7",
    "host": "example.com",
    "path": "/contact",
    "method": "POST",
    "form_data": {"name": "Sam", "website": "http://spam.example"},
    "headers": {"User-Agent": "python-requests/2.31"}
}"#;

fn simulate(profile: &str, body: &str) -> SimulationResponse {
    let registry = CapabilityRegistry::with_builtins();
    let config = EngineConfig::default();
    Simulator::new(&registry, &config).simulate_json(profile, body)
}

#[test]
fn test_repeated_simulation_is_stable() {
    let first = simulate(common::HONEYPOT_PROFILE, REQUEST);
    let second = simulate(common::HONEYPOT_PROFILE, REQUEST);
    let (a, b) = (first.report().unwrap(), second.report().unwrap());
    assert_eq!(a.action, FinalAction::Block);
    assert_eq!(a.action, b.action);
    assert_eq!(a.score, b.score);
    assert_eq!(a.flags, b.flags);
}

#[test]
fn test_simulation_body_shape() {
    let json: serde_json::Value = serde_json::from_str(&simulate(common::HONEYPOT_PROFILE, REQUEST).to_json()).unwrap();
    let sim = &json["simulation"];
    assert_eq!(sim["action"], "block");
    assert_eq!(sim["nodes_executed"], 2);
    assert!(sim["execution_time_ms"].is_number());
    assert!(sim["block_reason"].is_string());
    assert!(sim.get("allow_reason").is_none());
    assert_eq!(sim["flags"], serde_json::json!(["honeypot_filled"]));
}

#[test]
fn test_malformed_graph_returns_every_error() {
    let broken = r#"{
        "id": "broken",
        "nodes": [
            {"id": "s1", "type": "start"},
            {"id": "s2", "type": "start"},
            {"id": "t", "type": "operator", "subtype": "threshold_branch", "config": {"ranges": []}},
            {"id": "a", "type": "action", "subtype": "allow"}
        ],
        "edges": [
            {"from": "s1", "handle": "next", "to": "a"},
            {"from": "s2", "handle": "next", "to": "ghost"}
        ]
    }"#;
    match simulate(broken, REQUEST) {
        SimulationResponse::Errors { errors } => {
            assert!(errors.len() >= 3, "{:?}", errors);
            assert!(errors.iter().any(|e| e.contains("ghost")));
            assert!(errors.iter().any(|e| e.contains("start nodes")));
        }
        other => panic!("expected errors, got {:?}", other),
    }
}

#[test]
fn test_malformed_json_is_an_error_body() {
    let response = simulate("{", REQUEST);
    let json: serde_json::Value = serde_json::from_str(&response.to_json()).unwrap();
    assert!(json["errors"].is_array());
}

#[test]
fn test_snapshot_simulation_by_id() {
    let bundle = format!(r#"{{"profiles": [{}]}}"#, common::HONEYPOT_PROFILE);
    let snapshot = EngineSnapshot::from_json("v1", &bundle, Arc::new(CapabilityRegistry::with_builtins())).unwrap();

    let found = simulate_snapshot(&snapshot, "honeypot", REQUEST);
    assert_eq!(found.report().unwrap().action, FinalAction::Block);

    let missing = simulate_snapshot(&snapshot, "nope", REQUEST);
    assert_eq!(missing, SimulationResponse::errors(vec!["unknown defense profile 'nope'".to_string()]));
}
