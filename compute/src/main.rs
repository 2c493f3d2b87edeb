//! Defense Profile Engine - edge enforcement for Fastly Compute.
//!
//! Every request is matched to an endpoint, run through the defense
//! profiles attached to it, and then blocked, challenged, tarpitted or
//! forwarded to the origin. Profiles are designed in the editor and deployed
//! as one packed bundle in the Config Store.

use dpe_compute::rules::{
    context_from_request, enforcement_response, forward, json_response, load_payload, preflight, refresh,
    Route, WafLog, CONFIG_STORE, LOG_ENDPOINT,
};
use dpe_core::{simulate_snapshot, CapabilityRegistry, EngineSnapshot, ExecutionResult, SnapshotStore};
use fastly::http::StatusCode;
use fastly::log::Endpoint;
use fastly::{ConfigStore, Error, Request, Response};
use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Engine version - update this on each release
const VERSION: &str = env!("CARGO_PKG_VERSION");
const ENGINE_NAME: &str = "Defense Profile Engine";

const FAILOPEN_CONFIG: &str = "failopen:config_load_error";
const FAILOPEN_BACKEND: &str = "failopen:backend_error";

static SNAPSHOTS: OnceLock<SnapshotStore> = OnceLock::new();

/// Main request handler.
///
/// Process flow:
/// 1. Route system endpoints (version, health, simulation)
/// 2. Bring the snapshot up to the deployed version
/// 3. Evaluate the request against its endpoint's profiles
/// 4. Enforce or forward
/// 5. Write the audit line
#[fastly::main]
fn main(mut req: Request) -> Result<Response, Error> {
    init_tracing();

    match Route::parse(req.get_method_str(), req.get_path()) {
        Route::Preflight => Ok(preflight(Route::allowed_methods(req.get_path()))),
        Route::Version | Route::Health => Ok(version_response(&current_snapshot())),
        Route::Simulate { profile_id } => {
            let body = req.take_body_str();
            let response = simulate_snapshot(&current_snapshot(), &profile_id, &body);
            let status = if response.is_ok() { StatusCode::OK } else { StatusCode::BAD_REQUEST };
            Ok(json_response(status, response.to_json()))
        }
        Route::Protected => protect(req),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init in the same instance is a no-op
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn snapshot_store() -> &'static SnapshotStore {
    SNAPSHOTS.get_or_init(|| SnapshotStore::new(EngineSnapshot::empty(Arc::new(CapabilityRegistry::with_builtins()))))
}

/// Snapshot for this request, reloading when a newer version is deployed.
///
/// Any load failure keeps whatever is already serving.
fn current_snapshot() -> Arc<EngineSnapshot> {
    let store = snapshot_store();
    let service_id = std::env::var("FASTLY_SERVICE_ID").unwrap_or_default();

    let config = match ConfigStore::try_open(CONFIG_STORE) {
        Ok(config) => config,
        Err(e) => {
            warn!(store = CONFIG_STORE, error = ?e, "config store unavailable");
            return store.current();
        }
    };

    match load_payload(&config, &service_id).and_then(|payload| refresh(store, &payload)) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(service_id = %service_id, error = %e, "defense profiles not loaded");
            store.current()
        }
    }
}

fn version_response(snapshot: &EngineSnapshot) -> Response {
    let (status, body) = if snapshot.is_placeholder() {
        (StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({
            "engine": ENGINE_NAME,
            "version": VERSION,
            "status": "no_configuration",
        }))
    } else {
        (StatusCode::OK, serde_json::json!({
            "engine": ENGINE_NAME,
            "version": VERSION,
            "status": "ok",
            "snapshot_version": snapshot.version,
            "rules_hash": &snapshot.digest[..snapshot.digest.len().min(16)],
            "profiles_count": snapshot.profile_ids().count(),
            "endpoints_count": snapshot.endpoint_ids().count(),
        }))
    };
    json_response(status, body.to_string())
}

fn protect(mut req: Request) -> Result<Response, Error> {
    let start_time = Instant::now();
    let mut logger = Endpoint::from_name(LOG_ENDPOINT);

    let ctx = context_from_request(&mut req);
    let mut log_entry = WafLog::new(&ctx);
    let snapshot = current_snapshot();

    if snapshot.is_placeholder() {
        warn!("no defense profiles loaded, failing open");
        log_entry.set_final_action(FAILOPEN_CONFIG);
        return forward_fail_open(req, &mut logger, log_entry, start_time);
    }

    let result = snapshot.evaluate(&ctx);
    info!(
        action = %result.action,
        score = result.score,
        nodes = result.nodes_executed,
        path = %ctx.path,
        "request evaluated"
    );
    log_entry.record(&result, &snapshot.version);

    let response = match enforcement_response(&result, snapshot.config.tarpit_enabled) {
        Some(response) => response,
        None => match forward(req, &result) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "origin unreachable");
                log_entry.set_final_action(FAILOPEN_BACKEND);
                backend_error_response(FAILOPEN_BACKEND)
            }
        },
    };

    finish(&mut logger, log_entry, response, start_time)
}

fn forward_fail_open(
    req: Request,
    logger: &mut Endpoint,
    log_entry: WafLog,
    start_time: Instant,
) -> Result<Response, Error> {
    let mut passthrough = ExecutionResult::allow(FAILOPEN_CONFIG);
    passthrough.flags.push(FAILOPEN_CONFIG.to_string());
    let response = match forward(req, &passthrough) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "origin unreachable");
            backend_error_response(FAILOPEN_CONFIG)
        }
    };
    finish(logger, log_entry, response, start_time)
}

fn backend_error_response(reason: &str) -> Response {
    let body = serde_json::json!({
        "error": "backend_unavailable",
        "reason": reason,
        "engine": ENGINE_NAME,
    });
    let mut response = Response::from_status(StatusCode::SERVICE_UNAVAILABLE)
        .with_content_type(fastly::mime::APPLICATION_JSON)
        .with_body(body.to_string());
    response.set_header("X-DPE-Action", reason);
    response
}

fn finish(
    logger: &mut Endpoint,
    mut log_entry: WafLog,
    response: Response,
    start_time: Instant,
) -> Result<Response, Error> {
    log_entry.set_response_status(response.get_status().as_u16());
    log_entry.finalize(start_time.elapsed().as_secs_f64() * 1000.0);
    writeln!(logger, "{}", log_entry.to_json()?)?;
    debug!(request_id = %log_entry.request_id, "audit line written");
    Ok(response)
}
