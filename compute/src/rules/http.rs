//! Bridges Fastly requests and responses to the engine.

use dpe_core::{ExecutionResult, FinalAction, RequestContext};
use fastly::http::StatusCode;
use fastly::{Request, Response};
use hmac_sha256::HMAC;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Static backend receiving forwarded traffic.
pub const ORIGIN_BACKEND: &str = "origin";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Builds the engine's view of `req`.
///
/// Form and JSON bodies are read from a copy so the original body can
/// still be forwarded.
pub fn context_from_request(req: &mut Request) -> RequestContext {
    let mut ctx = RequestContext {
        client_ip: req.get_client_ip_addr(),
        host: req.get_url().host_str().unwrap_or_default().to_string(),
        path: req.get_path().to_string(),
        method: req.get_method_str().to_string(),
        ..RequestContext::new()
    };

    for name in req.get_header_names() {
        if let Some(value) = req.get_header(name).and_then(|v| v.to_str().ok()) {
            ctx.set_header(name.as_str(), value);
        }
    }

    if let Some(kind) = body_kind(ctx.header("content-type"), &ctx.method) {
        let mut copy = req.clone_with_body();
        match kind {
            BodyKind::Form => match copy.take_body_form::<BTreeMap<String, String>>() {
                Ok(fields) => {
                    for (name, value) in fields {
                        ctx.set_form_field(&name, value);
                    }
                }
                Err(e) => warn!(error = %e, "unreadable form body"),
            },
            BodyKind::Json => match copy.take_body_json::<serde_json::Value>() {
                Ok(serde_json::Value::Object(fields)) => ctx.form_data = fields,
                Ok(_) => debug!("json body is not an object"),
                Err(e) => warn!(error = %e, "unreadable json body"),
            },
        }
    }

    ctx
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Form,
    Json,
}

fn body_kind(content_type: Option<&str>, method: &str) -> Option<BodyKind> {
    if !matches!(method, "POST" | "PUT" | "PATCH") {
        return None;
    }
    let media = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    match media.as_str() {
        FORM_CONTENT_TYPE => Some(BodyKind::Form),
        JSON_CONTENT_TYPE => Some(BodyKind::Json),
        _ => None,
    }
}

/// Response for a decision that stops the request at the edge.
///
/// Returns `None` for actions that forward. Tarpits sleep first when
/// `tarpit_enabled`.
pub fn enforcement_response(result: &ExecutionResult, tarpit_enabled: bool) -> Option<Response> {
    let status = status_or(result.http_status, StatusCode::FORBIDDEN);
    let response = match result.action {
        FinalAction::Block => Response::from_status(status)
            .with_body_text_plain(result.block_reason.as_deref().unwrap_or("Request blocked")),
        FinalAction::Captcha => {
            let body = serde_json::json!({
                "challenge": "captcha",
                "reason": result.block_reason,
            });
            Response::from_status(status)
                .with_content_type(fastly::mime::APPLICATION_JSON)
                .with_body(body.to_string())
        }
        FinalAction::Tarpit => {
            let delay = result.tarpit_delay.unwrap_or(0);
            if tarpit_enabled && delay > 0 {
                debug!(delay, "tarpitting request");
                std::thread::sleep(Duration::from_secs(u64::from(delay)));
            }
            Response::from_status(status).with_body_text_plain("Request rejected")
        }
        FinalAction::Allow | FinalAction::Flag | FinalAction::Monitor => return None,
    };

    Some(annotate_response(response, result))
}

fn status_or(code: Option<u16>, fallback: StatusCode) -> StatusCode {
    code.and_then(|c| StatusCode::from_u16(c).ok()).unwrap_or(fallback)
}

fn annotate_response(mut response: Response, result: &ExecutionResult) -> Response {
    response.set_header("X-DPE-Action", result.action.as_str());
    response
}

/// Decision headers for the origin.
pub fn decision_headers(result: &ExecutionResult) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("X-DPE-Action", result.action.as_str().to_string()),
        ("X-DPE-Score", format!("{}", result.score)),
    ];
    if !result.flags.is_empty() {
        headers.push(("X-DPE-Flags", result.flags.join(",")));
    }
    headers
}

/// Sends `req` to the origin with the decision attached.
pub fn forward(mut req: Request, result: &ExecutionResult) -> Result<Response, fastly::Error> {
    for (name, value) in decision_headers(result) {
        req.set_header(name, value);
    }
    add_edge_auth(&mut req);
    let mut response = req.send(ORIGIN_BACKEND)?;
    response.set_header("X-DPE-Action", result.action.as_str());
    Ok(response)
}

/// `timestamp,pop,0x<hmac-sha256(timestamp,pop)>`
pub fn edge_auth_value(secret: &str, pop: &str, unix_secs: u64) -> String {
    let data = format!("{},{}", unix_secs, pop);
    let sig = HMAC::mac(data.as_bytes(), secret.as_bytes());
    format!("{},0x{}", data, hex::encode(sig))
}

/// Adds the `Edge-Auth` header when a shared secret is configured.
fn add_edge_auth(req: &mut Request) {
    let secret = match fastly::ConfigStore::try_open("dpe_shared_secret") {
        Ok(store) => store.get("compute_auth_key"),
        Err(_) => None,
    };
    let Some(secret) = secret else {
        debug!("edge auth secret not configured, skipping header");
        return;
    };

    let pop = std::env::var("FASTLY_POP").unwrap_or_default();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    req.set_header("Edge-Auth", edge_auth_value(&secret, &pop, now));
}

/// Adds the permissive CORS headers used by the system endpoints.
pub fn with_cors(response: Response) -> Response {
    response
        .with_header("Access-Control-Allow-Origin", "*")
        .with_header("Access-Control-Allow-Headers", "Accept, Content-Type")
}

pub fn preflight(methods: &str) -> Response {
    with_cors(Response::from_status(StatusCode::NO_CONTENT))
        .with_header("Access-Control-Allow-Methods", methods)
        .with_header("Access-Control-Max-Age", "86400")
}

pub fn json_response(status: StatusCode, body: String) -> Response {
    with_cors(
        Response::from_status(status)
            .with_content_type(fastly::mime::APPLICATION_JSON)
            .with_body(body),
    )
}
