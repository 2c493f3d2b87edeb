//! Config Store payload and edge route types.

use serde::{Deserialize, Serialize};

/// Value stored under the service id key in the `defense_profiles` Config Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub version: String,
    #[serde(rename = "deployedAt", default)]
    pub deployed_at: String,
    /// `base64(gzip(bundle JSON))` or `"raw:" + base64(bundle JSON)`
    pub rules_packed: String,
}

/// What the edge service does with an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// CORS preflight for one of the system endpoints.
    Preflight,
    Version,
    Health,
    /// `POST /defense-profiles/{id}/simulate`
    Simulate { profile_id: String },
    /// Everything else is traffic to protect.
    Protected,
}

const SIMULATE_PREFIX: &str = "/defense-profiles/";
const SIMULATE_SUFFIX: &str = "/simulate";

impl Route {
    pub fn parse(method: &str, path: &str) -> Self {
        let system = match path {
            "/_version" => Some(Route::Version),
            "/_health" => Some(Route::Health),
            _ => simulate_target(path).map(|profile_id| Route::Simulate { profile_id }),
        };

        match (method, system) {
            ("OPTIONS", Some(_)) => Route::Preflight,
            ("GET", Some(route @ (Route::Version | Route::Health))) => route,
            ("POST", Some(route @ Route::Simulate { .. })) => route,
            _ => Route::Protected,
        }
    }

    /// Methods advertised in the preflight response.
    pub fn allowed_methods(path: &str) -> &'static str {
        if simulate_target(path).is_some() {
            "POST, OPTIONS"
        } else {
            "GET, OPTIONS"
        }
    }
}

fn simulate_target(path: &str) -> Option<String> {
    let id = path.strip_prefix(SIMULATE_PREFIX)?.strip_suffix(SIMULATE_SUFFIX)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}
