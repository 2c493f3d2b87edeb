//! Edge plumbing around the defense profile engine.
//!
//! Loads the deployed bundle from the Config Store, turns Fastly requests
//! into engine contexts, turns decisions back into responses and writes the
//! audit trail.

pub mod http;
pub mod loader;
pub mod logging;
pub mod types;

pub use http::{context_from_request, enforcement_response, forward, json_response, preflight};
pub use loader::{decompress_bundle, load_payload, refresh, LoadError, CONFIG_STORE};
pub use logging::{WafLog, LOG_ENDPOINT};
pub use types::{ConfigPayload, Route};
