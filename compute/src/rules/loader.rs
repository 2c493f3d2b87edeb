//! Configuration bundle loader with compression support.
//!
//! The editor deploys the whole bundle (engine settings, profiles,
//! signatures, endpoints) as one packed value in the Config Store. This
//! module unpacks it and hands it to the core `SnapshotStore`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dpe_core::{ConfigErrors, EngineSnapshot, SnapshotStore};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::ConfigPayload;

/// Config Store holding one payload per service.
pub const CONFIG_STORE: &str = "defense_profiles";

const RAW_PREFIX: &str = "raw:";

/// Errors that can occur while loading the bundle.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Config store key not found: {0}")]
    KeyNotFound(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Gzip decompression error: {0}")]
    DecompressError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid bundle format: expected an object with a profiles list")]
    InvalidFormat,

    #[error("Empty rules_packed in payload")]
    EmptyRules,

    #[error("Bundle rejected: {0}")]
    Invalid(#[from] ConfigErrors),
}

/// Unpacks `rules_packed` into bundle JSON text.
///
/// Expected encoding: base64(gzip(JSON)) or "raw:" + base64(JSON). The text
/// is returned untouched so the snapshot digest covers exactly what was
/// deployed.
pub fn decompress_bundle(packed: &str) -> Result<String, LoadError> {
    let packed = packed.trim();
    if packed.is_empty() {
        return Err(LoadError::EmptyRules);
    }

    let json = match packed.strip_prefix(RAW_PREFIX) {
        Some(b64) => {
            let bytes = BASE64.decode(b64)?;
            String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        }
        None => {
            let compressed = BASE64.decode(packed)?;
            let mut decoder = GzDecoder::new(&compressed[..]);
            let mut json = String::new();
            decoder.read_to_string(&mut json)?;
            json
        }
    };

    let value: serde_json::Value = serde_json::from_str(&json)?;
    if !value.get("profiles").is_some_and(|p| p.is_array()) {
        return Err(LoadError::InvalidFormat);
    }

    debug!(bytes = json.len(), "bundle unpacked");
    Ok(json)
}

pub fn parse_payload(json: &str) -> Result<ConfigPayload, LoadError> {
    let payload: ConfigPayload = serde_json::from_str(json)?;
    if payload.rules_packed.trim().is_empty() {
        return Err(LoadError::EmptyRules);
    }
    Ok(payload)
}

/// Reads the payload for `service_id` from the Config Store.
pub fn load_payload(store: &fastly::ConfigStore, service_id: &str) -> Result<ConfigPayload, LoadError> {
    let payload_json = store
        .get(service_id)
        .ok_or_else(|| LoadError::KeyNotFound(service_id.to_string()))?;
    parse_payload(&payload_json)
}

/// Brings `store` up to `payload.version`.
///
/// Nothing is decoded when that version is already serving. A bundle that
/// fails to unpack or validate leaves the current snapshot in place.
pub fn refresh(store: &SnapshotStore, payload: &ConfigPayload) -> Result<Arc<EngineSnapshot>, LoadError> {
    let current = store.current();
    if !current.is_placeholder() && current.version == payload.version {
        return Ok(current);
    }

    info!(version = %payload.version, deployed_at = %payload.deployed_at, "loading defense profiles");
    let json = decompress_bundle(&payload.rules_packed)?;
    Ok(store.reload(&payload.version, &json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpe_core::CapabilityRegistry;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const BUNDLE: &str = r#"{
        "profiles": [
            {
                "id": "contact",
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
            {"id": "contact", "path_prefix": "/contact", "defense_profiles": {"profiles": [{"id": "contact"}]}}
        ]
    }"#;

    fn gzip_b64(json: &str) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        BASE64.encode(encoder.finish().unwrap())
    }

    fn payload(version: &str, packed: String) -> ConfigPayload {
        ConfigPayload {
            version: version.to_string(),
            deployed_at: "2024-06-01T10:00:00Z".to_string(),
            rules_packed: packed,
        }
    }

    fn empty_store() -> SnapshotStore {
        SnapshotStore::new(EngineSnapshot::empty(Arc::new(CapabilityRegistry::with_builtins())))
    }

    #[test]
    fn test_decompress_bundle_raw_format() {
        let encoded = format!("raw:{}", BASE64.encode(BUNDLE));
        assert_eq!(decompress_bundle(&encoded).unwrap(), BUNDLE);
    }

    #[test]
    fn test_decompress_bundle_gzip_format() {
        assert_eq!(decompress_bundle(&gzip_b64(BUNDLE)).unwrap(), BUNDLE);
    }

    #[test]
    fn test_decompress_bundle_errors() {
        assert!(matches!(decompress_bundle(""), Err(LoadError::EmptyRules)));
        assert!(matches!(decompress_bundle("raw:!!!"), Err(LoadError::Base64Error(_))));
        // valid base64, not gzip
        assert!(matches!(decompress_bundle(&BASE64.encode("plain")), Err(LoadError::DecompressError(_))));
        assert!(matches!(
            decompress_bundle(&format!("raw:{}", BASE64.encode("{"))),
            Err(LoadError::JsonError(_))
        ));
        assert!(matches!(
            decompress_bundle(&format!("raw:{}", BASE64.encode(r#"{"nodes": [], "edges": []}"#))),
            Err(LoadError::InvalidFormat)
        ));
    }

    #[test]
    fn test_parse_payload_rejects_empty_rules() {
        let json = r#"{"version": "1", "deployedAt": "now", "rules_packed": ""}"#;
        assert!(matches!(parse_payload(json), Err(LoadError::EmptyRules)));
    }

    #[test]
    fn test_refresh_installs_and_skips_same_version() {
        let store = empty_store();
        let first = refresh(&store, &payload("v1", gzip_b64(BUNDLE))).unwrap();
        assert_eq!(first.version, "v1");
        assert!(!first.is_placeholder());

        // same version is not decoded again, even if the packed value is junk
        let again = refresh(&store, &payload("v1", "junk".to_string())).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_refresh_keeps_last_good_snapshot() {
        let store = empty_store();
        refresh(&store, &payload("v1", gzip_b64(BUNDLE))).unwrap();

        let broken = BUNDLE.replace(r#""to": "allow""#, r#""to": "missing""#);
        let err = refresh(&store, &payload("v2", gzip_b64(&broken))).unwrap_err();
        assert!(matches!(err, LoadError::Invalid(_)));
        assert_eq!(store.current().version, "v1");

        let err = refresh(&store, &payload("v3", "raw:@@".to_string())).unwrap_err();
        assert!(matches!(err, LoadError::Base64Error(_)));
        assert_eq!(store.current().version, "v1");
    }
}
