//! Runtime values: the request as seen by the engine, and capability verdicts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Free-form node configuration, exactly as authored in the profile JSON.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Request data available during a profile walk.
///
/// Header names are stored lowercase. `signals` carries verdicts for checks
/// that need network I/O; they are resolved before the walk starts and read
/// back by the injected-verdict capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub form_data: ConfigMap,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub signals: BTreeMap<String, Verdict>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock form submission for testing/preview
    pub fn mock() -> Self {
        let mut ctx = Self {
            client_ip: "192.168.1.100".parse().ok(),
            host: "example.com".to_string(),
            path: "/contact".to_string(),
            method: "POST".to_string(),
            ..Self::default()
        };
        ctx.set_header("User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64)");
        ctx.set_form_field("name", "Jane Doe");
        ctx.set_form_field("message", "Hello there");
        ctx
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_form_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set_form_field(name, value);
        self
    }

    pub fn with_signal(mut self, subtype: &str, verdict: Verdict) -> Self {
        self.signals.insert(subtype.to_string(), verdict);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn set_form_field(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.form_data.insert(name.to_string(), value.into());
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Lowercase every header name. Used after deserializing caller-supplied maps.
    pub fn normalize_headers(&mut self) {
        if self.headers.keys().any(|k| k.chars().any(|c| c.is_ascii_uppercase())) {
            self.headers = std::mem::take(&mut self.headers)
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect();
        }
    }

    /// Text content of a form field. Arrays are joined with spaces, scalars stringified.
    pub fn form_text(&self, name: &str) -> Option<String> {
        self.form_data.get(name).map(value_text)
    }

    /// Iterate over form fields with their text content.
    pub fn form_fields(&self) -> impl Iterator<Item = (&str, String)> {
        self.form_data.iter().map(|(k, v)| (k.as_str(), value_text(v)))
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_text)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Raw verdict returned by a defense capability.
///
/// For list-membership checks such as `ip_allowlist`, `blocked = true`
/// means "present in the list".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub details: ConfigMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    /// A clean verdict: not blocked, zero score.
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }
}

/// Read a list of strings from a config key. Non-string entries are skipped.
pub fn config_strings(config: &ConfigMap, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub fn config_f64(config: &ConfigMap, key: &str) -> Option<f64> {
    config.get(key).and_then(serde_json::Value::as_f64)
}

pub fn config_str<'a>(config: &'a ConfigMap, key: &str) -> Option<&'a str> {
    config.get(key).and_then(serde_json::Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let ctx = RequestContext::new().with_header("X-Forwarded-For", "10.0.0.1");
        assert_eq!(ctx.header("x-forwarded-for"), Some("10.0.0.1"));
        assert_eq!(ctx.header("X-FORWARDED-FOR"), Some("10.0.0.1"));
    }

    #[test]
    fn test_normalize_headers_from_json() {
        let json = r#"{"host":"example.com","headers":{"User-Agent":"curl/8.0","Accept":"*/*"}}"#;
        let mut ctx: RequestContext = serde_json::from_str(json).unwrap();
        ctx.normalize_headers();
        assert_eq!(ctx.header("user-agent"), Some("curl/8.0"));
        assert!(ctx.headers.contains_key("accept"));
    }

    #[test]
    fn test_form_text_flattens_values() {
        let ctx = RequestContext::new()
            .with_form_field("tags", serde_json::json!(["cheap", "pills"]))
            .with_form_field("age", 42)
            .with_form_field("empty", serde_json::Value::Null);
        assert_eq!(ctx.form_text("tags").as_deref(), Some("cheap pills"));
        assert_eq!(ctx.form_text("age").as_deref(), Some("42"));
        assert_eq!(ctx.form_text("empty").as_deref(), Some(""));
        assert_eq!(ctx.form_text("missing"), None);
    }

    #[test]
    fn test_config_strings_accepts_single_string() {
        let config: ConfigMap = serde_json::from_str(r#"{"a":["x",1,"y"],"b":"z"}"#).unwrap();
        assert_eq!(config_strings(&config, "a"), vec!["x", "y"]);
        assert_eq!(config_strings(&config, "b"), vec!["z"]);
        assert!(config_strings(&config, "c").is_empty());
    }
}
