//! Reference defense capabilities.
//!
//! Small, self-contained checks registered by
//! [`CapabilityRegistry::with_builtins`](crate::CapabilityRegistry::with_builtins).
//! Production deployments register their own implementations under the same
//! subtype names.

use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::CapabilityError;
use crate::registry::{DefenseCapability, Prepared};
use crate::value::{config_f64, config_str, config_strings, ConfigMap, RequestContext, Verdict};

const DEFAULT_HONEYPOT_FIELDS: &[&str] = &["website", "hp_email"];
const DEFAULT_HONEYPOT_SCORE: f64 = 100.0;
const DEFAULT_KEYWORD_SCORE: f64 = 10.0;

/// Hidden form fields that humans leave empty.
///
/// Config: `fields` (default `["website", "hp_email"]`), `action_on_fill`
/// (`block` | `score`, default `block`), `score` (default 100).
pub struct Honeypot;

impl DefenseCapability for Honeypot {
    fn evaluate(&self, config: &ConfigMap, ctx: &RequestContext) -> Result<Verdict, CapabilityError> {
        let mut fields = config_strings(config, "fields");
        if fields.is_empty() {
            fields = DEFAULT_HONEYPOT_FIELDS.iter().map(|f| f.to_string()).collect();
        }
        let filled: Vec<&String> = fields
            .iter()
            .filter(|f| ctx.form_text(f).is_some_and(|v| !v.trim().is_empty()))
            .collect();
        if filled.is_empty() {
            return Ok(Verdict::pass());
        }

        let score = config_f64(config, "score").unwrap_or(DEFAULT_HONEYPOT_SCORE);
        let block = config_str(config, "action_on_fill").unwrap_or("block") == "block";
        let mut verdict = if block {
            Verdict::blocked(format!("honeypot field '{}' filled", filled[0]))
        } else {
            Verdict::pass()
        };
        verdict = verdict
            .with_score(score)
            .with_flag("honeypot_filled")
            .with_detail("filled_fields", filled.iter().map(|f| f.as_str()).collect::<Vec<_>>());
        Ok(verdict)
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), CapabilityError> {
        match config_str(config, "action_on_fill") {
            None | Some("block") | Some("score") => Ok(()),
            Some(other) => Err(CapabilityError::InvalidConfig(format!(
                "action_on_fill must be 'block' or 'score', got '{}'",
                other
            ))),
        }
    }

    fn pattern_keys(&self) -> &'static [&'static str] {
        &["fields"]
    }
}

/// Client IP membership in a list of addresses and CIDR ranges.
///
/// Config: `ips` (addresses or CIDRs). A hit sets `blocked = true`; for
/// `ip_allowlist` that reads as "listed".
pub struct IpList;

struct IpEntries(Vec<IpNet>);

impl IpEntries {
    fn parse(config: &ConfigMap) -> Result<Self, CapabilityError> {
        let mut entries = config_strings(config, "ips");
        entries.extend(config_strings(config, "cidrs"));
        entries
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| CapabilityError::InvalidConfig(format!("'{}' is not an IP address or CIDR", entry)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(IpEntries)
    }

    fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let Some(ip) = ctx.client_ip else {
            return Verdict::pass();
        };
        match self.0.iter().find(|net| net.contains(&ip)) {
            Some(net) => Verdict::blocked(format!("client ip {} listed in {}", ip, net)).with_detail("matched", net.to_string()),
            None => Verdict::pass(),
        }
    }
}

impl DefenseCapability for IpList {
    fn evaluate(&self, config: &ConfigMap, ctx: &RequestContext) -> Result<Verdict, CapabilityError> {
        Ok(IpEntries::parse(config)?.evaluate(ctx))
    }

    fn prepare(&self, config: &ConfigMap) -> Result<Option<Prepared>, CapabilityError> {
        Ok(Some(Arc::new(IpEntries::parse(config)?)))
    }

    fn evaluate_prepared(
        &self,
        config: &ConfigMap,
        prepared: &Prepared,
        ctx: &RequestContext,
    ) -> Result<Verdict, CapabilityError> {
        match (**prepared).downcast_ref::<IpEntries>() {
            Some(entries) => Ok(entries.evaluate(ctx)),
            None => self.evaluate(config, ctx),
        }
    }

    fn pattern_keys(&self) -> &'static [&'static str] {
        &["ips", "cidrs"]
    }
}

/// Keyword and regex matching over form fields.
///
/// Config: `keywords` (case-insensitive substrings), `patterns` (regexes),
/// `fields` (restrict to these form fields, default all), `score_per_match`
/// (default 10), `block_threshold` (matches needed to block, default 1).
pub struct KeywordFilter;

struct KeywordRules {
    keywords: Vec<String>,
    patterns: Vec<Regex>,
    fields: Vec<String>,
    per_match: f64,
    threshold: f64,
}

impl KeywordRules {
    fn compile(config: &ConfigMap) -> Result<Self, CapabilityError> {
        let patterns = config_strings(config, "patterns")
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| CapabilityError::InvalidConfig(format!("bad pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keywords: config_strings(config, "keywords")
                .into_iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            patterns,
            fields: config_strings(config, "fields"),
            per_match: config_f64(config, "score_per_match").unwrap_or(DEFAULT_KEYWORD_SCORE),
            threshold: config_f64(config, "block_threshold").unwrap_or(1.0),
        })
    }

    fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let mut matched: Vec<String> = Vec::new();
        for (name, text) in ctx.form_fields() {
            if !self.fields.is_empty() && !self.fields.iter().any(|f| f == name) {
                continue;
            }
            let lowered = text.to_lowercase();
            for keyword in &self.keywords {
                if lowered.contains(keyword.as_str()) && !matched.contains(keyword) {
                    matched.push(keyword.clone());
                }
            }
            for re in &self.patterns {
                let source = re.as_str().to_string();
                if re.is_match(&text) && !matched.contains(&source) {
                    matched.push(source);
                }
            }
        }

        if matched.is_empty() {
            return Verdict::pass();
        }

        let count = matched.len() as f64;
        let verdict = if count >= self.threshold {
            Verdict::blocked(format!("matched {} keyword(s): {}", matched.len(), matched.join(", ")))
        } else {
            Verdict::pass()
        };
        verdict
            .with_score(count * self.per_match)
            .with_flag("keyword_match")
            .with_detail("matched", matched)
    }
}

impl DefenseCapability for KeywordFilter {
    fn evaluate(&self, config: &ConfigMap, ctx: &RequestContext) -> Result<Verdict, CapabilityError> {
        Ok(KeywordRules::compile(config)?.evaluate(ctx))
    }

    fn prepare(&self, config: &ConfigMap) -> Result<Option<Prepared>, CapabilityError> {
        Ok(Some(Arc::new(KeywordRules::compile(config)?)))
    }

    fn evaluate_prepared(
        &self,
        config: &ConfigMap,
        prepared: &Prepared,
        ctx: &RequestContext,
    ) -> Result<Verdict, CapabilityError> {
        match (**prepared).downcast_ref::<KeywordRules>() {
            Some(rules) => Ok(rules.evaluate(ctx)),
            None => self.evaluate(config, ctx),
        }
    }

    fn pattern_keys(&self) -> &'static [&'static str] {
        &["keywords", "patterns"]
    }
}

/// Verdict computed ahead of the walk (reputation webhooks, behavioral models).
///
/// Reads `ctx.signals[key]`; absent signals are a clean pass.
pub struct InjectedVerdict {
    key: String,
}

impl InjectedVerdict {
    pub fn new(key: &str) -> Self {
        Self { key: key.to_string() }
    }
}

impl DefenseCapability for InjectedVerdict {
    fn evaluate(&self, _config: &ConfigMap, ctx: &RequestContext) -> Result<Verdict, CapabilityError> {
        Ok(ctx
            .signals
            .get(&self.key)
            .cloned()
            .unwrap_or_else(|| Verdict::pass().with_detail("injected", false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ConfigMap {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_honeypot_filled_blocks() {
        let ctx = RequestContext::new().with_form_field("website", "http://spam.example");
        let verdict = Honeypot.evaluate(&config(r#"{"fields":["website"],"action_on_fill":"block"}"#), &ctx).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.score, 100.0);
        assert_eq!(verdict.flags, vec!["honeypot_filled"]);
    }

    #[test]
    fn test_honeypot_empty_passes() {
        let ctx = RequestContext::new().with_form_field("website", "  ");
        let verdict = Honeypot.evaluate(&config(r#"{"fields":["website"]}"#), &ctx).unwrap();
        assert_eq!(verdict, Verdict::pass());
    }

    #[test]
    fn test_honeypot_score_mode_does_not_block() {
        let ctx = RequestContext::new().with_form_field("hp_email", "bot@example.com");
        let verdict = Honeypot.evaluate(&config(r#"{"action_on_fill":"score","score":40}"#), &ctx).unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.score, 40.0);
    }

    #[test]
    fn test_ip_list_matches_cidr_and_address() {
        let cfg = config(r#"{"ips":["10.0.0.0/8","192.168.1.7"]}"#);
        let inside = RequestContext::new().with_client_ip("10.1.2.3".parse().unwrap());
        let exact = RequestContext::new().with_client_ip("192.168.1.7".parse().unwrap());
        let outside = RequestContext::new().with_client_ip("8.8.8.8".parse().unwrap());
        assert!(IpList.evaluate(&cfg, &inside).unwrap().blocked);
        assert!(IpList.evaluate(&cfg, &exact).unwrap().blocked);
        assert!(!IpList.evaluate(&cfg, &outside).unwrap().blocked);
        assert!(!IpList.evaluate(&cfg, &RequestContext::new()).unwrap().blocked);
    }

    #[test]
    fn test_ip_list_rejects_garbage() {
        assert!(IpList.validate_config(&config(r#"{"ips":["not-an-ip"]}"#)).is_err());
    }

    #[test]
    fn test_keyword_filter_scores_matches() {
        let ctx = RequestContext::new()
            .with_form_field("message", "Buy CHEAP pills at casino-online")
            .with_form_field("name", "casino fan");
        let cfg = config(r#"{"keywords":["cheap","pills"],"patterns":["casino-\\w+"],"score_per_match":5,"block_threshold":3}"#);
        let verdict = KeywordFilter.evaluate(&cfg, &ctx).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.score, 15.0);
    }

    #[test]
    fn test_keyword_filter_restricts_fields() {
        let ctx = RequestContext::new()
            .with_form_field("message", "hello")
            .with_form_field("name", "cheap");
        let cfg = config(r#"{"keywords":["cheap"],"fields":["message"]}"#);
        assert_eq!(KeywordFilter.evaluate(&cfg, &ctx).unwrap(), Verdict::pass());
    }

    #[test]
    fn test_keyword_filter_rejects_bad_regex() {
        assert!(KeywordFilter.validate_config(&config(r#"{"patterns":["("]}"#)).is_err());
    }

    #[test]
    fn test_injected_verdict() {
        let ctx = RequestContext::new().with_signal("ip_reputation", Verdict::blocked("known bad").with_score(70.0));
        let verdict = InjectedVerdict::new("ip_reputation").evaluate(&ConfigMap::new(), &ctx).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.score, 70.0);

        let absent = InjectedVerdict::new("behavioral").evaluate(&ConfigMap::new(), &ctx).unwrap();
        assert!(!absent.blocked);
    }

    #[test]
    fn test_prepared_rules_match_raw_evaluation() {
        let cfg = config(r#"{"keywords":["cheap"],"patterns":["casino-\\w+"]}"#);
        let ctx = RequestContext::new().with_form_field("message", "cheap casino-royale");
        let prepared = KeywordFilter.prepare(&cfg).unwrap().unwrap();
        assert_eq!(
            KeywordFilter.evaluate_prepared(&cfg, &prepared, &ctx).unwrap(),
            KeywordFilter.evaluate(&cfg, &ctx).unwrap()
        );

        let ips = config(r#"{"ips":["10.0.0.0/8"]}"#);
        let inside = RequestContext::new().with_client_ip("10.9.9.9".parse().unwrap());
        let prepared = IpList.prepare(&ips).unwrap().unwrap();
        assert!(IpList.evaluate_prepared(&ips, &prepared, &inside).unwrap().blocked);
    }
}
