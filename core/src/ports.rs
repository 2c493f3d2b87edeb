//! Output handle (port) names.
//!
//! Each node kind exposes a fixed set of named output handles. Edges attach
//! to a handle by name; `threshold_branch` operators are the exception, their
//! handles are the `output` names of their configured ranges.

pub const NEXT: &str = "next";
pub const CONTINUE: &str = "continue";
pub const BLOCKED: &str = "blocked";
pub const ALLOWED: &str = "allowed";

/// Subtype whose handles are `allowed`/`continue` instead of `continue`/`blocked`.
pub const IP_ALLOWLIST: &str = "ip_allowlist";

const START_HANDLES: &[&str] = &[NEXT];
const DEFENSE_HANDLES: &[&str] = &[CONTINUE, BLOCKED];
const ALLOWLIST_HANDLES: &[&str] = &[ALLOWED, CONTINUE];
const SCORE_OPERATOR_HANDLES: &[&str] = &[NEXT];
const LOGIC_OPERATOR_HANDLES: &[&str] = &[CONTINUE, BLOCKED];
const OBSERVATION_HANDLES: &[&str] = &[CONTINUE];
const NO_HANDLES: &[&str] = &[];

/// Static handle set for a `(type, subtype)` pair. Backs both
/// [`NodeKind::handles`](crate::NodeKind::handles) and the editor palette.
///
/// Returns `None` for `threshold_branch` (handles come from its ranges) and for
/// unknown combinations.
pub fn static_handles(node_type: &str, subtype: &str) -> Option<&'static [&'static str]> {
    match (node_type, subtype) {
        ("start", _) => Some(START_HANDLES),
        ("defense", IP_ALLOWLIST) => Some(ALLOWLIST_HANDLES),
        ("defense", _) => Some(DEFENSE_HANDLES),
        ("operator", "sum" | "max" | "min") => Some(SCORE_OPERATOR_HANDLES),
        ("operator", "and" | "or") => Some(LOGIC_OPERATOR_HANDLES),
        ("operator", _) => None,
        ("action", _) => Some(NO_HANDLES),
        ("observation", _) => Some(OBSERVATION_HANDLES),
        _ => None,
    }
}

/// Output handles must be lowercase ASCII letters, digits or underscores.
pub fn is_valid_handle_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
