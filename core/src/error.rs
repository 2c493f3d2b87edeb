//! Error types for profile loading, validation and execution.

use std::fmt;

/// A single problem found while validating a profile graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("profile has no start node")]
    MissingStart,

    #[error("profile has {count} start nodes, expected exactly one")]
    MultipleStarts { count: usize },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}': {reason}")]
    InvalidNodeConfig { node: String, reason: String },

    #[error("node '{node}': invalid threshold ranges: {reason}")]
    InvalidThresholdRanges { node: String, reason: String },

    #[error("edge {from} -[{handle}]-> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        handle: String,
        to: String,
        missing: String,
    },

    #[error("node '{node}' has no output handle named '{handle}'")]
    IllegalHandle { node: String, handle: String },

    #[error("node '{node}' has more than one edge on handle '{handle}'")]
    DuplicateHandle { node: String, handle: String },

    #[error("start node '{0}' must not have incoming edges")]
    StartHasIncoming(String),

    #[error("action node '{0}' must not have outgoing edges")]
    ActionHasOutgoing(String),

    #[error("node '{0}' has no outgoing edges")]
    NoOutgoingEdges(String),

    #[error("node '{0}' has no incoming edges")]
    NoIncomingEdges(String),

    #[error("node '{0}' is not reachable from the start node")]
    Unreachable(String),

    #[error("cycle detected through node '{0}'")]
    CycleDetected(String),

    #[error("longest walk visits {length} nodes, exceeding the limit of {limit}")]
    WalkTooLong { length: usize, limit: usize },
}

/// Every problem found in one profile. Validation never stops at the first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors(pub Vec<GraphError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, error: GraphError) {
        self.0.push(error);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphError> {
        self.0.iter()
    }

    /// Human-readable messages, one per problem.
    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(|e| e.to_string()).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s): {}", self.0.len(), self.messages().join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors raised while assembling an engine snapshot from a configuration bundle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("profile '{profile}' is invalid: {errors}")]
    InvalidProfile {
        profile: String,
        errors: ValidationErrors,
    },

    #[error("duplicate profile id '{0}'")]
    DuplicateProfile(String),

    #[error("duplicate endpoint id '{0}'")]
    DuplicateEndpoint(String),

    #[error("profile '{profile}' node '{node}' uses unknown defense subtype '{subtype}'")]
    UnknownSubtype {
        profile: String,
        node: String,
        subtype: String,
    },

    #[error("profile '{profile}' node '{node}' has invalid {subtype} config: {reason}")]
    InvalidCapabilityConfig {
        profile: String,
        node: String,
        subtype: String,
        reason: String,
    },

    #[error("endpoint '{endpoint}' references unknown profile '{profile}'")]
    UnknownProfile { endpoint: String, profile: String },

    #[error("endpoint '{endpoint}' references unknown attack signature '{signature}'")]
    UnknownSignature { endpoint: String, signature: String },

    #[error("endpoint '{endpoint}' has more than one enabled defense line for profile '{profile}'")]
    DuplicateDefenseLine { endpoint: String, profile: String },

    #[error("endpoint '{endpoint}' profile '{profile}': weight must be a finite non-negative number")]
    InvalidWeight { endpoint: String, profile: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<ron::error::SpannedError> for ConfigError {
    fn from(e: ron::error::SpannedError) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// All problems found in one configuration bundle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(|e| e.to_string()).collect()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s): {}", self.0.len(), self.messages().join("; "))
    }
}

impl std::error::Error for ConfigErrors {}

impl From<ConfigError> for ConfigErrors {
    fn from(e: ConfigError) -> Self {
        ConfigErrors(vec![e])
    }
}

/// Failure reported by a defense capability.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("check failed: {0}")]
    Failed(String),
}

/// Runtime invariant violations. These point at a validation gap, not a bad request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineFault {
    #[error("profile '{profile}' exceeded the node visit ceiling of {limit}")]
    VisitCeilingExceeded { profile: String, limit: usize },

    #[error("profile '{profile}' node '{node}': no threshold range matches score {score}")]
    NoMatchingRange {
        profile: String,
        node: String,
        score: f64,
    },
}
