use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A flow that cannot be executed at all. Surfaced before any node runs.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Cyclic graph: nodes never resolved: {}", .nodes.join(", "))]
    CyclicGraph { nodes: Vec<String> },

    #[error("Dangling edge {from} -> {to}: node '{missing}' does not exist")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Duplicate node id: {node_id}")]
    DuplicateNode { node_id: String },

    #[error("Unknown node type '{node_type}' on node '{node_id}'")]
    UnknownNodeType { node_id: String, node_type: String },
}

/// Classification of a handler-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    MissingVariable,
    InvalidConfig,
    Sandbox,
    SandboxTimeout,
    MissingCredential,
    Transient,
    Provider,
    Timeout,
    Internal,
}

impl NodeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingVariable => "missing_variable",
            Self::InvalidConfig => "invalid_config",
            Self::Sandbox => "sandbox",
            Self::SandboxTimeout => "sandbox_timeout",
            Self::MissingCredential => "missing_credential",
            Self::Transient => "transient",
            Self::Provider => "provider",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler failure, contained to the node that produced it.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{node_type} node '{node_id}' failed ({kind}): {message}")]
pub struct NodeExecutionError {
    pub node_id: String,
    pub node_type: String,
    pub kind: NodeErrorKind,
    pub message: String,
}

/// Errors from a language-model provider call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("LLM credential missing: {0}")]
    MissingCredential(String),

    /// Timeouts, rate limits, 5xx responses and dropped connections.
    #[error("LLM request failed transiently: {0}")]
    Transient(String),

    #[error("LLM provider rejected request: {0}")]
    Provider(String),

    #[error("LLM response parse error: {0}")]
    Parse(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, body);
        match status {
            408 | 429 | 500..=599 => Self::Transient(msg),
            _ => Self::Provider(msg),
        }
    }

    pub fn node_kind(&self) -> NodeErrorKind {
        match self {
            Self::MissingCredential(_) => NodeErrorKind::MissingCredential,
            Self::Transient(_) => NodeErrorKind::Transient,
            Self::UnsupportedProvider(_) => NodeErrorKind::InvalidConfig,
            Self::Provider(_) | Self::Parse(_) => NodeErrorKind::Provider,
        }
    }
}

/// Errors raised while evaluating user code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("code does not compile: {0}")]
    Compile(String),

    #[error("code raised an error: {0}")]
    Runtime(String),

    #[error("code exceeded its time limit of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("code exceeded a resource limit: {0}")]
    ResourceLimit(String),

    #[error("value conversion failed: {0}")]
    Conversion(String),
}

impl SandboxError {
    pub fn node_kind(&self) -> NodeErrorKind {
        match self {
            Self::Timeout { .. } => NodeErrorKind::SandboxTimeout,
            _ => NodeErrorKind::Sandbox,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentflowError {
    #[error("Flow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Node(#[from] NodeExecutionError),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Illegal run transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    // Store errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already recorded: {0}")]
    DuplicateRun(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentflowError>;
