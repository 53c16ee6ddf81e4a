use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{AgentflowError, NodeErrorKind, NodeExecutionError, Result, ValidationError};

/// Per-node configuration, as authored.
pub type NodeConfig = serde_json::Map<String, serde_json::Value>;

/// Values a node emits, keyed by output port.
pub type NodeOutputs = BTreeMap<String, serde_json::Value>;

/// Port used when an edge does not name one.
pub const DEFAULT_OUTPUT_PORT: &str = "output";
pub const DEFAULT_INPUT_PORT: &str = "input";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node type tag. Unrecognised tags are kept as `Custom` so plugins can
/// register handlers for them.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    Prompt,
    Function,
    Llm,
    End,
    Custom(String),
}

impl NodeKind {
    pub fn tag(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Prompt => "prompt",
            Self::Function => "function",
            Self::Llm => "llm",
            Self::End => "end",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<&str> for NodeKind {
    fn from(tag: &str) -> Self {
        match tag {
            "start" => Self::Start,
            "prompt" | "template" => Self::Prompt,
            "function" | "code" => Self::Function,
            "llm" | "llm_call" => Self::Llm,
            "end" => Self::End,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for NodeKind {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.tag().to_string()
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A node in a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, alias = "data")]
    pub config: NodeConfig,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<NodeKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: NodeConfig::new(),
        }
    }

    /// Set a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// A data dependency from one node's output port to another node's input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    #[serde(
        default = "default_source_port",
        alias = "sourceHandle",
        deserialize_with = "source_port_or_default"
    )]
    pub source_port: String,
    pub target: String,
    #[serde(
        default = "default_target_port",
        alias = "targetHandle",
        deserialize_with = "target_port_or_default"
    )]
    pub target_port: String,
}

fn default_source_port() -> String {
    DEFAULT_OUTPUT_PORT.to_string()
}

fn default_target_port() -> String {
    DEFAULT_INPUT_PORT.to_string()
}

// Authoring tools send `null` for an unset handle.
fn source_port_or_default<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(default_source_port))
}

fn target_port_or_default<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(default_target_port))
}

impl EdgeSpec {
    /// Connect `source.output` to `target.input`.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            source_port: default_source_port(),
            target: target.into(),
            target_port: default_target_port(),
        }
    }

    /// Connect named ports.
    pub fn connect(
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        }
    }
}

/// A complete flow: nodes plus the edges between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes,
            edges,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges targeting `node_id`, in declaration order.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }
}

/// Resolved inputs handed to a handler.
///
/// `unavailable` records ports whose upstream succeeded but did not produce
/// the requested output port; handlers see them as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInputs {
    #[serde(default)]
    pub ports: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unavailable: BTreeMap<String, String>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: &str) -> Option<&serde_json::Value> {
        self.ports.get(port)
    }

    pub fn insert(&mut self, port: impl Into<String>, value: serde_json::Value) {
        let port = port.into();
        self.unavailable.remove(&port);
        self.ports.insert(port, value);
    }

    /// Record that `port` was wired to `origin` (`node.port`) but no value arrived.
    pub fn mark_unavailable(&mut self, port: impl Into<String>, origin: impl Into<String>) {
        let port = port.into();
        self.ports.remove(&port);
        self.unavailable.insert(port, origin.into());
    }

    pub fn is_unavailable(&self, port: &str) -> bool {
        self.unavailable.contains_key(port)
    }

    /// The value of the only bound port, if exactly one is bound.
    pub fn single(&self) -> Option<&serde_json::Value> {
        if self.ports.len() == 1 {
            self.ports.values().next()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// All bound ports as a JSON object.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.ports
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Per-dispatch context passed to a handler.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub flow_id: String,
    pub node_id: String,
    pub node_type: String,
    /// The run-level override input, if the run was invoked with one.
    pub initial_input: Option<serde_json::Value>,
}

impl NodeContext {
    /// Build an error attributed to this node.
    pub fn error(&self, kind: NodeErrorKind, message: impl Into<String>) -> NodeExecutionError {
        NodeExecutionError {
            node_id: self.node_id.clone(),
            node_type: self.node_type.clone(),
            kind,
            message: message.into(),
        }
    }
}

/// Static description of a node type, for authoring tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeDescriptor {
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    pub description: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Failed or skipped nodes block their dependents.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal edges of the run state machine. A pending run may fail directly
    /// when its flow does not validate.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub input: NodeInputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub duration_ms: u64,
}

impl NodeResult {
    pub fn pending(node: &NodeSpec) -> Self {
        Self {
            node_id: node.id.clone(),
            node_type: node.kind.tag().to_string(),
            status: NodeStatus::Pending,
            input: NodeInputs::new(),
            output: None,
            error: None,
            skip_reason: None,
            duration_ms: 0,
        }
    }
}

/// Why a run ended `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// The flow never executed.
    Validation { error: ValidationError },
    /// At least one node failed; independent branches may have completed.
    NodeFailures { failed_nodes: Vec<String> },
    /// The run was cancelled before every node was dispatched.
    Cancelled { skipped_nodes: Vec<String> },
}

/// One execution attempt of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: RunId,
    pub flow_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default)]
    pub node_results: Vec<NodeResult>,
}

impl ExecutionRun {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            flow_id: flow_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            final_output: serde_json::Value::Null,
            error: None,
            node_results: Vec::new(),
        }
    }

    /// Move the run to `next`, stamping timestamps. Terminal runs are frozen.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AgentflowError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.started_at.get_or_insert(now);
            self.ended_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| r.node_id == node_id)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
