use std::io::Write;

use serde_json::json;
use tempfile::NamedTempFile;

use agentflow_core::types::*;

/// `start -> prompt("Hello {name}") -> end`, fed `{"name": "World"}`.
pub fn hello_world_flow() -> FlowDefinition {
    FlowDefinition::new(
        "hello",
        vec![
            NodeSpec::new("a", NodeKind::Start).with_config("initial_value", json!({"name": "World"})),
            NodeSpec::new("b", NodeKind::Prompt).with_config("template", json!("Hello {name}")),
            NodeSpec::new("c", NodeKind::End),
        ],
        vec![
            EdgeSpec::connect("a", "name", "b", "name"),
            EdgeSpec::new("b", "c"),
        ],
    )
}

/// `start` feeding a failing function (with a downstream end) and an
/// independent prompt sibling.
pub fn failing_branch_flow() -> FlowDefinition {
    FlowDefinition::new(
        "branches",
        vec![
            NodeSpec::new("start", NodeKind::Start).with_config("initial_value", json!("x")),
            NodeSpec::new("boom", NodeKind::Function).with_config("code", json!("throw \"boom\";")),
            NodeSpec::new("after_boom", NodeKind::End),
            NodeSpec::new("sibling", NodeKind::Prompt).with_config("template", json!("got {input}")),
        ],
        vec![
            EdgeSpec::new("start", "boom"),
            EdgeSpec::new("boom", "after_boom"),
            EdgeSpec::new("start", "sibling"),
        ],
    )
}

/// Straight line of `len` nodes of type `tag`: `n0 -> n1 -> ...`.
pub fn chain_flow(tag: &str, len: usize) -> FlowDefinition {
    let nodes = (0..len)
        .map(|i| NodeSpec::new(format!("n{}", i), tag))
        .collect();
    let edges = (1..len)
        .map(|i| EdgeSpec::new(format!("n{}", i - 1), format!("n{}", i)))
        .collect();
    FlowDefinition::new(format!("chain-{}", tag), nodes, edges)
}

/// Write a flow as JSON to a temp file (removed on drop).
pub fn write_flow_file(flow: &FlowDefinition) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let json = serde_json::to_string_pretty(flow).unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
