use agentflow_core::types::NodeTypeDescriptor;

fn descriptor(node_type: &str, label: &str, description: &str, inputs: &[&str], outputs: &[&str]) -> NodeTypeDescriptor {
    NodeTypeDescriptor {
        node_type: node_type.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn start_descriptor() -> NodeTypeDescriptor {
    descriptor("start", "Start", "Starting point of the flow", &[], &["output"])
}

pub fn prompt_descriptor() -> NodeTypeDescriptor {
    descriptor("prompt", "Prompt", "Template prompt with variables", &["input"], &["output"])
}

pub fn function_descriptor() -> NodeTypeDescriptor {
    descriptor("function", "Function", "Custom sandboxed code", &["input"], &["output"])
}

pub fn llm_descriptor() -> NodeTypeDescriptor {
    descriptor("llm", "LLM", "Large Language Model call", &["prompt"], &["output"])
}

pub fn end_descriptor() -> NodeTypeDescriptor {
    descriptor("end", "End", "End point of the flow", &["input"], &[])
}

/// Descriptors of the five built-in node types, in authoring order.
pub fn builtin_catalog() -> Vec<NodeTypeDescriptor> {
    vec![
        start_descriptor(),
        prompt_descriptor(),
        function_descriptor(),
        llm_descriptor(),
        end_descriptor(),
    ]
}
