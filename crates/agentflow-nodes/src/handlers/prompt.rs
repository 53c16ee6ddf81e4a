use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;

use agentflow_core::error::{NodeErrorKind, NodeExecutionError};
use agentflow_core::traits::NodeHandler;
use agentflow_core::types::*;

use super::{config_str, value_to_text};

/// Fills `{name}` placeholders in a text template.
pub struct PromptHandler;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Substitute every placeholder in `template` via `lookup`. `{{` and `}}`
/// render as literal braces. Returns the first unresolved variable name.
pub fn render_template<F>(template: &str, mut lookup: F) -> Result<String, String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_pattern().captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        rendered.push_str(&template[last..whole.start]);
        match caps.get(1) {
            Some(name) => {
                let value = lookup(name.as_str()).ok_or_else(|| name.as_str().to_string())?;
                rendered.push_str(&value);
            }
            None => rendered.push_str(&template[whole.start..whole.start + 1]),
        }
        last = whole.end;
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Port, then a field of any object-valued port (lexical port order), then
/// the static `variables` map.
fn lookup_variable(name: &str, inputs: &NodeInputs, variables: Option<&Value>) -> Option<String> {
    if let Some(value) = inputs.get(name) {
        return Some(value_to_text(value));
    }
    for value in inputs.ports.values() {
        if let Some(field) = value.as_object().and_then(|obj| obj.get(name)) {
            return Some(value_to_text(field));
        }
    }
    variables
        .and_then(|vars| vars.get(name))
        .map(value_to_text)
}

impl NodeHandler for PromptHandler {
    fn node_type(&self) -> &str {
        "prompt"
    }

    fn descriptor(&self) -> NodeTypeDescriptor {
        crate::catalog::prompt_descriptor()
    }

    fn execute(
        &self,
        config: NodeConfig,
        inputs: NodeInputs,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeOutputs, NodeExecutionError>> {
        Box::pin(async move {
            let template = config_str(&config, "template", &ctx)?.unwrap_or_default();
            let variables = config.get("variables");
            if let Some(vars) = variables {
                if !vars.is_object() && !vars.is_null() {
                    return Err(ctx.error(
                        NodeErrorKind::InvalidConfig,
                        "config 'variables' must be an object",
                    ));
                }
            }

            let text = render_template(template, |name| lookup_variable(name, &inputs, variables))
                .map_err(|missing| {
                    let unavailable = inputs
                        .unavailable
                        .get(&missing)
                        .map(|origin| format!(" (upstream {} produced no value)", origin))
                        .unwrap_or_default();
                    ctx.error(
                        NodeErrorKind::MissingVariable,
                        format!("variable '{}' is not bound{}", missing, unavailable),
                    )
                })?;

            let mut outputs = NodeOutputs::new();
            outputs.insert(DEFAULT_OUTPUT_PORT.to_string(), Value::String(text));
            Ok(outputs)
        })
    }
}
