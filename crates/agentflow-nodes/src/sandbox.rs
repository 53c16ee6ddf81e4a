use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tracing::debug;

use agentflow_core::config::SandboxConfig;
use agentflow_core::error::SandboxError;
use agentflow_core::traits::{CodeSandbox, SandboxBindings};

/// Runs user code in a restricted rhai interpreter.
///
/// Each evaluation gets a fresh engine on a blocking thread. rhai has no
/// filesystem, network or process access; `eval` is disabled, and the
/// progress hook aborts the script once its deadline passes.
pub struct RhaiSandbox {
    config: SandboxConfig,
}

impl RhaiSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

impl Default for RhaiSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

fn build_engine(config: &SandboxConfig, deadline: Instant) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);
    engine.disable_symbol("eval");

    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("deadline"))
        } else {
            None
        }
    });
    engine.on_print(|text| debug!(target: "agentflow::sandbox", "{}", text));
    engine.on_debug(|text, _source, pos| debug!(target: "agentflow::sandbox", %pos, "{}", text));
    engine
}

fn classify(err: EvalAltResult, timeout_ms: u64) -> SandboxError {
    match err {
        EvalAltResult::ErrorTerminated(..) => SandboxError::Timeout { timeout_ms },
        EvalAltResult::ErrorTooManyOperations(_)
        | EvalAltResult::ErrorDataTooLarge(..)
        | EvalAltResult::ErrorStackOverflow(_) => SandboxError::ResourceLimit(err.to_string()),
        other => SandboxError::Runtime(other.to_string()),
    }
}

fn evaluate_blocking(
    config: &SandboxConfig,
    code: &str,
    bindings: SandboxBindings,
    timeout: Duration,
) -> Result<serde_json::Value, SandboxError> {
    let timeout_ms = timeout.as_millis() as u64;
    let engine = build_engine(config, Instant::now() + timeout);

    let ast = engine
        .compile(code)
        .map_err(|e| SandboxError::Compile(e.to_string()))?;

    let input_data = rhai::serde::to_dynamic(&bindings.input_data)
        .map_err(|e| SandboxError::Conversion(e.to_string()))?;
    let inputs = rhai::serde::to_dynamic(&bindings.inputs)
        .map_err(|e| SandboxError::Conversion(e.to_string()))?;

    let mut scope = Scope::new();
    scope.push_dynamic("input_data", input_data);
    scope.push_dynamic("inputs", inputs);

    let result: Dynamic = engine
        .eval_ast_with_scope(&mut scope, &ast)
        .map_err(|e| classify(*e, timeout_ms))?;

    // rhai has no null: JSON null arrives as unit, and so does a script
    // that ends on a statement.
    if result.is_unit() {
        return Ok(serde_json::Value::Null);
    }
    rhai::serde::from_dynamic(&result).map_err(|e| SandboxError::Conversion(e.to_string()))
}

impl CodeSandbox for RhaiSandbox {
    fn name(&self) -> &str {
        "rhai"
    }

    fn evaluate(
        &self,
        code: String,
        bindings: SandboxBindings,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<serde_json::Value, SandboxError>> {
        Box::pin(async move {
            if code.len() > self.config.max_code_length {
                return Err(SandboxError::ResourceLimit(format!(
                    "code is {} bytes, limit is {}",
                    code.len(),
                    self.config.max_code_length
                )));
            }

            let config = self.config.clone();
            let task = tokio::task::spawn_blocking(move || {
                evaluate_blocking(&config, &code, bindings, timeout)
            });

            // The progress hook stops the script at the deadline; the outer
            // bound covers native calls that never yield to it.
            let grace = Duration::from_millis(250);
            match tokio::time::timeout(timeout + grace, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(SandboxError::Runtime(format!(
                    "evaluation aborted: {}",
                    join_err
                ))),
                Err(_) => Err(SandboxError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(input: serde_json::Value) -> SandboxBindings {
        SandboxBindings {
            inputs: json!({ "input": input.clone() }),
            input_data: input,
        }
    }

    async fn eval(code: &str, input: serde_json::Value) -> Result<serde_json::Value, SandboxError> {
        RhaiSandbox::default()
            .evaluate(code.to_string(), bindings(input), Duration::from_secs(2))
            .await
    }

    #[tokio::test]
    async fn test_return_input() {
        assert_eq!(eval("return input_data;", json!("x")).await.unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn test_final_expression_and_maps() {
        let out = eval(r#"#{ doubled: input_data.n * 2, tag: "ok" }"#, json!({"n": 21}))
            .await
            .unwrap();
        assert_eq!(out, json!({"doubled": 42, "tag": "ok"}));
    }

    #[tokio::test]
    async fn test_inputs_binding() {
        let out = eval("inputs.input.len()", json!([1, 2, 3])).await.unwrap();
        assert_eq!(out, json!(3));
    }

    #[tokio::test]
    async fn test_unit_result_is_null() {
        assert_eq!(eval("let x = 1;", json!(null)).await.unwrap(), json!(null));
    }

    #[tokio::test]
    async fn test_null_input_passes_through() {
        assert_eq!(eval("return input_data;", json!(null)).await.unwrap(), json!(null));
        let out = eval("#{ seen: input_data }", json!(null)).await.unwrap();
        assert_eq!(out, json!({"seen": null}));
    }

    #[tokio::test]
    async fn test_compile_and_runtime_errors() {
        assert!(matches!(
            eval("let = ;", json!(null)).await.unwrap_err(),
            SandboxError::Compile(_)
        ));
        assert!(matches!(
            eval(r#"throw "boom";"#, json!(null)).await.unwrap_err(),
            SandboxError::Runtime(_)
        ));
    }

    #[tokio::test]
    async fn test_eval_is_disabled() {
        let err = eval(r#"eval("1 + 1")"#, json!(null)).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Compile(_) | SandboxError::Runtime(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let err = RhaiSandbox::default()
            .evaluate(
                "loop { }".to_string(),
                bindings(json!(null)),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::Timeout { timeout_ms: 200 });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_operation_budget() {
        let sandbox = RhaiSandbox::new(SandboxConfig {
            max_operations: 1_000,
            ..SandboxConfig::default()
        });
        let err = sandbox
            .evaluate(
                "let x = 0; loop { x += 1; }".to_string(),
                bindings(json!(null)),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ResourceLimit(_)));
    }

    #[tokio::test]
    async fn test_code_length_limit() {
        let sandbox = RhaiSandbox::new(SandboxConfig {
            max_code_length: 8,
            ..SandboxConfig::default()
        });
        let err = sandbox
            .evaluate("return input_data;".into(), bindings(json!(1)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ResourceLimit(_)));
    }
}
