use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentflow_core::config::EngineConfig;
use agentflow_core::error::ValidationError;
use agentflow_core::event::{EventBus, RunEvent};
use agentflow_core::traits::RunStore;
use agentflow_core::types::*;
use agentflow_nodes::HandlerRegistry;

use crate::resolver::{resolve_order, unreachable_nodes};

/// Executes flow definitions against a handler registry.
///
/// Nodes of one run execute sequentially in resolver order. The engine holds
/// no per-run state, so several runs may share one engine concurrently.
pub struct FlowEngine {
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    events: Option<Arc<EventBus>>,
    run_store: Option<Arc<dyn RunStore>>,
}

impl FlowEngine {
    pub fn new(registry: Arc<HandlerRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            events: None,
            run_store: None,
        }
    }

    /// Publish run lifecycle events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Append every finished run to `store`.
    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Resolve the execution order and check that every node type has a handler.
    pub fn validate(&self, flow: &FlowDefinition) -> Result<Vec<String>, ValidationError> {
        let order = resolve_order(flow)?;
        if let Some(node) = flow.nodes.iter().find(|n| !self.registry.contains(n.kind.tag())) {
            return Err(ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.kind.tag().to_string(),
            });
        }
        Ok(order)
    }

    pub async fn execute(&self, flow: &FlowDefinition, initial_input: Option<Value>) -> ExecutionRun {
        self.execute_with_cancel(flow, initial_input, CancellationToken::new())
            .await
    }

    /// Execute `flow`. Cancellation is checked before each node is
    /// dispatched; nodes not yet started are skipped.
    pub async fn execute_with_cancel(
        &self,
        flow: &FlowDefinition,
        initial_input: Option<Value>,
        cancel: CancellationToken,
    ) -> ExecutionRun {
        let mut run = ExecutionRun::new(&flow.id);
        let started = Instant::now();

        self.publish(RunEvent::RunStarted {
            run_id: run.id.clone(),
            flow_id: flow.id.clone(),
            node_count: flow.nodes.len(),
        });

        match self.validate(flow) {
            Ok(order) => {
                advance(&mut run, RunStatus::Running);
                info!(run_id = %run.id, flow_id = %flow.id, nodes = order.len(), "Flow run started");

                let unreachable = unreachable_nodes(flow);
                if !unreachable.is_empty() {
                    warn!(run_id = %run.id, nodes = ?unreachable, "Nodes not reachable from any start node");
                }

                self.run_nodes(flow, &order, initial_input, &cancel, &mut run).await;
                finish(flow, &mut run);
            }
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "Flow failed validation");
                run.error = Some(RunError::Validation { error: e });
                advance(&mut run, RunStatus::Failed);
            }
        }

        info!(
            run_id = %run.id,
            status = %run.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flow run finished"
        );
        self.publish(RunEvent::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
            duration_ms: run.duration_ms().unwrap_or(0),
        });

        if let Some(store) = &self.run_store {
            if let Err(e) = store.append(&run).await {
                error!(run_id = %run.id, error = %e, "Failed to record run");
            }
        }
        run
    }

    async fn run_nodes(
        &self,
        flow: &FlowDefinition,
        order: &[String],
        initial_input: Option<Value>,
        cancel: &CancellationToken,
        run: &mut ExecutionRun,
    ) {
        let node_timeout = Duration::from_secs(self.config.node_timeout_secs);
        let mut outputs: HashMap<String, NodeOutputs> = HashMap::new();
        let mut slot: HashMap<String, usize> = HashMap::with_capacity(order.len());

        for (i, node_id) in order.iter().enumerate() {
            if let Some(node) = flow.node(node_id) {
                run.node_results.push(NodeResult::pending(node));
                slot.insert(node_id.clone(), i);
            }
        }

        for node_id in order {
            let (Some(node), Some(&idx)) = (flow.node(node_id), slot.get(node_id)) else {
                continue;
            };

            if cancel.is_cancelled() {
                let result = &mut run.node_results[idx];
                result.status = NodeStatus::Skipped;
                result.skip_reason = Some("run cancelled".to_string());
                continue;
            }

            // Direct upstreams only: a skipped upstream already carries the
            // cascade from further up.
            let blocker = flow.incoming(node_id).find_map(|edge| {
                let upstream = &run.node_results[*slot.get(&edge.source)?];
                upstream
                    .status
                    .blocks_dependents()
                    .then(|| (edge.source.clone(), upstream.status))
            });
            if let Some((upstream, status)) = blocker {
                let reason = match status {
                    NodeStatus::Failed => format!("upstream '{}' failed", upstream),
                    _ => format!("upstream '{}' was skipped", upstream),
                };
                debug!(run_id = %run.id, node_id = %node_id, reason = %reason, "Skipping node");
                let result = &mut run.node_results[idx];
                result.status = NodeStatus::Skipped;
                result.skip_reason = Some(reason.clone());
                self.publish(RunEvent::NodeFinished {
                    run_id: run.id.clone(),
                    node_id: node_id.clone(),
                    status: NodeStatus::Skipped,
                    duration_ms: 0,
                    error: Some(reason),
                });
                continue;
            }

            let inputs = resolve_inputs(flow, node_id, &outputs);
            let ctx = NodeContext {
                run_id: run.id.clone(),
                flow_id: flow.id.clone(),
                node_id: node_id.clone(),
                node_type: node.kind.tag().to_string(),
                initial_input: initial_input.clone(),
            };

            run.node_results[idx].status = NodeStatus::Running;
            run.node_results[idx].input = inputs.clone();
            self.publish(RunEvent::NodeStarted {
                run_id: run.id.clone(),
                node_id: node_id.clone(),
                node_type: ctx.node_type.clone(),
            });
            debug!(run_id = %run.id, node_id = %node_id, node_type = %ctx.node_type, "Executing node");

            let node_start = Instant::now();
            let outcome = self
                .registry
                .execute(node.config.clone(), inputs, ctx, node_timeout)
                .await;
            let duration_ms = node_start.elapsed().as_millis() as u64;

            let result = &mut run.node_results[idx];
            result.duration_ms = duration_ms;
            let error = match outcome {
                Ok(out) => {
                    result.status = NodeStatus::Success;
                    result.output = Some(out.clone());
                    outputs.insert(node_id.clone(), out);
                    None
                }
                Err(e) => {
                    warn!(run_id = %run.id, node_id = %node_id, error = %e, "Node failed");
                    result.status = NodeStatus::Failed;
                    let message = e.to_string();
                    result.error = Some(e);
                    Some(message)
                }
            };

            self.publish(RunEvent::NodeFinished {
                run_id: run.id.clone(),
                node_id: node_id.clone(),
                status: result.status,
                duration_ms,
                error,
            });
        }
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Build a node's inputs from its incoming edges, in declaration order.
/// A later edge into the same port overrides an earlier one.
fn resolve_inputs(
    flow: &FlowDefinition,
    node_id: &str,
    outputs: &HashMap<String, NodeOutputs>,
) -> NodeInputs {
    let mut inputs = NodeInputs::new();
    for edge in flow.incoming(node_id) {
        match outputs.get(&edge.source).and_then(|out| out.get(&edge.source_port)) {
            Some(value) => inputs.insert(edge.target_port.clone(), value.clone()),
            None => inputs.mark_unavailable(
                edge.target_port.clone(),
                format!("{}.{}", edge.source, edge.source_port),
            ),
        }
    }
    inputs
}

fn advance(run: &mut ExecutionRun, next: RunStatus) {
    if let Err(e) = run.transition(next) {
        error!(run_id = %run.id, error = %e, "Run state machine rejected transition");
    }
}

/// Settle the final status, error and output of an executed run.
fn finish(flow: &FlowDefinition, run: &mut ExecutionRun) {
    let cancelled: Vec<String> = run
        .node_results
        .iter()
        .filter(|r| r.status == NodeStatus::Skipped && r.skip_reason.as_deref() == Some("run cancelled"))
        .map(|r| r.node_id.clone())
        .collect();
    let failed: Vec<String> = run
        .node_results
        .iter()
        .filter(|r| r.status == NodeStatus::Failed)
        .map(|r| r.node_id.clone())
        .collect();

    run.final_output = final_output(flow, &run.node_results);

    if !cancelled.is_empty() {
        run.error = Some(RunError::Cancelled {
            skipped_nodes: cancelled,
        });
        advance(run, RunStatus::Failed);
    } else if !failed.is_empty() {
        run.error = Some(RunError::NodeFailures {
            failed_nodes: failed,
        });
        advance(run, RunStatus::Failed);
    } else {
        advance(run, RunStatus::Completed);
    }
}

fn end_value(inputs: &NodeInputs) -> Value {
    if inputs.is_empty() {
        return Value::Null;
    }
    inputs
        .get(DEFAULT_INPUT_PORT)
        .or_else(|| inputs.single())
        .cloned()
        .unwrap_or_else(|| inputs.to_value())
}

/// The reached End node's input; several End nodes give an object keyed by
/// node id; with none reached, the last successful node's `output`.
fn final_output(flow: &FlowDefinition, results: &[NodeResult]) -> Value {
    let is_end = |r: &NodeResult| {
        flow.node(&r.node_id)
            .map(|n| n.kind == NodeKind::End)
            .unwrap_or(false)
    };
    let ends: Vec<&NodeResult> = results
        .iter()
        .filter(|r| r.status == NodeStatus::Success && is_end(r))
        .collect();

    match ends.as_slice() {
        [only] => end_value(&only.input),
        [] => results
            .iter()
            .rev()
            .find(|r| r.status == NodeStatus::Success)
            .and_then(|r| r.output.as_ref())
            .map(|out| {
                out.get(DEFAULT_OUTPUT_PORT).cloned().unwrap_or_else(|| {
                    Value::Object(out.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                })
            })
            .unwrap_or(Value::Null),
        many => Value::Object(
            many.iter()
                .map(|r| (r.node_id.clone(), end_value(&r.input)))
                .collect(),
        ),
    }
}
