use std::collections::HashMap;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{FlowStore, RunStore};
use agentflow_core::types::{ExecutionRun, FlowDefinition};

/// Process-local flow and run store.
#[derive(Default)]
pub struct InMemoryStore {
    flows: RwLock<HashMap<String, FlowDefinition>>,
    runs: RwLock<Vec<ExecutionRun>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for InMemoryStore {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move { Ok(self.flows.read().await.get(&flow_id).cloned()) })
    }

    fn put(&self, mut flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>> {
        Box::pin(async move {
            let mut flows = self.flows.write().await;
            let now = Utc::now();
            flow.created_at = flows
                .get(&flow.id)
                .and_then(|existing| existing.created_at)
                .or(flow.created_at)
                .or(Some(now));
            flow.updated_at = Some(now);
            flows.insert(flow.id.clone(), flow.clone());
            Ok(flow)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>> {
        Box::pin(async move {
            let mut flows: Vec<FlowDefinition> = self.flows.read().await.values().cloned().collect();
            flows.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(flows)
        })
    }

    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move { Ok(self.flows.write().await.remove(&flow_id).is_some()) })
    }
}

impl RunStore for InMemoryStore {
    fn append(&self, run: &ExecutionRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let mut runs = self.runs.write().await;
            if runs.iter().any(|r| r.id == run.id) {
                return Err(AgentflowError::DuplicateRun(run.id.to_string()));
            }
            runs.push(run);
            Ok(())
        })
    }

    fn get(&self, run_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRun>>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            Ok(self
                .runs
                .read()
                .await
                .iter()
                .find(|r| r.id.0 == run_id)
                .cloned())
        })
    }

    fn list_for_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionRun>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let runs = self.runs.read().await;
            // Stable sort over append order keeps later appends first on ties.
            let mut matching: Vec<ExecutionRun> = runs
                .iter()
                .rev()
                .filter(|r| r.flow_id == flow_id)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok(matching)
        })
    }
}
