//! Nested workflow execution.
//!
//! A sub-workflow runs on a fresh graph and scheduler and is awaited by the
//! calling node. Error workflows reuse the same machinery with a synthetic
//! trigger item describing the failure.

use crate::graph::ExecutionGraph;
use crate::runtime::EngineShared;
use crate::scheduler::RunScheduler;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{
    ExecutionFailure, ExecutionMode, FailureKind, FlowError, Item, ItemSet, ParentRun, RunContext,
    RunId, RunState, RunStatus, Workflow, WorkflowId, WorkflowInvoker,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SubWorkflowInvoker {
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
}

impl SubWorkflowInvoker {
    pub(crate) fn new(shared: Arc<EngineShared>, cancel: CancellationToken) -> Self {
        Self { shared, cancel }
    }
}

#[async_trait]
impl WorkflowInvoker for SubWorkflowInvoker {
    async fn invoke(
        &self,
        workflow_id: WorkflowId,
        items: ItemSet,
        caller: &RunContext,
    ) -> Result<ItemSet, FlowError> {
        let max = self.shared.config.max_sub_workflow_depth;
        let depth = caller.depth + 1;
        if depth > max {
            tracing::warn!(
                "Run {} tried to start workflow {} beyond depth {}",
                caller.run_id,
                workflow_id,
                max
            );
            return Err(FlowError::MaxSubWorkflowDepthExceeded { max });
        }

        let workflow = self.shared.workflows.load_workflow(workflow_id).await?;
        let graph = Arc::new(ExecutionGraph::build(&workflow, &self.shared.registry)?);
        let start = graph.start_node(None)?;

        let mut state = RunState::new(Uuid::new_v4(), &workflow, ExecutionMode::Integrated);
        state.parent = Some(ParentRun {
            run_id: caller.run_id,
            workflow_id: caller.workflow_id,
            node: caller.node.clone().unwrap_or_default(),
        });
        let run_id = state.run_id;
        tracing::info!(
            "Run {} starts sub-workflow {} as run {} (depth {})",
            caller.run_id,
            workflow_id,
            run_id,
            depth
        );

        let scheduler = RunScheduler::start(
            self.shared.clone(),
            graph,
            state,
            start,
            items,
            self.cancel.child_token(),
            depth,
        );
        let finished = scheduler.run().await?;

        match finished.status {
            RunStatus::Success => Ok(finished.final_output()),
            RunStatus::Waiting => {
                let message = "sub-workflow runs cannot wait for external events".to_string();
                abandon_waiting_run(&self.shared, finished, &message).await;
                Err(FlowError::SubWorkflowFailed { run_id, message })
            }
            status => Err(FlowError::SubWorkflowFailed {
                run_id,
                message: finished
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("run ended with status {}", status)),
            }),
        }
    }
}

/// Turn a sub-run that suspended into a failed run and free its keys
async fn abandon_waiting_run(shared: &EngineShared, mut state: RunState, message: &str) {
    shared.pause.release_run(state.run_id).await;
    state.waiting.clear();
    state.continuation = None;
    state.status = RunStatus::Error;
    state.finished_at = Some(Utc::now());
    state.error = Some(ExecutionFailure {
        node: state.last_node_executed.clone(),
        kind: FailureKind::SubWorkflow,
        message: message.to_string(),
        cause: None,
        attempts: 1,
    });
    if let Err(e) = shared.runs.save_run_state(&state).await {
        tracing::warn!("Failed to persist abandoned run {}: {}", state.run_id, e);
    }
}

/// Start the workflow's error workflow, if any, for a run that ended in
/// error. Failures are logged and never propagated; runs that are
/// themselves error workflows never trigger another.
pub(crate) async fn run_error_workflow(
    shared: &Arc<EngineShared>,
    workflow: &Workflow,
    failed: &RunState,
    depth: usize,
) {
    if failed.mode == ExecutionMode::Error {
        return;
    }
    let Some(error_workflow) = workflow.settings.error_workflow else {
        return;
    };

    tracing::info!(
        "Run {} failed, starting error workflow {}",
        failed.run_id,
        error_workflow
    );
    match start_error_workflow(shared, error_workflow, failed, depth).await {
        Ok((run_id, RunStatus::Success)) => {
            tracing::debug!("Error workflow run {} succeeded", run_id)
        }
        Ok((run_id, status)) => tracing::warn!(
            "Error workflow run {} for run {} ended with status {}",
            run_id,
            failed.run_id,
            status
        ),
        Err(e) => tracing::warn!(
            "Error workflow {} for run {} could not run: {}",
            error_workflow,
            failed.run_id,
            e
        ),
    }
}

async fn start_error_workflow(
    shared: &Arc<EngineShared>,
    workflow_id: WorkflowId,
    failed: &RunState,
    depth: usize,
) -> Result<(RunId, RunStatus), FlowError> {
    let workflow = shared.workflows.load_workflow(workflow_id).await?;
    let graph = Arc::new(ExecutionGraph::build(&workflow, &shared.registry)?);
    let start = graph.start_node(None)?;

    let state = RunState::new(Uuid::new_v4(), &workflow, ExecutionMode::Error);
    let scheduler = RunScheduler::start(
        shared.clone(),
        graph,
        state,
        start,
        ItemSet::from(vec![failure_item(failed)]),
        CancellationToken::new(),
        depth,
    );
    let finished = scheduler.run().await?;
    Ok((finished.run_id, finished.status))
}

/// Trigger item handed to error workflows
pub fn failure_item(failed: &RunState) -> Item {
    let error = failed.error.as_ref();
    Item::from_json(json!({
        "execution": {
            "id": failed.run_id,
            "mode": failed.mode,
            "error": {
                "message": error.map(|e| e.message.clone()),
                "node": error.and_then(|e| e.node.clone()),
                "kind": error.map(|e| e.kind),
            },
            "lastNodeExecuted": failed.last_node_executed,
        },
        "workflow": {
            "id": failed.workflow_id,
            "name": failed.workflow_name,
        },
    }))
}
