use crate::error::StoreError;
use crate::run::{RunId, RunState};
use crate::workflow::{Workflow, WorkflowId};
use async_trait::async_trait;

/// Source of workflow definitions
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError>;
}

/// Durable storage for run state
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError>;

    async fn load_run_state(&self, run_id: RunId) -> Result<RunState, StoreError>;

    /// Every run currently persisted with status `waiting`
    async fn list_waiting_runs(&self) -> Result<Vec<RunState>, StoreError>;
}
