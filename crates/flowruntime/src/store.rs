//! Workflow and run-state stores.

use async_trait::async_trait;
use flowcore::{RunId, RunState, RunStatus, RunStore, StoreError, Workflow, WorkflowId, WorkflowStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    runs: RwLock<HashMap<RunId, RunState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save_workflow(&self, workflow: Workflow) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        self.runs.write().await.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_run_state(&self, run_id: RunId) -> Result<RunState, StoreError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_waiting_runs(&self) -> Result<Vec<RunState>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.status == RunStatus::Waiting)
            .cloned()
            .collect())
    }
}

/// Directory-backed store: `workflows/<id>.json` and `runs/<id>.json`
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("workflows")).await?;
        tokio::fs::create_dir_all(root.join("runs")).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_path(&self, id: WorkflowId) -> PathBuf {
        self.root.join("workflows").join(format!("{}.json", id))
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", id))
    }

    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        write_json(&self.workflow_path(workflow.id), workflow).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        read_dir_json(&self.root.join("workflows")).await
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!("Skipping unreadable file {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let bytes = read_if_exists(&self.workflow_path(id))
            .await?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        write_json(&self.run_path(state.run_id), state).await
    }

    async fn load_run_state(&self, run_id: RunId) -> Result<RunState, StoreError> {
        let bytes = read_if_exists(&self.run_path(run_id))
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list_waiting_runs(&self) -> Result<Vec<RunState>, StoreError> {
        let runs: Vec<RunState> = read_dir_json(&self.root.join("runs")).await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Waiting)
            .collect())
    }
}
