//! Per-run execution record.
//!
//! A [`RunState`] is created when a run starts, mutated only by the run
//! scheduler and the pause controller, and persisted through the
//! [`RunStore`](crate::RunStore) on every status transition. While a run is
//! waiting, its [`Continuation`] holds everything needed to pick scheduling
//! back up in another process.

use crate::item::ItemSet;
use crate::workflow::{Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    New,
    Running,
    Waiting,
    Success,
    Error,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error | RunStatus::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::New => "new",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Manual,
    Trigger,
    Webhook,
    /// Sub-workflow run started by a parent node
    Integrated,
    /// Error workflow run
    Error,
}

/// Identity of the node (and run) that started a sub-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRun {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub node: String,
}

/// Key under which a waiting run can be resumed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeKey(String);

impl ResumeKey {
    /// Derive the key from the waiting node's identity and the caller's
    /// correlation value (e.g. a webhook path)
    pub fn derive(workflow_id: WorkflowId, node: &str, correlation: &str) -> Self {
        Self(format!("{}/{}/{}", workflow_id, node, correlation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResumeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResumeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ResumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Node,
    Timeout,
    Expression,
    Credential,
    ResumeKeyConflict,
    SubWorkflowDepth,
    SubWorkflow,
    Panic,
    StepLimit,
}

/// Failure context preserved in the run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub node: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
    #[serde(default)]
    pub attempts: u32,
}

impl ExecutionFailure {
    pub fn for_node(node: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            kind,
            message: message.into(),
            cause: None,
            attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Success,
    /// Failed but continue-on-fail produced an error-flagged output
    ContinuedOnFail,
    Failed,
    Waiting,
    /// Disabled node; input forwarded untouched
    Bypassed,
}

/// One execution of one node within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRunRecord {
    pub run_index: usize,
    pub status: NodeRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default)]
    pub inputs: BTreeMap<String, ItemSet>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ItemSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    /// Messages of failed attempts that were retried
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_errors: Vec<String>,
}

/// A node parked on an external event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    pub node: String,
    pub resume_key: ResumeKey,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Contribution state of one incoming connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "items")]
pub enum InputSlot {
    /// Source has not produced anything on this connection yet
    #[default]
    Pending,
    /// Source ran and produced no items on this connection
    Empty,
    Data(ItemSet),
}

impl InputSlot {
    pub fn is_pending(&self) -> bool {
        matches!(self, InputSlot::Pending)
    }

    pub fn has_data(&self) -> bool {
        matches!(self, InputSlot::Data(_))
    }

    pub fn push(&mut self, items: ItemSet) {
        match self {
            InputSlot::Data(existing) => existing.extend(items),
            _ => *self = InputSlot::Data(items),
        }
    }

    pub fn settle(&mut self) {
        if self.is_pending() {
            *self = InputSlot::Empty;
        }
    }

    pub fn take(&mut self) -> Option<ItemSet> {
        match std::mem::take(self) {
            InputSlot::Data(items) => Some(items),
            _ => None,
        }
    }
}

/// Scheduler continuation captured when a run suspends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    /// Definition the run started with
    pub workflow: Workflow,
    /// Partially fed inputs keyed by node name, one slot per incoming connection
    #[serde(default)]
    pub buffers: BTreeMap<String, Vec<InputSlot>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Execution records per node, in execution order
    #[serde(default)]
    pub run_data: BTreeMap<String, Vec<NodeRunRecord>>,
    #[serde(default)]
    pub last_node_executed: Option<String>,
    #[serde(default)]
    pub error: Option<ExecutionFailure>,
    #[serde(default)]
    pub static_data: Map<String, Value>,
    /// Persistent per-node state, keyed by node name
    #[serde(default)]
    pub node_state: BTreeMap<String, Map<String, Value>>,
    #[serde(default)]
    pub waiting: Vec<WaitState>,
    #[serde(default)]
    pub continuation: Option<Continuation>,
    #[serde(default)]
    pub parent: Option<ParentRun>,
    /// Node invocations scheduled so far
    #[serde(default)]
    pub steps: u64,
}

impl RunState {
    pub fn new(run_id: RunId, workflow: &Workflow, mode: ExecutionMode) -> Self {
        Self {
            run_id,
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            mode,
            status: RunStatus::New,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            run_data: BTreeMap::new(),
            last_node_executed: None,
            error: None,
            static_data: workflow.static_data.clone(),
            node_state: BTreeMap::new(),
            waiting: Vec::new(),
            continuation: None,
            parent: None,
            steps: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn node_runs(&self, node: &str) -> &[NodeRunRecord] {
        self.run_data.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_run(&self, node: &str) -> Option<&NodeRunRecord> {
        self.node_runs(node).last()
    }

    /// Items emitted on `port` by the latest execution of `node`
    pub fn output_of(&self, node: &str, port: &str) -> Option<&ItemSet> {
        self.last_run(node).and_then(|r| r.outputs.get(port))
    }

    /// Output of the last executed node: its first non-empty port, or
    /// an empty set. Used as the result of sub-workflow runs.
    pub fn final_output(&self) -> ItemSet {
        self.last_node_executed
            .as_deref()
            .and_then(|node| self.last_run(node))
            .and_then(|record| record.outputs.values().find(|items| !items.is_empty()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn wait_for(&self, key: &ResumeKey) -> Option<&WaitState> {
        self.waiting.iter().find(|w| &w.resume_key == key)
    }
}

/// Identity of the run (and node) on whose behalf a collaborator is called
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub node: Option<String>,
    /// Sub-workflow nesting depth, 0 for top-level runs
    #[serde(default)]
    pub depth: usize,
}

impl RunContext {
    pub fn for_node(&self, node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            ..self.clone()
        }
    }
}
