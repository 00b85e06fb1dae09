use crate::run::{ExecutionMode, ResumeKey, RunId, RunStatus};
use crate::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: WorkflowId,
        mode: ExecutionMode,
        timestamp: DateTime<Utc>,
    },
    RunResumed {
        run_id: RunId,
        node: String,
        timestamp: DateTime<Utc>,
    },
    RunWaiting {
        run_id: RunId,
        resume_keys: Vec<ResumeKey>,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node: String,
        node_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        run_id: RunId,
        node: String,
        /// Item count per output port
        items: BTreeMap<String, usize>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node: String,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        run_id: RunId,
        node: String,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    node: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, node: impl Into<String>, sender: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            run_id,
            node: node.into(),
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            run_id: self.run_id,
            node: self.node.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }
}

/// Global event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for execution event");
        }
    }

    pub fn create_emitter(&self, run_id: RunId, node: impl Into<String>) -> EventEmitter {
        EventEmitter::new(run_id, node, self.sender.clone())
    }
}
