use crate::run::{FailureKind, ResumeKey, RunId};
use crate::workflow::WorkflowId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Resume key already held by another run: {key}")]
    ResumeKeyConflict { key: ResumeKey },

    #[error("No waiting run for resume key: {key}")]
    ResumeKeyNotFound { key: ResumeKey },

    #[error("Run {run_id} is not waiting")]
    RunNotWaiting { run_id: RunId },

    #[error("Run {run_id} is not active")]
    RunNotActive { run_id: RunId },

    #[error("Maximum sub-workflow depth of {max} exceeded")]
    MaxSubWorkflowDepthExceeded { max: usize },

    #[error("Sub-workflow run {run_id} failed: {message}")]
    SubWorkflowFailed { run_id: RunId, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Errors raised by a node adapter during invocation.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {message}")]
    ExecutionFailed {
        message: String,
        cause: Option<serde_json::Value>,
    },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Credential not found: {name}")]
    CredentialNotFound { name: String },

    #[error("Sub-workflow failed: {message}")]
    SubWorkflowFailed { message: String },

    #[error("Maximum sub-workflow depth of {max} exceeded")]
    SubWorkflowDepthExceeded { max: usize },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NodeError::ExecutionFailed {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: serde_json::Value) -> Self {
        NodeError::ExecutionFailed {
            message: message.into(),
            cause: Some(cause),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, message: impl Into<String>) -> Self {
        NodeError::InvalidParameter {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Classification recorded in the run state when this error is unrecovered.
    pub fn kind(&self) -> FailureKind {
        match self {
            NodeError::Timeout { .. } => FailureKind::Timeout,
            NodeError::Expression(ExpressionError::CredentialNotFound { .. })
            | NodeError::CredentialNotFound { .. } => FailureKind::Credential,
            NodeError::Expression(_) => FailureKind::Expression,
            NodeError::SubWorkflowFailed { .. } => FailureKind::SubWorkflow,
            NodeError::SubWorkflowDepthExceeded { .. } => FailureKind::SubWorkflowDepth,
            _ => FailureKind::Node,
        }
    }

    pub fn cause(&self) -> Option<&serde_json::Value> {
        match self {
            NodeError::ExecutionFailed { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unresolved reference in '{expression}'")]
    Unresolved { expression: String },

    #[error("Type mismatch in '{expression}': {message}")]
    TypeMismatch { expression: String, message: String },

    #[error("Invalid expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("Credential not found: {name}")]
    CredentialNotFound { name: String },
}

/// Structural problems found while building an execution graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Cycle without a loop controller: {}", .nodes.join(" -> "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Connection {source_node} -> {target_node} references missing node '{missing}'")]
    DanglingConnection {
        source_node: String,
        target_node: String,
        missing: String,
    },

    #[error("Unknown node type '{node_type}' for node '{node}'")]
    UnknownNodeType { node: String, node_type: String },

    #[error("Port mismatch on node '{node}' port '{port}': {reason}")]
    PortMismatch {
        node: String,
        port: String,
        reason: String,
    },

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' could not be created: {message}")]
    InvalidNode { node: String, message: String },

    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Start node not found: {0}")]
    UnknownStartNode(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
