//! Core abstractions for the flow engine
//!
//! This crate provides the data model (items, workflows, run state), the
//! node adapter contract and the collaborator interfaces (persistence,
//! credentials, sub-workflow invocation) that the runtime depends on.

mod credentials;
mod error;
pub mod events;
mod item;
mod node;
mod run;
mod store;
mod workflow;

pub use credentials::{CredentialError, CredentialProvider, NoCredentials, StaticCredentials};
pub use error::{ExpressionError, FlowError, GraphError, NodeError, StoreError};
pub use events::*;
pub use item::{BinaryData, Item, ItemSet, PairedItem};
pub use node::{
    Node, NodeContext, NodeOutcome, NodeOutput, NodeState, Parameters, RuntimeHelpers,
    WaitRequest, WorkflowInvoker,
};
pub use run::{
    Continuation, ExecutionFailure, ExecutionMode, FailureKind, InputSlot, NodeRunRecord,
    NodeRunStatus, ParentRun, ResumeKey, RunContext, RunId, RunState, RunStatus, WaitState,
};
pub use store::{RunStore, WorkflowStore};
pub use workflow::{
    Connection, NodeSpec, Position, RetryPolicy, Workflow, WorkflowId, WorkflowSettings,
    MAIN_PORT,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
