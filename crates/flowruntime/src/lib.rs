//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the node registry,
//! the execution graph, parameter expressions, the data-driven run
//! scheduler, suspension and resumption of waiting runs, and nested
//! sub-workflow execution.

mod config;
mod expression;
mod graph;
mod pause;
mod registry;
mod runtime;
mod scheduler;
mod store;
mod subworkflow;

pub use config::{ConfigError, RuntimeConfig};
pub use expression::{ExpressionContext, ExpressionResolver};
pub use graph::{Edge, ExecutionGraph, GraphNode};
pub use pause::PauseController;
pub use registry::{
    InputPolicy, ItemMode, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition,
};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder, RunOptions};
pub use store::{FileStore, MemoryStore};
pub use subworkflow::{failure_item, SubWorkflowInvoker};
