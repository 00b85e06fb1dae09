//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod batches;
mod conditional;
mod debug;
mod execute_workflow;
mod merge;
mod set;
mod stop;
mod time;
mod trigger;
mod util;
mod wait;

pub use batches::SplitInBatchesNode;
pub use conditional::IfNode;
pub use debug::DebugNode;
pub use execute_workflow::ExecuteWorkflowNode;
pub use merge::MergeNode;
pub use set::SetNode;
pub use stop::StopAndErrorNode;
pub use time::DelayNode;
pub use trigger::{NoOpNode, TriggerNode, TriggerNodeFactory};
pub use wait::WaitNode;
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(TriggerNodeFactory::manual()));
    registry.register(Arc::new(TriggerNodeFactory::webhook()));
    registry.register(Arc::new(TriggerNodeFactory::error()));
    registry.register(Arc::new(trigger::NoOpNodeFactory));
    registry.register(Arc::new(set::SetNodeFactory));
    registry.register(Arc::new(conditional::IfNodeFactory));
    registry.register(Arc::new(merge::MergeNodeFactory));
    registry.register(Arc::new(wait::WaitNodeFactory));
    registry.register(Arc::new(execute_workflow::ExecuteWorkflowNodeFactory));
    registry.register(Arc::new(batches::SplitInBatchesNodeFactory));
    registry.register(Arc::new(stop::StopAndErrorNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
}

/// Registry with every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
