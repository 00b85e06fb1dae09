use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

/// Start node: emits the items the run was started with
pub struct TriggerNode {
    node_type: &'static str,
}

#[async_trait]
impl Node for TriggerNode {
    fn node_type(&self) -> &str {
        self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let items = ctx.main_input().clone();
        tracing::debug!("Trigger {} emitting {} item(s)", ctx.node_name, items.len());
        Ok(NodeOutput::main(items).into())
    }
}

pub struct TriggerNodeFactory {
    node_type: &'static str,
    description: &'static str,
}

impl TriggerNodeFactory {
    pub fn manual() -> Self {
        Self {
            node_type: "trigger.manual",
            description: "Starts a run on demand",
        }
    }

    /// Started by the HTTP layer with the request as the single item
    pub fn webhook() -> Self {
        Self {
            node_type: "trigger.webhook",
            description: "Starts a run from an inbound webhook call",
        }
    }

    /// Receives the failure context of another workflow's failed run
    pub fn error() -> Self {
        Self {
            node_type: "trigger.error",
            description: "Starts an error workflow",
        }
    }
}

impl NodeFactory for TriggerNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(TriggerNode {
            node_type: self.node_type,
        }))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.description, "trigger").trigger().once()
    }
}

/// Passes its input through unchanged
pub struct NoOpNode;

#[async_trait]
impl Node for NoOpNode {
    fn node_type(&self) -> &str {
        "flow.noop"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutput::main(ctx.main_input().clone()).into())
    }
}

pub struct NoOpNodeFactory;

impl NodeFactory for NoOpNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(NoOpNode))
    }

    fn node_type(&self) -> &str {
        "flow.noop"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Passes items through unchanged", "flow").once()
    }
}
