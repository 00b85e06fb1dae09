use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutcome, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

/// Fails the run with a configured message and optional structured `cause`
pub struct StopAndErrorNode;

#[async_trait]
impl Node for StopAndErrorNode {
    fn node_type(&self) -> &str {
        "flow.stopAndError"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let message = ctx
            .parameters
            .get_str(0, "message")
            .unwrap_or("Workflow stopped")
            .to_string();
        Err(match ctx.parameters.get(0, "cause") {
            Some(cause) => NodeError::with_cause(message, cause.clone()),
            None => NodeError::failed(message),
        })
    }
}

pub struct StopAndErrorNodeFactory;

impl NodeFactory for StopAndErrorNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(StopAndErrorNode))
    }

    fn node_type(&self) -> &str {
        "flow.stopAndError"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Fail the run", "flow")
            .with_outputs(Vec::<String>::new())
            .once()
    }
}
