use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Holds the items for `delay_ms` before passing them on. The delay ends
/// early with an error when the run is cancelled.
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let delay_ms = ctx
            .parameters
            .get_u64(0, "delay_ms")
            .unwrap_or(DEFAULT_DELAY_MS);
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => {
                tracing::debug!("{}: delay interrupted by cancellation", ctx.node_name);
                return Err(NodeError::Cancelled);
            }
        }

        Ok(NodeOutput::main(ctx.main_input().clone()).into())
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        match spec.parameters.get("delay_ms") {
            Some(v) if !v.is_u64() && !v.as_str().is_some_and(|s| s.starts_with('=')) => Err(
                NodeError::Configuration("'delay_ms' must be a whole number".to_string()),
            ),
            _ => Ok(Arc::new(DelayNode)),
        }
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Delay items for a number of milliseconds", "time").once()
    }
}
