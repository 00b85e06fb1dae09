use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;

/// Logs a message and passes its items on untouched.
///
/// Item payloads are only written to the event stream when `log_items` is
/// set; they may carry data that should not end up in logs.
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let message = ctx
            .parameters
            .get_str(0, "message")
            .unwrap_or("(no message)");
        let items = ctx.main_input();

        ctx.events.info(format!("DEBUG: {} ({} item(s))", message, items.len()));
        tracing::info!("{}: {} ({} item(s))", ctx.node_name, message, items.len());

        if ctx.parameters.get_bool(0, "log_items").unwrap_or(false) {
            for (index, item) in items.iter().enumerate() {
                let payload = Value::Object(item.json.clone());
                ctx.events.info(format!("  [{}] {}", index, payload));
            }
        }

        Ok(NodeOutput::main(items.clone()).into())
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Log a message and the item count", "debug").once()
    }
}
