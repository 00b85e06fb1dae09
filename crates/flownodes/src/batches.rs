use async_trait::async_trait;
use flowcore::{Item, ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;

const DONE: &str = "done";
const LOOP: &str = "loop";
const REMAINING: &str = "remaining";
const PROCESSED: &str = "processed";

/// Loop controller: emits its input in batches of `batch_size` on `loop`.
/// Items that come back through the loop are collected and emitted on
/// `done` once every batch went through.
pub struct SplitInBatchesNode;

fn to_items(value: Option<&Value>) -> Result<Vec<Item>, NodeError> {
    match value {
        None => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| NodeError::failed(format!("Corrupt loop state: {}", e))),
    }
}

fn to_value(items: &[Item]) -> Result<Value, NodeError> {
    serde_json::to_value(items).map_err(|e| NodeError::failed(format!("Cannot store loop state: {}", e)))
}

#[async_trait]
impl Node for SplitInBatchesNode {
    fn node_type(&self) -> &str {
        "flow.splitInBatches"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let batch_size = ctx.parameters.get_u64(0, "batch_size").unwrap_or(10).max(1) as usize;
        let input = ctx.main_input().clone();
        let mut state = ctx.state.write().await;

        let in_progress = state.data.contains_key(REMAINING);
        let (mut remaining, mut processed) = if in_progress {
            let processed = to_items(state.data.get(PROCESSED))?;
            (to_items(state.data.get(REMAINING))?, processed)
        } else {
            (input.clone().into_items(), Vec::new())
        };
        if in_progress {
            processed.extend(input.into_items());
        }

        if remaining.is_empty() {
            state.data.clear();
            tracing::debug!("{}: loop finished with {} item(s)", ctx.node_name, processed.len());
            return Ok(NodeOutput::new()
                .with_port(DONE, ItemSet::from(processed))
                .with_port(LOOP, ItemSet::new())
                .into());
        }

        let rest = remaining.split_off(batch_size.min(remaining.len()));
        let batch = remaining;
        state.data.insert(REMAINING.to_string(), to_value(&rest)?);
        state.data.insert(PROCESSED.to_string(), to_value(&processed)?);

        ctx.events.info(format!(
            "Emitting batch of {} item(s), {} left",
            batch.len(),
            rest.len()
        ));
        Ok(NodeOutput::new()
            .with_port(DONE, ItemSet::new())
            .with_port(LOOP, ItemSet::from(batch))
            .into())
    }
}

pub struct SplitInBatchesNodeFactory;

impl NodeFactory for SplitInBatchesNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(SplitInBatchesNode))
    }

    fn node_type(&self) -> &str {
        "flow.splitInBatches"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Loop over items in batches", "flow")
            .with_outputs([DONE, LOOP])
            .loop_controller()
            .once()
    }
}
