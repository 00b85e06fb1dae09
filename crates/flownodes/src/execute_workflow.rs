use async_trait::async_trait;
use flowcore::{ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Runs another workflow with this node's input and emits its final output.
///
/// With `mode: each` every input item starts its own sub-run and the
/// outputs are concatenated in input order.
pub struct ExecuteWorkflowNode;

#[async_trait]
impl Node for ExecuteWorkflowNode {
    fn node_type(&self) -> &str {
        "flow.executeWorkflow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let raw_id = ctx
            .parameters
            .get_str(0, "workflow_id")
            .ok_or_else(|| NodeError::invalid_parameter("workflow_id", "required"))?;
        let workflow_id = Uuid::parse_str(raw_id)
            .map_err(|e| NodeError::invalid_parameter("workflow_id", e.to_string()))?;
        let input = ctx.main_input().clone();

        let output = match ctx.parameters.get_str(0, "mode").unwrap_or("once") {
            "once" => ctx.helpers.execute_workflow(workflow_id, input).await?,
            "each" => {
                let mut output = ItemSet::new();
                for item in input {
                    let items = ItemSet::from(vec![item]);
                    output.extend(ctx.helpers.execute_workflow(workflow_id, items).await?);
                }
                output
            }
            other => {
                return Err(NodeError::invalid_parameter(
                    "mode",
                    format!("unknown mode '{}'", other),
                ))
            }
        };

        ctx.events
            .info(format!("Sub-workflow returned {} item(s)", output.len()));
        Ok(NodeOutput::main(output).into())
    }
}

pub struct ExecuteWorkflowNodeFactory;

impl NodeFactory for ExecuteWorkflowNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        match spec.parameters.get("workflow_id") {
            Some(Value::String(_)) => Ok(Arc::new(ExecuteWorkflowNode)),
            _ => Err(NodeError::Configuration(
                "'workflow_id' is required".to_string(),
            )),
        }
    }

    fn node_type(&self) -> &str {
        "flow.executeWorkflow"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Run another workflow", "flow").once()
    }
}
