use crate::util::truthy;
use async_trait::async_trait;
use flowcore::{ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;

/// Routes each item to `true` or `false`.
///
/// `condition` is evaluated per item. Alternatively `conditions` holds a
/// list combined with `combinator` (`and`, the default, or `or`).
pub struct IfNode;

impl IfNode {
    fn evaluate(ctx: &NodeContext, index: usize) -> Result<bool, NodeError> {
        if let Some(condition) = ctx.parameters.get(index, "condition") {
            return Ok(truthy(condition));
        }
        let Some(Value::Array(conditions)) = ctx.parameters.get(index, "conditions") else {
            return Err(NodeError::invalid_parameter(
                "condition",
                "either 'condition' or 'conditions' is required",
            ));
        };
        match ctx.parameters.get_str(index, "combinator").unwrap_or("and") {
            "and" => Ok(conditions.iter().all(truthy)),
            "or" => Ok(conditions.iter().any(truthy)),
            other => Err(NodeError::invalid_parameter(
                "combinator",
                format!("unknown combinator '{}'", other),
            )),
        }
    }
}

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "flow.if"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let mut matched = ItemSet::new();
        let mut unmatched = ItemSet::new();

        for (index, item) in ctx.main_input().iter().enumerate() {
            let routed = item.derive(index, item.json.clone());
            if Self::evaluate(&ctx, index)? {
                matched.push(routed);
            } else {
                unmatched.push(routed);
            }
        }

        tracing::debug!(
            "{}: {} item(s) true, {} item(s) false",
            ctx.node_name,
            matched.len(),
            unmatched.len()
        );
        Ok(NodeOutput::new()
            .with_port("true", matched)
            .with_port("false", unmatched)
            .into())
    }
}

pub struct IfNodeFactory;

impl NodeFactory for IfNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(IfNode))
    }

    fn node_type(&self) -> &str {
        "flow.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Route items by a condition", "flow").with_outputs(["true", "false"])
    }
}
