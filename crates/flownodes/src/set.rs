use crate::util::set_path;
use async_trait::async_trait;
use flowcore::{Item, ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Sets fields on every item.
///
/// Parameters:
/// - `values`: object of dotted field path -> value, usually expressions
/// - `keep_only_set`: drop the fields the item already had
pub struct SetNode;

#[async_trait]
impl Node for SetNode {
    fn node_type(&self) -> &str {
        "data.set"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let input = ctx.main_input();
        let mut output = ItemSet::new();

        for (index, item) in input.iter().enumerate() {
            let keep_only_set = ctx
                .parameters
                .get_bool(index, "keep_only_set")
                .unwrap_or(false);
            let values = match ctx.parameters.get(index, "values") {
                Some(Value::Object(values)) => values.clone(),
                Some(_) => {
                    return Err(NodeError::invalid_parameter("values", "expected an object"))
                }
                None => Map::new(),
            };

            let mut json = if keep_only_set {
                Map::new()
            } else {
                item.json.clone()
            };
            for (path, value) in values {
                set_path(&mut json, &path, value);
            }
            output.push(item.derive(index, json));
        }

        if input.is_empty() {
            // Nothing to derive from: emit one item built from the values alone
            if let Some(Value::Object(values)) = ctx.parameters.get(0, "values") {
                let mut json = Map::new();
                for (path, value) in values {
                    set_path(&mut json, path, value.clone());
                }
                output.push(Item::new(json));
            }
        }

        Ok(NodeOutput::main(output).into())
    }
}

pub struct SetNodeFactory;

impl NodeFactory for SetNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        match spec.parameters.get("values") {
            None | Some(Value::Object(_)) => Ok(Arc::new(SetNode)),
            Some(Value::String(s)) if s.starts_with('=') => Ok(Arc::new(SetNode)),
            Some(_) => Err(NodeError::Configuration(
                "'values' must be an object".to_string(),
            )),
        }
    }

    fn node_type(&self) -> &str {
        "data.set"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Set fields on each item", "data")
    }
}
