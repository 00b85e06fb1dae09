use async_trait::async_trait;
use flowcore::{Item, ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec};
use flowruntime::{InputPolicy, NodeFactory, NodeMetadata, PortDefinition};
use std::sync::Arc;

const INPUT_1: &str = "input1";
const INPUT_2: &str = "input2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    /// Items of `input1` followed by items of `input2`
    Append,
    /// Item `i` of both inputs merged into one, `input2` fields winning
    CombineByPosition,
    /// Only the items of one input
    ChooseBranch,
}

impl MergeMode {
    fn parse(value: &str) -> Result<Self, NodeError> {
        match value {
            "append" => Ok(MergeMode::Append),
            "combineByPosition" => Ok(MergeMode::CombineByPosition),
            "chooseBranch" => Ok(MergeMode::ChooseBranch),
            other => Err(NodeError::invalid_parameter(
                "mode",
                format!("unknown merge mode '{}'", other),
            )),
        }
    }
}

/// Joins two branches. Runs once both inputs have settled; an input whose
/// branch was not taken contributes no items.
pub struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        "flow.merge"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let mode = MergeMode::parse(ctx.parameters.get_str(0, "mode").unwrap_or("append"))?;
        let first = ctx.input(INPUT_1);
        let second = ctx.input(INPUT_2);

        let merged = match mode {
            MergeMode::Append => {
                let mut items = first.clone();
                items.extend(second.clone());
                items
            }
            MergeMode::CombineByPosition => {
                let include_unpaired = ctx
                    .parameters
                    .get_bool(0, "include_unpaired")
                    .unwrap_or(false);
                combine_by_position(first, second, include_unpaired)
            }
            MergeMode::ChooseBranch => match ctx.parameters.get_str(0, "output").unwrap_or(INPUT_1) {
                INPUT_1 => first.clone(),
                INPUT_2 => second.clone(),
                other => {
                    return Err(NodeError::invalid_parameter(
                        "output",
                        format!("unknown input '{}'", other),
                    ))
                }
            },
        };

        Ok(NodeOutput::main(merged).into())
    }
}

fn combine_by_position(first: &ItemSet, second: &ItemSet, include_unpaired: bool) -> ItemSet {
    let paired = first.len().min(second.len());
    let mut out = ItemSet::new();

    for index in 0..paired {
        let (Some(a), Some(b)) = (first.get(index), second.get(index)) else {
            break;
        };
        let mut json = a.json.clone();
        json.extend(b.json.clone());
        let mut item = Item::new(json).paired_with(index, 0).paired_with(index, 1);
        item.binary = a.binary.clone();
        item.binary.extend(b.binary.clone());
        out.push(item);
    }

    if include_unpaired {
        for (input, set) in [(0, first), (1, second)] {
            for (index, item) in set.iter().enumerate().skip(paired) {
                out.push(Item::new(item.json.clone()).paired_with(index, input));
            }
        }
    }
    out
}

pub struct MergeNodeFactory;

impl NodeFactory for MergeNodeFactory {
    fn create(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        if let Some(mode) = spec.parameters.get("mode").and_then(|v| v.as_str()) {
            if !mode.starts_with('=') {
                MergeMode::parse(mode).map_err(|e| NodeError::Configuration(e.to_string()))?;
            }
        }
        Ok(Arc::new(MergeNode))
    }

    fn node_type(&self) -> &str {
        "flow.merge"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Merge the items of two branches", "flow")
            .with_inputs(vec![
                PortDefinition::optional(INPUT_1),
                PortDefinition::optional(INPUT_2),
            ])
            .with_input_policy(InputPolicy::AllSettled)
            .once()
    }
}
