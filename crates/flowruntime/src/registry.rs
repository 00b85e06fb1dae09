use flowcore::{GraphError, Node, NodeError, NodeSpec, MAIN_PORT};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create the adapter for one workflow node
    fn create(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Ports and scheduling attributes of this node type
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// When a node with several incoming connections is scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputPolicy {
    /// Run once per upstream completion that satisfies the required ports
    #[default]
    EachArrival,
    /// Run once every incoming connection has settled
    AllSettled,
}

/// How parameters are evaluated against the input items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemMode {
    /// One evaluation per item of the primary input
    #[default]
    PerItem,
    /// A single evaluation for the whole invocation
    Once,
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    /// Can start a run
    pub trigger: bool,
    /// May close a cycle in the graph
    pub loop_controller: bool,
    pub input_policy: InputPolicy,
    pub item_mode: ItemMode,
}

impl NodeMetadata {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PortDefinition>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(PortDefinition::required).collect();
        self
    }

    pub fn trigger(mut self) -> Self {
        self.trigger = true;
        self.inputs.clear();
        self
    }

    pub fn loop_controller(mut self) -> Self {
        self.loop_controller = true;
        self
    }

    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    pub fn once(mut self) -> Self {
        self.item_mode = ItemMode::Once;
        self
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|p| p.name == name)
    }

    /// Port used for item context and pass-through
    pub fn primary_input(&self) -> &str {
        self.inputs.first().map(|p| p.name.as_str()).unwrap_or(MAIN_PORT)
    }

    pub fn primary_output(&self) -> Option<&str> {
        self.outputs.first().map(|p| p.name.as_str())
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: vec![PortDefinition::required(MAIN_PORT)],
            outputs: vec![PortDefinition::required(MAIN_PORT)],
            trigger: false,
            loop_controller: false,
            input_policy: InputPolicy::default(),
            item_mode: ItemMode::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Resolve the adapter and metadata for a workflow node
    pub fn create_node(
        &self,
        spec: &NodeSpec,
    ) -> Result<(Arc<dyn Node>, NodeMetadata), GraphError> {
        let factory = self
            .factories
            .get(&spec.node_type)
            .ok_or_else(|| GraphError::UnknownNodeType {
                node: spec.name.clone(),
                node_type: spec.node_type.clone(),
            })?;

        let node = factory.create(spec).map_err(|e| GraphError::InvalidNode {
            node: spec.name.clone(),
            message: e.to_string(),
        })?;
        Ok((node, factory.metadata()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
