use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;

/// Name of the default input and output port
pub const MAIN_PORT: &str = "main";

/// Complete workflow definition. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Initial value of the run-wide static data
    #[serde(default)]
    pub static_data: Map<String, Value>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            static_data: Map::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> String {
        let name = node.name.clone();
        self.nodes.push(node);
        name
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<String>,
        from_port: impl Into<String>,
        to_node: impl Into<String>,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            source: from_node.into(),
            source_output: from_port.into(),
            target: to_node.into(),
            target_input: Some(to_port.into()),
            input_index: None,
        });
    }

    /// Connect `from`'s main output to `to`'s first input
    pub fn connect_main(&mut self, from_node: impl Into<String>, to_node: impl Into<String>) {
        self.connections.push(Connection::new(from_node, to_node));
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique within the workflow
    pub name: String,
    pub node_type: String,
    /// Raw parameters; strings starting with `=` are expressions
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Credential slot -> credential name
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub continue_on_fail: bool,
    /// Evaluate parameters once for the whole input instead of per item
    #[serde(default)]
    pub execute_once: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.into(),
            parameters: Map::new(),
            credentials: BTreeMap::new(),
            disabled: false,
            continue_on_fail: false,
            execute_once: false,
            retry: None,
            timeout_ms: None,
            position: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_credential(mut self, slot: impl Into<String>, name: impl Into<String>) -> Self {
        self.credentials.insert(slot.into(), name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retry(mut self, retries: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            retries,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn continue_on_fail(mut self) -> Self {
        self.continue_on_fail = true;
        self
    }

    pub fn execute_once(mut self) -> Self {
        self.execute_once = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retry.as_ref().map(|r| r.retries).unwrap_or(0)
    }
}

fn main_port() -> String {
    MAIN_PORT.to_string()
}

/// Data edge between an output port and an input port.
///
/// The target port may be addressed by name, by position (`input_index`), or
/// both; when neither is given the target's first input port is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    #[serde(default = "main_port")]
    pub source_output: String,
    pub target: String,
    #[serde(default)]
    pub target_input: Option<String>,
    #[serde(default)]
    pub input_index: Option<usize>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_output: main_port(),
            target: target.into(),
            target_input: None,
            input_index: None,
        }
    }

    pub fn from_output(mut self, port: impl Into<String>) -> Self {
        self.source_output = port.into();
        self
    }

    pub fn to_input(mut self, port: impl Into<String>) -> Self {
        self.target_input = Some(port.into());
        self
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.input_index = Some(index);
        self
    }
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Retry policy for node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-invocations after the first failed attempt
    pub retries: u32,
    pub delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_ms: 1000,
            backoff_multiplier: 1.0,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Workflow started with the failure context when a run ends in error
    #[serde(default)]
    pub error_workflow: Option<WorkflowId>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
}
