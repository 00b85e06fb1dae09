use crate::credentials::CredentialProvider;
use crate::events::EventEmitter;
use crate::item::ItemSet;
use crate::run::{RunContext, RunId};
use crate::workflow::{WorkflowId, MAIN_PORT};
use crate::{FlowError, NodeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "flow.if", "data.set")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError>;
}

/// Runs a referenced workflow to completion on behalf of a node
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    async fn invoke(
        &self,
        workflow_id: WorkflowId,
        items: ItemSet,
        caller: &RunContext,
    ) -> Result<ItemSet, FlowError>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub node_name: String,

    /// How many times this node already ran in this run
    pub run_index: usize,

    /// Zero-based attempt number (> 0 on retries)
    pub attempt: u32,

    /// Input item sets keyed by input port
    pub inputs: BTreeMap<String, ItemSet>,

    /// Parameters with expressions already resolved
    pub parameters: Parameters,

    /// Read-only snapshot of the run's static data
    pub static_data: Map<String, Value>,

    /// Persistent state (survives across executions of this node in the same run)
    pub state: Arc<RwLock<NodeState>>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token of the run; signalled between scheduling steps
    pub cancellation: tokio_util::sync::CancellationToken,

    pub helpers: RuntimeHelpers,
}

impl NodeContext {
    /// Items on `port`, or an empty set
    pub fn input(&self, port: &str) -> &ItemSet {
        static EMPTY: ItemSet = ItemSet::new();
        self.inputs.get(port).unwrap_or(&EMPTY)
    }

    /// Items on the `main` port, falling back to the first port present
    pub fn main_input(&self) -> &ItemSet {
        if let Some(items) = self.inputs.get(MAIN_PORT) {
            return items;
        }
        self.inputs
            .values()
            .next()
            .unwrap_or_else(|| self.input(MAIN_PORT))
    }

    /// Get required non-empty input or return error
    pub fn require_input(&self, port: &str) -> Result<&ItemSet, NodeError> {
        self.inputs
            .get(port)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| NodeError::MissingInput(port.to_string()))
    }

    /// Credential bound to `slot` on this node
    pub fn credential(&self, slot: &str) -> Result<Value, NodeError> {
        self.helpers.credential(slot)
    }
}

/// Persistent state for a node instance
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub data: Map<String, Value>,
}

/// Resolved node parameters.
///
/// `PerItem` holds one evaluation per primary input item; `Once` holds a
/// single evaluation shared by every item.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameters {
    Once(Map<String, Value>),
    PerItem(Vec<Map<String, Value>>),
}

impl Parameters {
    pub fn item(&self, index: usize) -> Option<&Map<String, Value>> {
        match self {
            Parameters::Once(map) => Some(map),
            Parameters::PerItem(items) => items.get(index),
        }
    }

    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.item(index).and_then(|p| p.get(name))
    }

    pub fn get_str(&self, index: usize, name: &str) -> Option<&str> {
        self.get(index, name).and_then(Value::as_str)
    }

    pub fn get_u64(&self, index: usize, name: &str) -> Option<u64> {
        self.get(index, name).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, index: usize, name: &str) -> Option<bool> {
        self.get(index, name).and_then(Value::as_bool)
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&Value, NodeError> {
        self.get(index, name)
            .ok_or_else(|| NodeError::invalid_parameter(name, "missing"))
    }

    /// The single shared evaluation, or the first item's
    pub fn shared(&self) -> Option<&Map<String, Value>> {
        self.item(0)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Items per output port
    pub ports: BTreeMap<String, ItemSet>,

    /// Keys merged into the run's static data
    pub static_data: Option<Map<String, Value>>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main(items: ItemSet) -> Self {
        Self::new().with_port(MAIN_PORT, items)
    }

    pub fn with_port(mut self, port: impl Into<String>, items: ItemSet) -> Self {
        self.ports.insert(port.into(), items);
        self
    }

    pub fn with_static_data(mut self, data: Map<String, Value>) -> Self {
        self.static_data = Some(data);
        self
    }
}

/// Request to suspend the run until an external event arrives
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRequest {
    /// Caller-supplied correlation value, e.g. a webhook path
    pub correlation: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl WaitRequest {
    pub fn new(correlation: impl Into<String>) -> Self {
        Self {
            correlation: correlation.into(),
            expires_at: None,
        }
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Output(NodeOutput),
    Wait(WaitRequest),
}

impl From<NodeOutput> for NodeOutcome {
    fn from(output: NodeOutput) -> Self {
        NodeOutcome::Output(output)
    }
}

/// Engine services available to a running node
#[derive(Clone)]
pub struct RuntimeHelpers {
    run: RunContext,
    credential_names: BTreeMap<String, String>,
    credentials: Arc<dyn CredentialProvider>,
    invoker: Arc<dyn WorkflowInvoker>,
}

impl RuntimeHelpers {
    pub fn new(
        run: RunContext,
        credential_names: BTreeMap<String, String>,
        credentials: Arc<dyn CredentialProvider>,
        invoker: Arc<dyn WorkflowInvoker>,
    ) -> Self {
        Self {
            run,
            credential_names,
            credentials,
            invoker,
        }
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// Look up the credential bound to `slot`. Secrets are fetched on
    /// demand and never stored with the run.
    pub fn credential(&self, slot: &str) -> Result<Value, NodeError> {
        let name = self
            .credential_names
            .get(slot)
            .ok_or_else(|| NodeError::CredentialNotFound {
                name: slot.to_string(),
            })?;
        self.credentials
            .resolve_credential(name, &self.run)
            .map_err(|_| NodeError::CredentialNotFound { name: name.clone() })
    }

    /// Run another workflow to a terminal state and return its final output
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        items: ItemSet,
    ) -> Result<ItemSet, NodeError> {
        self.invoker
            .invoke(workflow_id, items, &self.run)
            .await
            .map_err(|e| match e {
                FlowError::MaxSubWorkflowDepthExceeded { max } => {
                    NodeError::SubWorkflowDepthExceeded { max }
                }
                other => NodeError::SubWorkflowFailed {
                    message: other.to_string(),
                },
            })
    }
}
