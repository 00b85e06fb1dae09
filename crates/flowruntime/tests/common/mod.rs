// Test-local node types shared by the runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    ExecutionEvent, Item, ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput,
    NodeSpec, WaitRequest,
};
use flowruntime::{
    FlowRuntime, InputPolicy, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition,
    RuntimeConfig,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn items(values: &[Value]) -> ItemSet {
    ItemSet::from_json(values.iter().cloned())
}

/// Add `tag` (if set) to every item of the main input
fn tagged(ctx: &NodeContext) -> ItemSet {
    ctx.main_input()
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut json = item.json.clone();
            if let Some(tag) = ctx.parameters.get(index, "tag") {
                json.insert("tag".to_string(), tag.clone());
            }
            item.derive(index, json)
        })
        .collect()
}

struct TriggerNode;

#[async_trait]
impl Node for TriggerNode {
    fn node_type(&self) -> &str {
        "test.trigger"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutput::main(ctx.main_input().clone()).into())
    }
}

/// Passes items through, optionally tagging them
struct PassNode;

#[async_trait]
impl Node for PassNode {
    fn node_type(&self) -> &str {
        "test.pass"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutput::main(tagged(&ctx)).into())
    }
}

/// Sleeps `ms` (honouring cancellation) then passes items through
struct SleepNode;

#[async_trait]
impl Node for SleepNode {
    fn node_type(&self) -> &str {
        "test.sleep"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let ms = ctx.parameters.get_u64(0, "ms").unwrap_or(0);
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(ms)) => Ok(NodeOutput::main(tagged(&ctx)).into()),
        }
    }
}

/// Fails its first `failures` invocations
struct FlakyNode {
    calls: AtomicU32,
}

#[async_trait]
impl Node for FlakyNode {
    fn node_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let failures = ctx.parameters.get_u64(0, "failures").unwrap_or(0) as u32;
        if call < failures {
            return Err(NodeError::failed(format!("flaky failure {}", call + 1)));
        }
        Ok(NodeOutput::main(tagged(&ctx)).into())
    }
}

struct FailNode;

#[async_trait]
impl Node for FailNode {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let message = ctx.parameters.get_str(0, "message").unwrap_or("boom");
        Err(NodeError::failed(message))
    }
}

struct PanicNode;

#[async_trait]
impl Node for PanicNode {
    fn node_type(&self) -> &str {
        "test.panic"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        panic!("boom");
    }
}

/// Suspends on `path` (default: the run id), optionally expiring after `expires_in_ms`
struct WaitNode;

#[async_trait]
impl Node for WaitNode {
    fn node_type(&self) -> &str {
        "test.wait"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let path = ctx
            .parameters
            .get_str(0, "path")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.run_id.to_string());
        let mut request = WaitRequest::new(path);
        if let Some(ms) = ctx.parameters.get_u64(0, "expires_in_ms") {
            request = request.expires_at(chrono::Utc::now() + chrono::Duration::milliseconds(ms as i64));
        }
        Ok(NodeOutcome::Wait(request))
    }
}

/// Emits `a` followed by `b` once both inputs settled
struct JoinNode;

#[async_trait]
impl Node for JoinNode {
    fn node_type(&self) -> &str {
        "test.join"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let mut out = ctx.input("a").clone();
        out.extend(ctx.input("b").clone());
        Ok(NodeOutput::main(out).into())
    }
}

/// Single input that waits for every connection before running
struct CollectNode;

#[async_trait]
impl Node for CollectNode {
    fn node_type(&self) -> &str {
        "test.collect"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutput::main(ctx.main_input().clone()).into())
    }
}

/// Increments `count` in the run's static data
struct CounterNode;

#[async_trait]
impl Node for CounterNode {
    fn node_type(&self) -> &str {
        "test.counter"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let count = ctx.static_data.get("count").and_then(Value::as_u64).unwrap_or(0) + 1;
        let mut update = serde_json::Map::new();
        update.insert("count".to_string(), json!(count));
        Ok(NodeOutput::main(ctx.main_input().clone())
            .with_static_data(update)
            .into())
    }
}

/// Loop controller: sends its input round the loop `iterations` times, then to `done`
struct LoopNode;

#[async_trait]
impl Node for LoopNode {
    fn node_type(&self) -> &str {
        "test.loop"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let iterations = ctx.parameters.get_u64(0, "iterations").unwrap_or(1);
        let mut state = ctx.state.write().await;
        let round = state.data.get("round").and_then(Value::as_u64).unwrap_or(0);
        let input = ctx.main_input().clone();

        if round >= iterations {
            state.data.clear();
            return Ok(NodeOutput::new()
                .with_port("done", input)
                .with_port("loop", ItemSet::new())
                .into());
        }
        state.data.insert("round".to_string(), json!(round + 1));
        Ok(NodeOutput::new()
            .with_port("done", ItemSet::new())
            .with_port("loop", input)
            .into())
    }
}

/// Runs the workflow named by `workflow_id` with its input
struct CallNode;

#[async_trait]
impl Node for CallNode {
    fn node_type(&self) -> &str {
        "test.call"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let id = ctx
            .parameters
            .get_str(0, "workflow_id")
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| NodeError::invalid_parameter("workflow_id", "not a uuid"))?;
        let output = ctx
            .helpers
            .execute_workflow(id, ctx.main_input().clone())
            .await?;
        Ok(NodeOutput::main(output).into())
    }
}

/// Emits an item carrying the credential bound to slot `api`
struct SecretNode;

#[async_trait]
impl Node for SecretNode {
    fn node_type(&self) -> &str {
        "test.secret"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let secret = ctx.credential("api")?;
        Ok(NodeOutput::main(ItemSet::from(vec![Item::from_json(json!({ "secret": secret }))])).into())
    }
}

struct TestFactory {
    node_type: &'static str,
    metadata: fn() -> NodeMetadata,
    create: fn() -> Arc<dyn Node>,
}

impl NodeFactory for TestFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok((self.create)())
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        (self.metadata)()
    }
}

fn plain() -> NodeMetadata {
    NodeMetadata::new("test node", "test")
}

pub fn test_registry() -> NodeRegistry {
    let factories = [
        TestFactory {
            node_type: "test.trigger",
            metadata: || plain().trigger(),
            create: || Arc::new(TriggerNode),
        },
        TestFactory {
            node_type: "test.pass",
            metadata: plain,
            create: || Arc::new(PassNode),
        },
        TestFactory {
            node_type: "test.sleep",
            metadata: plain,
            create: || Arc::new(SleepNode),
        },
        TestFactory {
            node_type: "test.flaky",
            metadata: plain,
            create: || {
                Arc::new(FlakyNode {
                    calls: AtomicU32::new(0),
                })
            },
        },
        TestFactory {
            node_type: "test.fail",
            metadata: plain,
            create: || Arc::new(FailNode),
        },
        TestFactory {
            node_type: "test.panic",
            metadata: plain,
            create: || Arc::new(PanicNode),
        },
        TestFactory {
            node_type: "test.wait",
            metadata: || plain().once(),
            create: || Arc::new(WaitNode),
        },
        TestFactory {
            node_type: "test.join",
            metadata: || {
                plain()
                    .with_inputs(vec![PortDefinition::optional("a"), PortDefinition::optional("b")])
                    .with_input_policy(InputPolicy::AllSettled)
                    .once()
            },
            create: || Arc::new(JoinNode),
        },
        TestFactory {
            node_type: "test.collect",
            metadata: || plain().with_input_policy(InputPolicy::AllSettled).once(),
            create: || Arc::new(CollectNode),
        },
        TestFactory {
            node_type: "test.counter",
            metadata: || plain().once(),
            create: || Arc::new(CounterNode),
        },
        TestFactory {
            node_type: "test.loop",
            metadata: || plain().with_outputs(["done", "loop"]).loop_controller().once(),
            create: || Arc::new(LoopNode),
        },
        TestFactory {
            node_type: "test.call",
            metadata: || plain().once(),
            create: || Arc::new(CallNode),
        },
        TestFactory {
            node_type: "test.secret",
            metadata: || plain().once(),
            create: || Arc::new(SecretNode),
        },
    ];

    let mut registry = NodeRegistry::new();
    for factory in factories {
        registry.register(Arc::new(factory));
    }
    registry
}

pub fn test_runtime() -> FlowRuntime {
    FlowRuntime::builder().registry(test_registry()).build()
}

pub fn test_runtime_with(config: RuntimeConfig) -> FlowRuntime {
    FlowRuntime::builder()
        .registry(test_registry())
        .config(config)
        .build()
}

/// Every event already sent to `rx`
pub fn drain(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
