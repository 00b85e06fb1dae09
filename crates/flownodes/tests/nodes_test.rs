// crates/flownodes/tests/nodes_test.rs

use async_trait::async_trait;
use flowcore::{
    EventBus, FlowError, GraphError, ItemSet, Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec,
    NodeState, NoCredentials, Parameters, RunContext, RunId, RuntimeHelpers, WorkflowId,
    WorkflowInvoker,
};
use flownodes::{
    DebugNode, DelayNode, ExecuteWorkflowNode, IfNode, MergeNode, SetNode, SplitInBatchesNode,
    StopAndErrorNode, WaitNode,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Echoes the items it receives, tagging them with the call number
#[derive(Default)]
struct EchoInvoker {
    calls: AtomicUsize,
}

#[async_trait]
impl WorkflowInvoker for EchoInvoker {
    async fn invoke(
        &self,
        _workflow_id: WorkflowId,
        items: ItemSet,
        _caller: &RunContext,
    ) -> Result<ItemSet, FlowError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut json = item.json.clone();
                json.insert("call".to_string(), json!(call));
                item.derive(i, json)
            })
            .collect())
    }
}

fn params(value: Value) -> Parameters {
    match value {
        Value::Object(map) => Parameters::Once(map),
        _ => Parameters::Once(Map::new()),
    }
}

fn items(values: &[Value]) -> ItemSet {
    ItemSet::from_json(values.iter().cloned())
}

fn main_input(values: &[Value]) -> BTreeMap<String, ItemSet> {
    BTreeMap::from([("main".to_string(), items(values))])
}

// Helper function to create a test context
fn create_test_context(
    parameters: Parameters,
    inputs: BTreeMap<String, ItemSet>,
    state: Arc<RwLock<NodeState>>,
    invoker: Arc<dyn WorkflowInvoker>,
) -> NodeContext {
    let event_bus = EventBus::new(100);
    let run_id = RunId::new_v4();
    let workflow_id = WorkflowId::new_v4();
    let run = RunContext {
        run_id,
        workflow_id,
        mode: Default::default(),
        node: Some("Under Test".to_string()),
        depth: 0,
    };

    NodeContext {
        run_id,
        workflow_id,
        node_name: "Under Test".to_string(),
        run_index: 0,
        attempt: 0,
        inputs,
        parameters,
        static_data: Map::new(),
        state,
        events: event_bus.create_emitter(run_id, "Under Test"),
        cancellation: tokio_util::sync::CancellationToken::new(),
        helpers: RuntimeHelpers::new(run, BTreeMap::new(), Arc::new(NoCredentials), invoker),
    }
}

fn context(parameters: Parameters, inputs: BTreeMap<String, ItemSet>) -> NodeContext {
    create_test_context(
        parameters,
        inputs,
        Arc::new(RwLock::new(NodeState::default())),
        Arc::new(EchoInvoker::default()),
    )
}

fn output(outcome: NodeOutcome) -> NodeOutput {
    match outcome {
        NodeOutcome::Output(output) => output,
        NodeOutcome::Wait(request) => panic!("unexpected wait on {}", request.correlation),
    }
}

fn port(output: &NodeOutput, name: &str) -> Vec<Value> {
    output.ports.get(name).map(ItemSet::json_values).unwrap_or_default()
}

#[tokio::test]
async fn test_if_routes_items_per_condition() {
    let per_item = Parameters::PerItem(vec![
        Map::from_iter([("condition".to_string(), json!(true))]),
        Map::from_iter([("condition".to_string(), json!(false))]),
        Map::from_iter([("condition".to_string(), json!("yes"))]),
    ]);
    let ctx = context(per_item, main_input(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]));

    let out = output(IfNode.execute(ctx).await.unwrap());

    assert_eq!(port(&out, "true"), vec![json!({"n": 1}), json!({"n": 3})]);
    assert_eq!(port(&out, "false"), vec![json!({"n": 2})]);
    let routed = &out.ports["true"];
    assert_eq!(routed.get(1).unwrap().paired_item[0].item, 2);
}

#[tokio::test]
async fn test_if_combines_condition_lists() {
    let any = params(json!({"conditions": [false, 1], "combinator": "or"}));
    let out = output(IfNode.execute(context(any, main_input(&[json!({})]))).await.unwrap());
    assert_eq!(port(&out, "true").len(), 1);

    let all = params(json!({"conditions": [true, 0]}));
    let out = output(IfNode.execute(context(all, main_input(&[json!({})]))).await.unwrap());
    assert_eq!(port(&out, "false").len(), 1);

    let missing = context(params(json!({})), main_input(&[json!({})]));
    assert!(matches!(
        IfNode.execute(missing).await,
        Err(NodeError::InvalidParameter { .. })
    ));
}

#[tokio::test]
async fn test_set_writes_dotted_paths() {
    let per_item = params(json!({"values": {"customer.tier": "gold", "total": 30}}));
    let ctx = context(per_item, main_input(&[json!({"id": 7, "customer": {"name": "Ada"}})]));

    let out = output(SetNode.execute(ctx).await.unwrap());
    assert_eq!(
        port(&out, "main"),
        vec![json!({"id": 7, "customer": {"name": "Ada", "tier": "gold"}, "total": 30})]
    );

    let keep_only = params(json!({"values": {"total": 30}, "keep_only_set": true}));
    let ctx = context(keep_only, main_input(&[json!({"id": 7})]));
    let out = output(SetNode.execute(ctx).await.unwrap());
    assert_eq!(port(&out, "main"), vec![json!({"total": 30})]);
}

#[tokio::test]
async fn test_set_without_input_builds_one_item() {
    let ctx = context(params(json!({"values": {"status": "ok"}})), BTreeMap::new());
    let out = output(SetNode.execute(ctx).await.unwrap());
    assert_eq!(port(&out, "main"), vec![json!({"status": "ok"})]);
}

#[test]
fn test_set_factory_rejects_non_object_values() {
    let spec = NodeSpec::new("Set", "data.set").with_parameter("values", 5);
    assert!(matches!(
        flownodes::standard_registry().create_node(&spec),
        Err(GraphError::InvalidNode { .. })
    ));
}

fn two_inputs(first: &[Value], second: &[Value]) -> BTreeMap<String, ItemSet> {
    BTreeMap::from([
        ("input1".to_string(), items(first)),
        ("input2".to_string(), items(second)),
    ])
}

#[tokio::test]
async fn test_merge_append() {
    let ctx = context(
        params(json!({})),
        two_inputs(&[json!({"a": 1})], &[json!({"b": 1}), json!({"b": 2})]),
    );
    let out = output(MergeNode.execute(ctx).await.unwrap());
    assert_eq!(
        port(&out, "main"),
        vec![json!({"a": 1}), json!({"b": 1}), json!({"b": 2})]
    );
}

#[tokio::test]
async fn test_merge_combine_by_position() {
    let inputs = two_inputs(
        &[json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})],
        &[json!({"name": "A", "score": 9})],
    );

    let ctx = context(params(json!({"mode": "combineByPosition"})), inputs.clone());
    let out = output(MergeNode.execute(ctx).await.unwrap());
    assert_eq!(port(&out, "main"), vec![json!({"id": 1, "name": "A", "score": 9})]);
    assert_eq!(out.ports["main"].get(0).unwrap().paired_item.len(), 2);

    let ctx = context(
        params(json!({"mode": "combineByPosition", "include_unpaired": true})),
        inputs,
    );
    let out = output(MergeNode.execute(ctx).await.unwrap());
    assert_eq!(
        port(&out, "main"),
        vec![json!({"id": 1, "name": "A", "score": 9}), json!({"id": 2, "name": "b"})]
    );
}

#[tokio::test]
async fn test_merge_choose_branch() {
    let ctx = context(
        params(json!({"mode": "chooseBranch", "output": "input2"})),
        two_inputs(&[json!({"a": 1})], &[json!({"b": 1})]),
    );
    let out = output(MergeNode.execute(ctx).await.unwrap());
    assert_eq!(port(&out, "main"), vec![json!({"b": 1})]);
}

#[test]
fn test_merge_factory_rejects_unknown_mode() {
    let spec = NodeSpec::new("Merge", "flow.merge").with_parameter("mode", "zip");
    assert!(matches!(
        flownodes::standard_registry().create_node(&spec),
        Err(GraphError::InvalidNode { .. })
    ));
    // Expressions are only checked at run time
    let spec = NodeSpec::new("Merge", "flow.merge").with_parameter("mode", "={{ json.mode }}");
    assert!(flownodes::standard_registry().create_node(&spec).is_ok());
}

#[tokio::test]
async fn test_split_in_batches_walks_all_items() {
    let state = Arc::new(RwLock::new(NodeState::default()));
    let invoker: Arc<dyn WorkflowInvoker> = Arc::new(EchoInvoker::default());
    let batch = params(json!({"batch_size": 2}));
    let all: Vec<Value> = (1..=5).map(|n| json!({"n": n})).collect();

    let step = |inputs: BTreeMap<String, ItemSet>| {
        create_test_context(batch.clone(), inputs, state.clone(), invoker.clone())
    };

    let first = output(SplitInBatchesNode.execute(step(main_input(&all))).await.unwrap());
    assert_eq!(port(&first, "loop"), all[0..2].to_vec());
    assert!(port(&first, "done").is_empty());

    let second = output(SplitInBatchesNode.execute(step(main_input(&all[0..2]))).await.unwrap());
    assert_eq!(port(&second, "loop"), all[2..4].to_vec());

    let third = output(SplitInBatchesNode.execute(step(main_input(&all[2..4]))).await.unwrap());
    assert_eq!(port(&third, "loop"), all[4..5].to_vec());

    let last = output(SplitInBatchesNode.execute(step(main_input(&all[4..5]))).await.unwrap());
    assert!(port(&last, "loop").is_empty());
    assert_eq!(port(&last, "done"), all);
    assert!(state.read().await.data.is_empty(), "loop state cleared");
}

#[tokio::test]
async fn test_stop_and_error_carries_cause() {
    let ctx = context(
        params(json!({"message": "Order rejected", "cause": {"code": 42}})),
        main_input(&[json!({})]),
    );
    match StopAndErrorNode.execute(ctx).await {
        Err(err) => {
            assert_eq!(err.to_string(), "Execution failed: Order rejected");
            assert_eq!(err.cause(), Some(&json!({"code": 42})));
        }
        Ok(_) => panic!("stop node must fail"),
    }

    let ctx = context(params(json!({})), main_input(&[json!({})]));
    let err = StopAndErrorNode.execute(ctx).await.err().unwrap();
    assert_eq!(err.to_string(), "Execution failed: Workflow stopped");
}

#[tokio::test]
async fn test_wait_webhook_requests_suspension() {
    let ctx = context(params(json!({"path": "approve"})), main_input(&[json!({})]));
    match WaitNode.execute(ctx).await.unwrap() {
        NodeOutcome::Wait(request) => {
            assert_eq!(request.correlation, "approve");
            assert!(request.expires_at.is_none());
        }
        NodeOutcome::Output(_) => panic!("expected a wait request"),
    }

    let ctx = context(params(json!({"timeout_ms": 60_000})), main_input(&[json!({})]));
    let run_id = ctx.run_id;
    match WaitNode.execute(ctx).await.unwrap() {
        NodeOutcome::Wait(request) => {
            assert_eq!(request.correlation, run_id.to_string());
            assert!(request.expires_at.is_some());
        }
        NodeOutcome::Output(_) => panic!("expected a wait request"),
    }
}

#[tokio::test]
async fn test_wait_time_interval() {
    let short = context(
        params(json!({"resume": "timeInterval", "amount_ms": 5})),
        main_input(&[json!({"n": 1})]),
    );
    let out = output(WaitNode.execute(short).await.unwrap());
    assert_eq!(port(&out, "main"), vec![json!({"n": 1})]);

    let long = context(
        params(json!({"resume": "timeInterval", "amount_ms": 3_600_000})),
        main_input(&[json!({})]),
    );
    let run_id = long.run_id;
    match WaitNode.execute(long).await.unwrap() {
        NodeOutcome::Wait(request) => {
            assert_eq!(request.correlation, format!("timer/{}", run_id));
            assert!(request.expires_at.is_some());
        }
        NodeOutcome::Output(_) => panic!("long intervals suspend the run"),
    }

    let missing = context(params(json!({"resume": "timeInterval"})), main_input(&[json!({})]));
    assert!(WaitNode.execute(missing).await.is_err());
}

#[tokio::test]
async fn test_wait_rejects_out_of_range_durations() {
    let cases = [
        (json!({"timeout_ms": u64::MAX}), "timeout_ms"),
        (json!({"timeout_ms": i64::MAX}), "timeout_ms"),
        (json!({"resume": "timeInterval", "amount_ms": u64::MAX}), "amount_ms"),
        (json!({"resume": "timeInterval", "amount_ms": i64::MAX}), "amount_ms"),
    ];
    for (parameters, expected) in cases {
        let ctx = context(params(parameters), main_input(&[json!({})]));
        match WaitNode.execute(ctx).await {
            Err(NodeError::InvalidParameter { name, .. }) => assert_eq!(name, expected),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("{} should be rejected", expected),
        }
    }
}

#[tokio::test]
async fn test_execute_workflow_each_item() {
    let invoker = Arc::new(EchoInvoker::default());
    let workflow_id = WorkflowId::new_v4().to_string();
    let ctx = create_test_context(
        params(json!({"workflow_id": workflow_id, "mode": "each"})),
        main_input(&[json!({"n": 1}), json!({"n": 2})]),
        Arc::new(RwLock::new(NodeState::default())),
        invoker.clone(),
    );

    let out = output(ExecuteWorkflowNode.execute(ctx).await.unwrap());
    assert_eq!(
        port(&out, "main"),
        vec![json!({"n": 1, "call": 0}), json!({"n": 2, "call": 1})]
    );
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

    let bad = context(params(json!({"workflow_id": "not-a-uuid"})), main_input(&[json!({})]));
    assert!(matches!(
        ExecuteWorkflowNode.execute(bad).await,
        Err(NodeError::InvalidParameter { .. })
    ));
}

#[tokio::test]
async fn test_debug_and_delay_pass_items_through() {
    let input = [json!({"n": 1}), json!({"n": 2})];

    let ctx = context(params(json!({"message": "checkpoint"})), main_input(&input));
    let out = output(DebugNode.execute(ctx).await.unwrap());
    assert_eq!(port(&out, "main"), input.to_vec());

    let ctx = context(params(json!({"delay_ms": 10})), main_input(&input));
    let started = std::time::Instant::now();
    let out = output(DelayNode.execute(ctx).await.unwrap());
    assert!(started.elapsed().as_millis() >= 10);
    assert_eq!(port(&out, "main"), input.to_vec());
}

#[test]
fn test_standard_registry_lists_every_node() {
    let registry = flownodes::standard_registry();
    for node_type in [
        "trigger.manual",
        "trigger.webhook",
        "trigger.error",
        "flow.noop",
        "data.set",
        "flow.if",
        "flow.merge",
        "flow.wait",
        "flow.executeWorkflow",
        "flow.splitInBatches",
        "flow.stopAndError",
        "debug.log",
        "time.delay",
    ] {
        assert!(registry.contains(node_type), "{} missing", node_type);
    }

    let batches = registry.get_metadata("flow.splitInBatches").unwrap();
    assert!(batches.loop_controller);
    assert!(batches.has_output("done") && batches.has_output("loop"));
}

#[tokio::test]
async fn test_delay_stops_on_cancellation() {
    let ctx = context(params(json!({"delay_ms": 60_000})), main_input(&[json!({})]));
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
    });

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), DelayNode.execute(ctx))
        .await
        .expect("delay returns once cancelled");
    assert!(matches!(result, Err(NodeError::Cancelled)));
}
