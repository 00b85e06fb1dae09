// crates/flownodes/tests/workflow_test.rs

use flowcore::{
    Connection, FailureKind, ItemSet, NodeSpec, ResumeKey, RunStatus, Workflow,
};
use flownodes::standard_registry;
use flowruntime::{FlowRuntime, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn items(values: &[Value]) -> ItemSet {
    ItemSet::from_json(values.iter().cloned())
}

fn runtime() -> FlowRuntime {
    FlowRuntime::builder().registry(standard_registry()).build()
}

fn manual(name: &str) -> Workflow {
    let mut workflow = Workflow::new(name);
    workflow.add_node(NodeSpec::new("Start", "trigger.manual"));
    workflow
}

#[tokio::test]
async fn test_set_doubles_values() {
    init_tracing();
    let mut workflow = manual("double");
    workflow.add_node(
        NodeSpec::new("Double", "data.set")
            .with_parameter("values", json!({"double": "={{ json.val * 2 }}"})),
    );
    workflow.connect_main("Start", "Double");

    let state = runtime()
        .start_run(&workflow, items(&[json!({"val": 1}), json!({"val": 2})]))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(
        state.output_of("Double", "main").unwrap().json_values(),
        vec![json!({"val": 1, "double": 2}), json!({"val": 2, "double": 4})]
    );
}

fn branching() -> Workflow {
    let mut workflow = manual("branch");
    workflow.add_node(NodeSpec::new("Check", "flow.if").with_parameter("condition", "={{ json.flag }}"));
    workflow.add_node(
        NodeSpec::new("Yes", "data.set").with_parameter("values", json!({"branch": "yes"})),
    );
    workflow.add_node(
        NodeSpec::new("No", "data.set").with_parameter("values", json!({"branch": "no"})),
    );
    workflow.connect_main("Start", "Check");
    workflow
        .connections
        .push(Connection::new("Check", "Yes").from_output("true"));
    workflow
        .connections
        .push(Connection::new("Check", "No").from_output("false"));
    workflow
}

#[tokio::test]
async fn test_if_runs_only_taken_branch() {
    init_tracing();
    let state = runtime()
        .start_run(&branching(), items(&[json!({"flag": true})]))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(
        state.output_of("Yes", "main").unwrap().json_values(),
        vec![json!({"flag": true, "branch": "yes"})]
    );
    assert!(state.node_runs("No").is_empty());
}

#[tokio::test]
async fn test_branches_rejoin_at_merge() {
    init_tracing();
    let mut workflow = branching();
    workflow.add_node(NodeSpec::new("Join", "flow.merge"));
    workflow
        .connections
        .push(Connection::new("Yes", "Join").to_input("input1"));
    workflow
        .connections
        .push(Connection::new("No", "Join").to_input("input2"));
    let runtime = runtime();

    let both = runtime
        .start_run(
            &workflow,
            items(&[json!({"flag": false, "n": 1}), json!({"flag": true, "n": 2})]),
        )
        .await
        .unwrap();
    assert_eq!(both.status, RunStatus::Success);
    assert_eq!(
        both.output_of("Join", "main").unwrap().json_values(),
        vec![
            json!({"flag": true, "n": 2, "branch": "yes"}),
            json!({"flag": false, "n": 1, "branch": "no"}),
        ]
    );
    assert_eq!(both.node_runs("Join").len(), 1);

    // Only one branch taken: the merge still runs with what arrived
    let one = runtime
        .start_run(&workflow, items(&[json!({"flag": true, "n": 3})]))
        .await
        .unwrap();
    assert_eq!(one.status, RunStatus::Success);
    assert!(one.node_runs("No").is_empty());
    assert_eq!(
        one.output_of("Join", "main").unwrap().json_values(),
        vec![json!({"flag": true, "n": 3, "branch": "yes"})]
    );
}

#[tokio::test]
async fn test_approval_wait_and_resume() {
    init_tracing();
    let runtime = runtime();
    let mut workflow = manual("approval");
    workflow.add_node(NodeSpec::new("Approval", "flow.wait").with_parameter("path", "order-17"));
    workflow.add_node(
        NodeSpec::new("Record", "data.set")
            .with_parameter("values", json!({"approved_by": "={{ json.user }}"})),
    );
    workflow.connect_main("Start", "Approval");
    workflow.connect_main("Approval", "Record");

    let state = runtime
        .start_run(&workflow, items(&[json!({"order": 17})]))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Waiting);
    assert!(state.node_runs("Record").is_empty());

    let key = ResumeKey::derive(workflow.id, "Approval", "order-17");
    let done = runtime
        .resume_run(&key, items(&[json!({"user": "dana"})]))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(
        done.output_of("Record", "main").unwrap().json_values(),
        vec![json!({"user": "dana", "approved_by": "dana"})]
    );
}

#[tokio::test]
async fn test_wait_timeout_resumes_with_input() {
    init_tracing();
    let runtime = runtime();
    let mut workflow = manual("timeout");
    workflow.add_node(NodeSpec::new("Approval", "flow.wait").with_parameter("timeout_ms", 1));
    workflow.add_node(NodeSpec::new("After", "flow.noop"));
    workflow.connect_main("Start", "Approval");
    workflow.connect_main("Approval", "After");

    let state = runtime
        .start_run(&workflow, items(&[json!({"order": 3})]))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Waiting);

    let resumed = runtime
        .resume_expired(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, RunStatus::Success);
    assert_eq!(
        resumed[0].output_of("After", "main").unwrap().json_values(),
        vec![json!({"order": 3})]
    );
}

#[tokio::test]
async fn test_split_in_batches_loop() {
    init_tracing();
    let mut workflow = manual("batches");
    workflow.add_node(NodeSpec::new("Loop", "flow.splitInBatches").with_parameter("batch_size", 2));
    workflow.add_node(
        NodeSpec::new("Mark", "data.set")
            .with_parameter("values", json!({"batch": "={{ nodes.Loop.runs }}"})),
    );
    workflow.add_node(NodeSpec::new("Done", "flow.noop"));
    workflow.connect_main("Start", "Loop");
    workflow
        .connections
        .push(Connection::new("Loop", "Mark").from_output("loop"));
    workflow.connect_main("Mark", "Loop");
    workflow
        .connections
        .push(Connection::new("Loop", "Done").from_output("done"));

    let input: Vec<Value> = (1..=5).map(|n| json!({"n": n})).collect();
    let state = runtime().start_run(&workflow, items(&input)).await.unwrap();

    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(state.node_runs("Loop").len(), 4);
    assert_eq!(state.node_runs("Mark").len(), 3);
    assert_eq!(state.node_runs("Done").len(), 1);
    let done = state.output_of("Done", "main").unwrap().json_values();
    let ns: Vec<Value> = done.iter().map(|v| v["n"].clone()).collect();
    assert_eq!(ns, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(done[0]["batch"], json!(1));
    assert_eq!(done[4]["batch"], json!(3));
}

#[tokio::test]
async fn test_stop_and_error_fails_run() {
    init_tracing();
    let mut workflow = manual("stop");
    workflow.add_node(
        NodeSpec::new("Stop", "flow.stopAndError")
            .with_parameter("message", "=Order {{ json.id }} rejected")
            .with_parameter("cause", json!({"reason": "fraud"})),
    );
    workflow.connect_main("Start", "Stop");

    let state = runtime()
        .start_run(&workflow, items(&[json!({"id": 9})]))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Error);
    let error = state.error.unwrap();
    assert_eq!(error.kind, FailureKind::Node);
    assert_eq!(error.node.as_deref(), Some("Stop"));
    assert_eq!(error.message, "Execution failed: Order 9 rejected");
    assert_eq!(error.cause, Some(json!({"reason": "fraud"})));
}

#[tokio::test]
async fn test_execute_workflow_node() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let runtime = FlowRuntime::builder()
        .registry(standard_registry())
        .store(store.clone())
        .build();

    let mut child = Workflow::new("child");
    child.add_node(NodeSpec::new("Start", "trigger.manual"));
    child.add_node(
        NodeSpec::new("Label", "data.set")
            .with_parameter("values", json!({"label": "=item {{ json.n }}"})),
    );
    child.connect_main("Start", "Label");
    store.save_workflow(child.clone()).await;

    let mut parent = manual("parent");
    parent.add_node(
        NodeSpec::new("Call", "flow.executeWorkflow")
            .with_parameter("workflow_id", child.id.to_string())
            .with_parameter("mode", "each"),
    );
    parent.connect_main("Start", "Call");

    let state = runtime
        .start_run(&parent, items(&[json!({"n": 1}), json!({"n": 2})]))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(
        state.output_of("Call", "main").unwrap().json_values(),
        vec![json!({"n": 1, "label": "item 1"}), json!({"n": 2, "label": "item 2"})]
    );
    assert_eq!(store.run_count().await, 3);
}

#[tokio::test]
async fn test_delay_and_debug_pass_through() {
    init_tracing();
    let mut workflow = manual("pass");
    workflow.add_node(NodeSpec::new("Delay", "time.delay").with_parameter("delay_ms", 5));
    workflow.add_node(NodeSpec::new("Log", "debug.log").with_parameter("message", "after delay"));
    workflow.connect_main("Start", "Delay");
    workflow.connect_main("Delay", "Log");

    let state = runtime()
        .start_run(&workflow, items(&[json!({"k": "v"})]))
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(state.final_output().json_values(), vec![json!({"k": "v"})]);
}
