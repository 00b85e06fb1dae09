//! Data-driven run scheduler.
//!
//! One scheduler instance owns one run's [`RunState`] while it is `running`.
//! Nodes are queued when their input slots satisfy the node type's input
//! policy, launched onto the tokio runtime up to `max_parallel_nodes` at a
//! time, and their per-port outputs are delivered along outgoing connections
//! in declaration order. Retries are timers of their own and never block
//! other runnable nodes.

use crate::expression::ExpressionContext;
use crate::graph::ExecutionGraph;
use crate::registry::ItemMode;
use crate::runtime::EngineShared;
use crate::subworkflow::{run_error_workflow, SubWorkflowInvoker};
use chrono::{DateTime, Utc};
use flowcore::{
    Continuation, ExecutionEvent, ExecutionFailure, ExpressionError, FailureKind, FlowError,
    InputSlot, Item, ItemSet, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeRunRecord,
    NodeRunStatus, NodeState, Parameters, ResumeKey, RunContext, RunState, RunStatus,
    RuntimeHelpers, WaitRequest, WaitState, WorkflowInvoker,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// A node invocation waiting for a free execution slot
struct ReadyNode {
    node: usize,
    inputs: BTreeMap<String, ItemSet>,
    /// Zero-based attempt number
    attempt: u32,
    attempt_errors: Vec<String>,
    started_at: DateTime<Utc>,
}

impl ReadyNode {
    fn new(node: usize, inputs: BTreeMap<String, ItemSet>) -> Self {
        Self {
            node,
            inputs,
            attempt: 0,
            attempt_errors: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct Failure {
    kind: FailureKind,
    message: String,
    cause: Option<Value>,
}

impl Failure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }
}

impl From<NodeError> for Failure {
    fn from(err: NodeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            cause: err.cause().cloned(),
        }
    }
}

struct Completion {
    ready: ReadyNode,
    result: Result<NodeOutcome, Failure>,
    node_state: Map<String, Value>,
    duration_ms: u64,
}

enum Event {
    Finished(Result<Completion, JoinError>),
    RetryDue(ReadyNode),
    Cancelled,
}

pub(crate) struct RunScheduler {
    shared: Arc<EngineShared>,
    graph: Arc<ExecutionGraph>,
    state: RunState,
    run_context: RunContext,
    invoker: Arc<dyn WorkflowInvoker>,
    cancel: CancellationToken,
    /// One slot per incoming connection, per node
    buffers: Vec<Vec<InputSlot>>,
    queue: VecDeque<ReadyNode>,
    running: FuturesUnordered<JoinHandle<Completion>>,
    retries: FuturesUnordered<BoxFuture<'static, ReadyNode>>,
    in_flight: HashSet<usize>,
    resumed_from: Option<String>,
    halted: bool,
    cancelled: bool,
}

impl RunScheduler {
    fn new(
        shared: Arc<EngineShared>,
        graph: Arc<ExecutionGraph>,
        state: RunState,
        cancel: CancellationToken,
        depth: usize,
    ) -> Self {
        let buffers = graph
            .nodes()
            .iter()
            .map(|n| vec![InputSlot::Pending; n.slot_count()])
            .collect();
        let run_context = RunContext {
            run_id: state.run_id,
            workflow_id: state.workflow_id,
            mode: state.mode,
            node: None,
            depth,
        };
        let invoker: Arc<dyn WorkflowInvoker> =
            Arc::new(SubWorkflowInvoker::new(shared.clone(), cancel.clone()));

        Self {
            shared,
            graph,
            state,
            run_context,
            invoker,
            cancel,
            buffers,
            queue: VecDeque::new(),
            running: FuturesUnordered::new(),
            retries: FuturesUnordered::new(),
            in_flight: HashSet::new(),
            resumed_from: None,
            halted: false,
            cancelled: false,
        }
    }

    /// Scheduler for a fresh run whose trigger items feed `start`
    pub(crate) fn start(
        shared: Arc<EngineShared>,
        graph: Arc<ExecutionGraph>,
        state: RunState,
        start: usize,
        items: ItemSet,
        cancel: CancellationToken,
        depth: usize,
    ) -> Self {
        let mut scheduler = Self::new(shared, graph, state, cancel, depth);
        let port = scheduler
            .graph
            .node(start)
            .metadata
            .primary_input()
            .to_string();
        scheduler
            .queue
            .push_back(ReadyNode::new(start, BTreeMap::from([(port, items)])));
        scheduler
    }

    /// Scheduler continuing a claimed waiting run. `items` become the output
    /// of the node that requested the wait.
    pub(crate) fn resume(
        shared: Arc<EngineShared>,
        graph: Arc<ExecutionGraph>,
        mut state: RunState,
        key: &ResumeKey,
        items: ItemSet,
        cancel: CancellationToken,
    ) -> Result<Self, FlowError> {
        let position = state
            .waiting
            .iter()
            .position(|w| &w.resume_key == key)
            .ok_or_else(|| FlowError::ResumeKeyNotFound { key: key.clone() })?;
        let wait = state.waiting.remove(position);
        let node = graph.index_of(&wait.node).ok_or_else(|| {
            FlowError::Execution(format!("Waiting node '{}' is not in the workflow", wait.node))
        })?;
        let continuation = state.continuation.take();

        let mut scheduler = Self::new(shared, graph, state, cancel, 0);
        if let Some(continuation) = continuation {
            scheduler.restore_buffers(continuation.buffers);
        }

        let outputs = scheduler.complete_outputs(
            node,
            scheduler
                .graph
                .node(node)
                .metadata
                .primary_output()
                .map(|port| BTreeMap::from([(port.to_string(), items)]))
                .unwrap_or_default(),
        );
        if let Some(record) = scheduler
            .state
            .run_data
            .get_mut(&wait.node)
            .and_then(|runs| runs.iter_mut().rev().find(|r| r.status == NodeRunStatus::Waiting))
        {
            record.status = NodeRunStatus::Success;
            record.outputs = outputs.clone();
            record.finished_at = Some(Utc::now());
        }
        scheduler.state.last_node_executed = Some(wait.node.clone());
        scheduler.resumed_from = Some(wait.node);
        scheduler.deliver(node, &outputs);
        Ok(scheduler)
    }

    /// Drive the run until it is terminal or waiting
    pub(crate) fn run(self) -> BoxFuture<'static, Result<RunState, FlowError>> {
        self.drive().boxed()
    }

    async fn drive(mut self) -> Result<RunState, FlowError> {
        self.begin().await?;

        loop {
            self.launch_ready();

            if self.running.is_empty() && self.retries.is_empty() {
                if self.halted || self.cancelled {
                    break;
                }
                if !self.queue.is_empty() || self.quiesce() {
                    continue;
                }
                break;
            }

            let cancel = self.cancel.clone();
            let event = tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => Event::Cancelled,
                Some(joined) = self.running.next() => Event::Finished(joined),
                Some(ready) = self.retries.next() => Event::RetryDue(ready),
                else => continue,
            };

            match event {
                Event::Cancelled => self.on_cancel(),
                Event::RetryDue(ready) => self.queue.push_back(ready),
                Event::Finished(joined) => {
                    let completion = joined
                        .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?;
                    self.on_completion(completion).await;
                }
            }
        }

        self.finish().await
    }

    async fn begin(&mut self) -> Result<(), FlowError> {
        let now = Utc::now();
        self.state.status = RunStatus::Running;
        self.state.started_at.get_or_insert(now);
        self.shared.runs.save_run_state(&self.state).await?;

        match &self.resumed_from {
            Some(node) => {
                tracing::info!("Resuming run {} from node {}", self.state.run_id, node);
                self.shared.events.emit(ExecutionEvent::RunResumed {
                    run_id: self.state.run_id,
                    node: node.clone(),
                    timestamp: now,
                });
            }
            None => {
                tracing::info!(
                    "Starting run {} of workflow {} ({:?})",
                    self.state.run_id,
                    self.state.workflow_id,
                    self.state.mode
                );
                self.shared.events.emit(ExecutionEvent::RunStarted {
                    run_id: self.state.run_id,
                    workflow_id: self.state.workflow_id,
                    mode: self.state.mode,
                    timestamp: now,
                });
            }
        }
        Ok(())
    }

    fn launch_ready(&mut self) {
        let limit = self.shared.config.max_parallel_nodes.max(1);
        while !self.halted && !self.cancelled && self.running.len() < limit {
            if self.cancel.is_cancelled() {
                self.on_cancel();
                break;
            }
            // A node never runs concurrently with itself
            let Some(position) = self
                .queue
                .iter()
                .position(|r| !self.in_flight.contains(&r.node))
            else {
                break;
            };
            let Some(ready) = self.queue.remove(position) else {
                break;
            };
            self.launch(ready);
        }
    }

    fn launch(&mut self, ready: ReadyNode) {
        let graph = self.graph.clone();
        let node = graph.node(ready.node);
        let name = node.name().to_string();

        self.state.steps += 1;
        let max_steps = self.shared.config.max_steps;
        if self.state.steps > max_steps {
            let failure = ExecutionFailure {
                node: Some(name),
                kind: FailureKind::StepLimit,
                message: format!("Run exceeded {} scheduling steps", max_steps),
                cause: None,
                attempts: ready.attempt + 1,
            };
            self.fail_run(ready, failure);
            return;
        }

        if node.spec.disabled {
            self.bypass(ready);
            return;
        }

        let parameters = match self.resolve_parameters(&ready) {
            Ok(parameters) => parameters,
            Err(e) => {
                self.on_failure(ready, NodeError::from(e).into());
                return;
            }
        };

        let timeout_ms = node
            .spec
            .timeout_ms
            .or(graph.workflow().settings.node_timeout_ms)
            .unwrap_or(self.shared.config.node_timeout_ms);
        let state_handle = Arc::new(RwLock::new(NodeState {
            data: self.state.node_state.get(&name).cloned().unwrap_or_default(),
        }));
        let run_context = self.run_context.for_node(&name);

        let ctx = NodeContext {
            run_id: self.state.run_id,
            workflow_id: self.state.workflow_id,
            node_name: name.clone(),
            run_index: self.state.node_runs(&name).len(),
            attempt: ready.attempt,
            inputs: ready.inputs.clone(),
            parameters,
            static_data: self.state.static_data.clone(),
            state: state_handle.clone(),
            events: self.shared.events.create_emitter(self.state.run_id, &name),
            cancellation: self.cancel.child_token(),
            helpers: RuntimeHelpers::new(
                run_context,
                node.spec.credentials.clone(),
                self.shared.credentials.clone(),
                self.invoker.clone(),
            ),
        };

        tracing::debug!("Launching node {} (attempt {})", name, ready.attempt + 1);
        self.shared.events.emit(ExecutionEvent::NodeStarted {
            run_id: self.state.run_id,
            node: name,
            node_type: node.spec.node_type.clone(),
            attempt: ready.attempt,
            timestamp: Utc::now(),
        });

        self.in_flight.insert(ready.node);
        let adapter = node.adapter.clone();
        let limit = Duration::from_millis(timeout_ms);

        self.running.push(tokio::spawn(async move {
            let start = Instant::now();
            let result = match AssertUnwindSafe(timeout(limit, adapter.execute(ctx)))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome.map_err(Failure::from),
                Ok(Err(_)) => Err(Failure::from(NodeError::Timeout { millis: timeout_ms })),
                Err(payload) => Err(Failure::new(
                    FailureKind::Panic,
                    panic_message(payload.as_ref()),
                )),
            };
            let node_state = state_handle.read().await.data.clone();
            Completion {
                ready,
                result,
                node_state,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }));
    }

    fn resolve_parameters(&self, ready: &ReadyNode) -> Result<Parameters, ExpressionError> {
        static EMPTY: ItemSet = ItemSet::new();

        let node = self.graph.node(ready.node);
        let input = ready
            .inputs
            .get(node.metadata.primary_input())
            .unwrap_or(&EMPTY);
        let run_context = self.run_context.for_node(node.name());
        let ctx = ExpressionContext {
            run: &self.state,
            workflow: self.graph.workflow(),
            node: node.name(),
            run_index: self.state.node_runs(node.name()).len(),
            input,
            run_context: &run_context,
        };
        let mode = if node.spec.execute_once {
            ItemMode::Once
        } else {
            node.metadata.item_mode
        };
        self.shared
            .resolver
            .resolve_parameters(&node.spec.parameters, &ctx, mode)
    }

    /// Forward a disabled node's primary input to its primary output
    fn bypass(&mut self, ready: ReadyNode) {
        let graph = self.graph.clone();
        let node = graph.node(ready.node);
        let items = ready
            .inputs
            .get(node.metadata.primary_input())
            .cloned()
            .unwrap_or_default();
        let outputs = self.complete_outputs(
            ready.node,
            node.metadata
                .primary_output()
                .map(|port| BTreeMap::from([(port.to_string(), items)]))
                .unwrap_or_default(),
        );

        tracing::debug!("Node {} is disabled, passing input through", node.name());
        let index = ready.node;
        self.record(ready, NodeRunStatus::Bypassed, outputs.clone(), None, 0);
        self.deliver(index, &outputs);
    }

    async fn on_completion(&mut self, completion: Completion) {
        let Completion {
            ready,
            result,
            node_state,
            duration_ms,
        } = completion;
        self.in_flight.remove(&ready.node);
        if self.cancel.is_cancelled() {
            self.on_cancel();
        }

        let name = self.graph.node(ready.node).name().to_string();
        if !node_state.is_empty() || self.state.node_state.contains_key(&name) {
            self.state.node_state.insert(name, node_state);
        }

        match result {
            Ok(NodeOutcome::Output(output)) => self.on_success(ready, output, duration_ms),
            Ok(NodeOutcome::Wait(request)) => self.on_wait(ready, request).await,
            Err(failure) => self.on_failure(ready, failure),
        }

        if self.shared.config.persist_progress {
            if let Err(e) = self.shared.runs.save_run_state(&self.state).await {
                tracing::warn!("Failed to persist progress of run {}: {}", self.state.run_id, e);
            }
        }
    }

    fn on_success(&mut self, ready: ReadyNode, mut output: NodeOutput, duration_ms: u64) {
        let index = ready.node;
        if let Some(update) = output.static_data.take() {
            self.state.static_data.extend(update);
        }
        let outputs = self.complete_outputs(index, output.ports);
        let name = self.graph.node(index).name().to_string();

        tracing::info!("Node {} completed in {}ms", name, duration_ms);
        self.shared.events.emit(ExecutionEvent::NodeCompleted {
            run_id: self.state.run_id,
            node: name,
            items: outputs.iter().map(|(p, s)| (p.clone(), s.len())).collect(),
            duration_ms,
            timestamp: Utc::now(),
        });

        let attempts = ready.attempt + 1;
        self.record(ready, NodeRunStatus::Success, outputs.clone(), None, attempts);
        if !self.halted && !self.cancelled {
            self.deliver(index, &outputs);
        }
    }

    async fn on_wait(&mut self, ready: ReadyNode, request: WaitRequest) {
        let name = self.graph.node(ready.node).name().to_string();
        let key = ResumeKey::derive(self.state.workflow_id, &name, &request.correlation);

        if let Err(e) = self
            .shared
            .pause
            .reserve(&key, self.state.run_id, request.expires_at)
            .await
        {
            self.on_failure(ready, Failure::new(FailureKind::ResumeKeyConflict, e.to_string()));
            return;
        }

        tracing::info!("Node {} is waiting on resume key {}", name, key);
        self.state.waiting.push(WaitState {
            node: name,
            resume_key: key,
            requested_at: Utc::now(),
            expires_at: request.expires_at,
        });
        let attempts = ready.attempt + 1;
        self.record(ready, NodeRunStatus::Waiting, BTreeMap::new(), None, attempts);
    }

    fn on_failure(&mut self, mut ready: ReadyNode, failure: Failure) {
        let graph = self.graph.clone();
        let node = graph.node(ready.node);
        let will_retry = !self.halted && !self.cancelled && ready.attempt < node.spec.retries();

        self.shared.events.emit(ExecutionEvent::NodeFailed {
            run_id: self.state.run_id,
            node: node.name().to_string(),
            error: failure.message.clone(),
            attempt: ready.attempt,
            will_retry,
            timestamp: Utc::now(),
        });

        if will_retry {
            let delay = node
                .spec
                .retry
                .as_ref()
                .map(|policy| policy.delay_for(ready.attempt + 1))
                .unwrap_or_default();
            tracing::warn!(
                "Node {} failed on attempt {}, retrying in {:?}: {}",
                node.name(),
                ready.attempt + 1,
                delay,
                failure.message
            );
            ready.attempt_errors.push(failure.message);
            ready.attempt += 1;
            self.retries.push(
                async move {
                    tokio::time::sleep(delay).await;
                    ready
                }
                .boxed(),
            );
            return;
        }

        let attempts = ready.attempt + 1;
        let execution_failure = ExecutionFailure {
            node: Some(node.name().to_string()),
            kind: failure.kind,
            message: failure.message.clone(),
            cause: failure.cause,
            attempts,
        };

        if node.spec.continue_on_fail && !self.halted {
            tracing::warn!(
                "Node {} failed, continuing with error output: {}",
                node.name(),
                failure.message
            );
            let outputs = self.complete_outputs(
                ready.node,
                node.metadata
                    .primary_output()
                    .map(|port| {
                        BTreeMap::from([(
                            port.to_string(),
                            ItemSet::from(vec![Item::error(failure.message)]),
                        )])
                    })
                    .unwrap_or_default(),
            );
            let index = ready.node;
            self.record(
                ready,
                NodeRunStatus::ContinuedOnFail,
                outputs.clone(),
                Some(execution_failure),
                attempts,
            );
            if !self.cancelled {
                self.deliver(index, &outputs);
            }
            return;
        }

        self.fail_run(ready, execution_failure);
    }

    /// Record an unrecovered failure and stop launching nodes
    fn fail_run(&mut self, ready: ReadyNode, failure: ExecutionFailure) {
        tracing::error!(
            "Node {} failed after {} attempt(s): {}",
            failure.node.as_deref().unwrap_or("?"),
            failure.attempts,
            failure.message
        );
        let attempts = failure.attempts;
        self.record(ready, NodeRunStatus::Failed, BTreeMap::new(), Some(failure.clone()), attempts);
        // Nodes interrupted by cancellation do not turn the run into an error
        if self.state.error.is_none() && !self.cancelled {
            self.state.error = Some(failure);
        }
        self.halted = true;
        self.queue.clear();
        self.retries = FuturesUnordered::new();
    }

    fn on_cancel(&mut self) {
        if self.cancelled {
            return;
        }
        tracing::info!(
            "Run {} cancelled, awaiting {} in-flight node(s)",
            self.state.run_id,
            self.running.len()
        );
        self.cancelled = true;
        self.queue.clear();
        self.retries = FuturesUnordered::new();
    }

    fn record(
        &mut self,
        ready: ReadyNode,
        status: NodeRunStatus,
        outputs: BTreeMap<String, ItemSet>,
        error: Option<ExecutionFailure>,
        attempts: u32,
    ) {
        let name = self.graph.node(ready.node).name().to_string();
        let run_index = self.state.node_runs(&name).len();
        let finished_at = (status != NodeRunStatus::Waiting).then(Utc::now);

        self.state
            .run_data
            .entry(name.clone())
            .or_default()
            .push(NodeRunRecord {
                run_index,
                status,
                started_at: ready.started_at,
                finished_at,
                attempts,
                inputs: ready.inputs,
                outputs,
                error,
                attempt_errors: ready.attempt_errors,
            });
        self.state.last_node_executed = Some(name);
    }

    /// Add an empty set for every declared output port the node left out
    fn complete_outputs(
        &self,
        node: usize,
        mut outputs: BTreeMap<String, ItemSet>,
    ) -> BTreeMap<String, ItemSet> {
        for port in &self.graph.node(node).metadata.outputs {
            outputs.entry(port.name.clone()).or_default();
        }
        outputs
    }

    /// Feed `outputs` along every outgoing connection of `node`, then
    /// schedule the touched targets in declaration order
    fn deliver(&mut self, node: usize, outputs: &BTreeMap<String, ItemSet>) {
        let graph = self.graph.clone();
        let mut touched = Vec::new();

        for edge in graph.outgoing(node) {
            let slot = &mut self.buffers[edge.target][edge.slot];
            match outputs.get(&edge.source_output) {
                Some(items) if !items.is_empty() => slot.push(items.clone()),
                _ => slot.settle(),
            }
            if !touched.contains(&edge.target) {
                touched.push(edge.target);
            }
        }

        touched.sort_unstable();
        for target in touched {
            self.try_schedule(target);
        }
    }

    fn try_schedule(&mut self, node: usize) {
        let graph = self.graph.clone();
        if graph.is_ready(node, &self.buffers[node]) {
            let inputs = graph.collect_inputs(node, &mut self.buffers[node]);
            tracing::debug!("Node {} is runnable", graph.node(node).name());
            self.queue.push_back(ReadyNode::new(node, inputs));
        } else if self.buffers[node].iter().all(|slot| !slot.is_pending()) {
            // Every connection settled and the node still cannot run
            tracing::debug!("Skipping node {}: no input data", graph.node(node).name());
            for slot in self.buffers[node].iter_mut() {
                *slot = InputSlot::Pending;
            }
            self.deliver(node, &BTreeMap::new());
        }
    }

    /// Nothing is running or queued. Settle the first partially fed node so
    /// branches that were never taken do not block it forever. Returns true
    /// when new work was queued.
    fn quiesce(&mut self) -> bool {
        if !self.state.waiting.is_empty() {
            return false;
        }
        let graph = self.graph.clone();
        for node in 0..graph.len() {
            if !self.buffers[node].iter().any(InputSlot::has_data) {
                continue;
            }
            self.buffers[node].iter_mut().for_each(InputSlot::settle);
            if graph.inputs_satisfied(node, &self.buffers[node]) {
                tracing::debug!(
                    "Running node {} with the inputs that arrived",
                    graph.node(node).name()
                );
                let inputs = graph.collect_inputs(node, &mut self.buffers[node]);
                self.queue.push_back(ReadyNode::new(node, inputs));
            } else {
                self.try_schedule(node);
            }
            if !self.queue.is_empty() {
                return true;
            }
        }
        false
    }

    fn snapshot_buffers(&self) -> BTreeMap<String, Vec<InputSlot>> {
        self.graph
            .nodes()
            .iter()
            .zip(&self.buffers)
            .filter(|(_, slots)| slots.iter().any(|s| !s.is_pending()))
            .map(|(node, slots)| (node.name().to_string(), slots.clone()))
            .collect()
    }

    fn restore_buffers(&mut self, buffers: BTreeMap<String, Vec<InputSlot>>) {
        for (name, slots) in buffers {
            match self.graph.index_of(&name) {
                Some(index) if self.buffers[index].len() == slots.len() => {
                    self.buffers[index] = slots;
                }
                _ => tracing::warn!("Dropping saved inputs for unknown node {}", name),
            }
        }
    }

    async fn finish(mut self) -> Result<RunState, FlowError> {
        let status = if self.state.error.is_some() {
            RunStatus::Error
        } else if self.cancelled {
            RunStatus::Canceled
        } else if !self.state.waiting.is_empty() {
            RunStatus::Waiting
        } else {
            RunStatus::Success
        };

        if status == RunStatus::Waiting {
            self.state.status = RunStatus::Waiting;
            self.state.continuation = Some(Continuation {
                workflow: self.graph.workflow().clone(),
                buffers: self.snapshot_buffers(),
            });
            self.shared.pause.suspend(&self.state).await?;
            self.shared.events.emit(ExecutionEvent::RunWaiting {
                run_id: self.state.run_id,
                resume_keys: self.state.waiting.iter().map(|w| w.resume_key.clone()).collect(),
                timestamp: Utc::now(),
            });
            return Ok(self.state);
        }

        if !self.state.waiting.is_empty() {
            self.shared.pause.release_run(self.state.run_id).await;
            self.state.waiting.clear();
        }

        let now = Utc::now();
        self.state.status = status;
        self.state.finished_at = Some(now);
        self.state.continuation = None;
        self.shared.runs.save_run_state(&self.state).await?;

        let duration_ms = self
            .state
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        match status {
            RunStatus::Error => tracing::error!(
                "Run {} failed after {}ms",
                self.state.run_id,
                duration_ms
            ),
            _ => tracing::info!(
                "Run {} finished with status {} in {}ms",
                self.state.run_id,
                status,
                duration_ms
            ),
        }
        self.shared.events.emit(ExecutionEvent::RunFinished {
            run_id: self.state.run_id,
            status,
            duration_ms,
            timestamp: now,
        });

        if status == RunStatus::Error {
            run_error_workflow(
                &self.shared,
                self.graph.workflow(),
                &self.state,
                self.run_context.depth,
            )
            .await;
        }
        Ok(self.state)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("Node panicked: {}", msg))
        .unwrap_or_else(|| "Node panicked".to_string())
}

