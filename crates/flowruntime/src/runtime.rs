use crate::config::RuntimeConfig;
use crate::expression::ExpressionResolver;
use crate::graph::ExecutionGraph;
use crate::pause::PauseController;
use crate::registry::NodeRegistry;
use crate::scheduler::RunScheduler;
use crate::store::MemoryStore;
use chrono::{DateTime, Utc};
use flowcore::{
    CredentialProvider, EventBus, ExecutionEvent, ExecutionMode, FlowError, GraphError, ItemSet,
    NoCredentials, NodeRunStatus, ResumeKey, RunId, RunState, RunStatus, RunStore, Workflow,
    WorkflowId, WorkflowStore, MAIN_PORT,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Services shared by every scheduler of one runtime
pub(crate) struct EngineShared {
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) workflows: Arc<dyn WorkflowStore>,
    pub(crate) runs: Arc<dyn RunStore>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) events: EventBus,
    pub(crate) pause: PauseController,
    pub(crate) resolver: ExpressionResolver,
    pub(crate) config: RuntimeConfig,
    /// Cancellation handles of runs currently driven by this process
    active: RwLock<HashMap<RunId, CancellationToken>>,
}

/// How a run is started
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<RunId>,
    pub mode: ExecutionMode,
    /// Node that receives the trigger items, instead of the detected start node
    pub start_node: Option<String>,
}

impl RunOptions {
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn start_at(mut self, node: impl Into<String>) -> Self {
        self.start_node = Some(node.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Main runtime for executing workflows
#[derive(Clone)]
pub struct FlowRuntime {
    shared: Arc<EngineShared>,
}

impl FlowRuntime {
    /// Create a runtime with an empty registry and in-memory stores
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::default()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Check a workflow without running it
    pub fn validate(&self, workflow: &Workflow) -> Result<(), GraphError> {
        let graph = ExecutionGraph::build(workflow, &self.shared.registry)?;
        graph.start_node(None)?;
        Ok(())
    }

    /// Run a workflow definition with the given trigger items until it
    /// reaches a terminal or waiting status
    pub async fn start_run(&self, workflow: &Workflow, items: ItemSet) -> Result<RunState, FlowError> {
        self.start_run_with(workflow, items, RunOptions::default()).await
    }

    pub async fn start_run_with(
        &self,
        workflow: &Workflow,
        items: ItemSet,
        options: RunOptions,
    ) -> Result<RunState, FlowError> {
        let graph = Arc::new(ExecutionGraph::build(workflow, &self.shared.registry)?);
        let start = graph.start_node(options.start_node.as_deref())?;

        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        let state = RunState::new(run_id, workflow, options.mode);
        let token = self.register(run_id).await;

        let scheduler = RunScheduler::start(self.shared.clone(), graph, state, start, items, token, 0);
        let result = scheduler.run().await;
        self.unregister(run_id).await;
        result
    }

    /// Load a stored workflow and run it
    pub async fn start_workflow(
        &self,
        workflow_id: WorkflowId,
        items: ItemSet,
    ) -> Result<RunState, FlowError> {
        let workflow = self.shared.workflows.load_workflow(workflow_id).await?;
        self.start_run(&workflow, items).await
    }

    /// Continue the run waiting on `key`, using `items` as the output of the
    /// node that requested the wait
    pub async fn resume_run(&self, key: &ResumeKey, items: ItemSet) -> Result<RunState, FlowError> {
        let run_id = self
            .shared
            .pause
            .lookup(key)
            .await
            .ok_or_else(|| FlowError::ResumeKeyNotFound { key: key.clone() })?;

        // Build the graph before claiming so a bad definition leaves the run waiting
        let persisted = self.shared.runs.load_run_state(run_id).await?;
        let workflow = match &persisted.continuation {
            Some(continuation) => continuation.workflow.clone(),
            None => self.shared.workflows.load_workflow(persisted.workflow_id).await?,
        };
        let graph = Arc::new(ExecutionGraph::build(&workflow, &self.shared.registry)?);

        let state = self.shared.pause.claim(key).await?;
        let token = self.register(run_id).await;
        let result = match RunScheduler::resume(self.shared.clone(), graph, state, key, items, token) {
            Ok(scheduler) => scheduler.run().await,
            Err(e) => Err(e),
        };
        self.unregister(run_id).await;
        self.shared.pause.release_claim(run_id).await;
        result
    }

    /// Request cancellation. Active runs stop at the next scheduling step;
    /// waiting runs are cancelled immediately.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), FlowError> {
        // A resume owns the run between its claim and registering its token,
        // and again between unregistering and releasing the claim
        loop {
            if let Some(token) = self.shared.active.read().await.get(&run_id) {
                tracing::info!("Cancellation requested for run {}", run_id);
                token.cancel();
                return Ok(());
            }
            if self.shared.pause.claim_run(run_id).await {
                break;
            }
            tokio::task::yield_now().await;
        }

        let result = self.cancel_waiting(run_id).await;
        self.shared.pause.release_claim(run_id).await;
        result
    }

    async fn cancel_waiting(&self, run_id: RunId) -> Result<(), FlowError> {
        let mut state = self.shared.runs.load_run_state(run_id).await?;
        if state.status != RunStatus::Waiting {
            return Err(FlowError::RunNotActive { run_id });
        }

        self.shared.pause.release_run(run_id).await;
        let now = Utc::now();
        state.waiting.clear();
        state.continuation = None;
        state.status = RunStatus::Canceled;
        state.finished_at = Some(now);
        self.shared.runs.save_run_state(&state).await?;

        tracing::info!("Waiting run {} cancelled", run_id);
        let duration_ms = state
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        self.shared.events.emit(ExecutionEvent::RunFinished {
            run_id,
            status: RunStatus::Canceled,
            duration_ms,
            timestamp: now,
        });
        Ok(())
    }

    pub async fn get_run_state(&self, run_id: RunId) -> Result<RunState, FlowError> {
        Ok(self.shared.runs.load_run_state(run_id).await?)
    }

    /// Re-register resume keys of runs persisted as waiting, e.g. after a
    /// process restart
    pub async fn recover_waiting(&self) -> Result<usize, FlowError> {
        self.shared.pause.recover().await
    }

    /// Resume every wait whose expiry is at or before `now`. The waiting
    /// node's input is used as its output.
    pub async fn resume_expired(&self, now: DateTime<Utc>) -> Result<Vec<RunState>, FlowError> {
        let mut resumed = Vec::new();
        for key in self.shared.pause.expired(now).await {
            let Some(run_id) = self.shared.pause.lookup(&key).await else {
                continue;
            };
            let state = self.shared.runs.load_run_state(run_id).await?;
            let items = state
                .wait_for(&key)
                .and_then(|wait| {
                    state
                        .node_runs(&wait.node)
                        .iter()
                        .rev()
                        .find(|r| r.status == NodeRunStatus::Waiting)
                })
                .and_then(|record| {
                    record
                        .inputs
                        .get(MAIN_PORT)
                        .or_else(|| record.inputs.values().next())
                        .cloned()
                })
                .unwrap_or_default();

            tracing::info!("Wait on {} expired, resuming run {}", key, run_id);
            match self.resume_run(&key, items).await {
                Ok(state) => resumed.push(state),
                Err(e) => tracing::warn!("Failed to resume expired wait {}: {}", key, e),
            }
        }
        Ok(resumed)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.shared.events.subscribe()
    }

    async fn register(&self, run_id: RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.shared
            .active
            .write()
            .await
            .insert(run_id, token.clone());
        token
    }

    async fn unregister(&self, run_id: RunId) {
        self.shared.active.write().await.remove(&run_id);
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct FlowRuntimeBuilder {
    registry: Option<NodeRegistry>,
    workflows: Option<Arc<dyn WorkflowStore>>,
    runs: Option<Arc<dyn RunStore>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: Option<RuntimeConfig>,
}

impl FlowRuntimeBuilder {
    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use one store for both workflow definitions and run state
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: WorkflowStore + RunStore + 'static,
    {
        self.workflows = Some(store.clone() as Arc<dyn WorkflowStore>);
        self.runs = Some(store as Arc<dyn RunStore>);
        self
    }

    pub fn workflow_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.workflows = Some(store);
        self
    }

    pub fn run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.runs = Some(store);
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> FlowRuntime {
        let config = self.config.unwrap_or_default();
        let memory = Arc::new(MemoryStore::new());
        let workflows: Arc<dyn WorkflowStore> = match self.workflows {
            Some(store) => store,
            None => memory.clone(),
        };
        let runs: Arc<dyn RunStore> = match self.runs {
            Some(store) => store,
            None => memory,
        };
        let credentials: Arc<dyn CredentialProvider> = match self.credentials {
            Some(provider) => provider,
            None => Arc::new(NoCredentials),
        };
        let resolver =
            ExpressionResolver::new(credentials.clone()).with_variables(config.env.clone());

        let shared = EngineShared {
            registry: Arc::new(self.registry.unwrap_or_default()),
            workflows,
            pause: PauseController::new(runs.clone()),
            runs,
            credentials,
            events: EventBus::new(config.event_buffer_size),
            resolver,
            config,
            active: RwLock::new(HashMap::new()),
        };
        FlowRuntime {
            shared: Arc::new(shared),
        }
    }
}
