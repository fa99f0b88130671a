//! Top-level execution driver.
//!
//! Validates a workflow once at registration, then steps the computed order
//! sequentially: dispatch, record output, checkpoint. Failures consult the
//! failed node's error edge before the run itself is declared failed. A
//! checkpoint lands after every node transition, so an interrupted run
//! resumes from the node after the last completed one without replaying.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::capability::{SecretResolver, ToolInvoker, Usage};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::core::events::{EventEmitter, EventSink, RunEvent};
use crate::flow::context::ContextStore;
use crate::flow::dispatch::Dispatcher;
use crate::flow::model::{EdgeLabel, NodeConfig, Workflow};
use crate::flow::validate::{validate, ExecutionPlan, NodeDisposition};
use crate::state::{ExecutionState, RunStatus, StateStore};

/// Final report for one run (or run segment, when paused).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub execution_id: String,
    pub status: RunStatus,
    /// Node outputs accumulated over the run.
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: Usage,
}

struct Registered {
    workflow: Workflow,
    plan: ExecutionPlan,
    config: EngineConfig,
}

#[derive(Clone, Default)]
struct RunControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

/// The main executor for workflow graphs.
pub struct FlowExecutor {
    dispatcher: Dispatcher,
    state: Arc<dyn StateStore>,
    event_sink: Option<Arc<dyn EventSink>>,
    config: EngineConfig,
    workflows: RwLock<HashMap<String, Arc<Registered>>>,
    controls: DashMap<String, RunControl>,
}

impl FlowExecutor {
    /// Creates a new executor with optional configuration overrides.
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        secrets: Arc<dyn SecretResolver>,
        state: Arc<dyn StateStore>,
        config: Option<EngineConfig>,
    ) -> Result<Self> {
        let config = config.unwrap_or_default();
        config.validate().map_err(EngineError::definition)?;
        Ok(Self {
            dispatcher: Dispatcher::new(tools, secrets),
            state,
            event_sink: None,
            config,
            workflows: RwLock::new(HashMap::new()),
            controls: DashMap::new(),
        })
    }

    /// Set the sink that receives lifecycle events for every run.
    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sink = Some(sink);
    }

    /// Validates and registers a workflow. Structural problems surface here;
    /// execution never starts on an invalid graph.
    pub async fn register(&self, workflow: Workflow) -> Result<()> {
        let plan = validate(&workflow)?;
        let config = match &workflow.config {
            Some(overrides) => {
                EngineConfig::merge(&self.config, overrides).map_err(EngineError::definition)?
            }
            None => self.config.clone(),
        };
        info!(workflow_id = %workflow.id, version = workflow.version, "registered workflow");
        self.workflows.write().await.insert(
            workflow.id.clone(),
            Arc::new(Registered {
                workflow,
                plan,
                config,
            }),
        );
        Ok(())
    }

    /// Loads and registers a workflow definition from a YAML file.
    pub async fn register_yaml_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.register(Workflow::from_yaml_file(path)?).await
    }

    /// Starts a run with a generated execution id.
    pub async fn start(&self, workflow_id: &str, input: Value) -> Result<RunReport> {
        let execution_id = cuid2::create_id();
        self.start_with_id(workflow_id, &execution_id, input).await
    }

    /// Starts a run under a caller-chosen execution id, so the caller can
    /// address `cancel`/`pause`/`status` while the run is in flight.
    #[instrument(skip(self, input))]
    pub async fn start_with_id(
        &self,
        workflow_id: &str,
        execution_id: &str,
        input: Value,
    ) -> Result<RunReport> {
        let registered = self.lookup(workflow_id).await?;
        let ctx = ContextStore::with_input(input);
        self.run(registered, execution_id.to_string(), ctx, 0, Usage::default())
            .await
    }

    /// Resumes an interrupted run from the node after its last checkpoint.
    #[instrument(skip(self))]
    pub async fn resume(&self, execution_id: &str) -> Result<RunReport> {
        let state = self
            .state
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        if state.status.is_terminal() {
            return Err(EngineError::NotResumable {
                execution_id: execution_id.to_string(),
                status: state.status.as_str().to_string(),
            });
        }
        let registered = self.lookup(&state.workflow_id).await?;

        let start_index = match &state.current_node {
            Some(node_id) => registered
                .plan
                .position(node_id)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };
        let ctx = ContextStore::restore(state.context);
        info!(execution_id, start_index, "resuming execution");
        self.run(
            registered,
            execution_id.to_string(),
            ctx,
            start_index,
            state.usage,
        )
        .await
    }

    /// Latest persisted state for an execution.
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionState> {
        self.state
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Requests cancellation. Takes effect at the next safe checkpoint: the
    /// node being dispatched finishes (or times out) and its result is
    /// discarded. Returns false when no such run is live.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.controls.get(execution_id) {
            Some(control) => {
                control.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Requests a pause at the next checkpoint; the run can be continued
    /// later with [`FlowExecutor::resume`].
    pub fn pause(&self, execution_id: &str) -> bool {
        match self.controls.get(execution_id) {
            Some(control) => {
                control.pause.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    async fn lookup(&self, workflow_id: &str) -> Result<Arc<Registered>> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn run(
        &self,
        registered: Arc<Registered>,
        execution_id: String,
        ctx: ContextStore,
        start_index: usize,
        usage: Usage,
    ) -> Result<RunReport> {
        let control = RunControl::default();
        self.controls.insert(execution_id.clone(), control.clone());
        let result = self
            .run_inner(&registered, &execution_id, ctx, start_index, usage, &control)
            .await;
        self.controls.remove(&execution_id);
        result
    }

    async fn run_inner(
        &self,
        registered: &Registered,
        execution_id: &str,
        ctx: ContextStore,
        start_index: usize,
        mut usage: Usage,
        control: &RunControl,
    ) -> Result<RunReport> {
        let workflow = &registered.workflow;
        let plan = &registered.plan;
        let config = &registered.config;
        let emitter = EventEmitter::new(self.event_sink.clone(), execution_id);

        let mut dispositions = self.reconstruct_dispositions(registered, &ctx, start_index);
        let mut current_node: Option<String> = if start_index > 0 {
            plan.order.get(start_index - 1).cloned()
        } else {
            None
        };

        // Initial checkpoint, so status() answers from the very first node.
        self.checkpoint(
            execution_id,
            workflow,
            &ctx,
            current_node.clone(),
            RunStatus::Running,
            None,
            &usage,
        )
        .await?;

        let started_at = Instant::now();
        let run_deadline = config.run_timeout_seconds.map(Duration::from_secs);

        for position in start_index..plan.order.len() {
            let node_id = plan.order[position].clone();

            // Loop-body nodes are driven by their loop controller.
            if plan.in_loop_body(&node_id) {
                continue;
            }

            if control.cancel.load(Ordering::SeqCst) {
                return self
                    .finish_failed(
                        execution_id,
                        workflow,
                        &ctx,
                        current_node,
                        "execution cancelled".to_string(),
                        &usage,
                        &emitter,
                    )
                    .await;
            }

            if control.pause.load(Ordering::SeqCst) {
                self.checkpoint(
                    execution_id,
                    workflow,
                    &ctx,
                    current_node.clone(),
                    RunStatus::Paused,
                    None,
                    &usage,
                )
                .await?;
                info!(execution_id, "execution paused");
                return Ok(RunReport {
                    execution_id: execution_id.to_string(),
                    status: RunStatus::Paused,
                    outputs: ctx.outputs(),
                    error: None,
                    usage,
                });
            }

            if let Some(deadline) = run_deadline {
                if started_at.elapsed() > deadline {
                    return self
                        .finish_failed(
                            execution_id,
                            workflow,
                            &ctx,
                            current_node,
                            format!("run timeout of {:?} exceeded", deadline),
                            &usage,
                            &emitter,
                        )
                        .await;
                }
            }

            if !plan.node_is_live(&node_id, &dispositions, None) {
                dispositions.insert(node_id.clone(), NodeDisposition::Skipped);
                continue;
            }

            let node = workflow.node(&node_id).ok_or_else(|| {
                EngineError::Definition(format!("node '{}' missing from workflow", node_id))
            })?;

            let outcome = self
                .dispatcher
                .dispatch(node, workflow, plan, &ctx, config, &emitter)
                .await;

            // Cancellation lands at the next safe checkpoint: the in-flight
            // node finished on its own terms and its result is discarded.
            if control.cancel.load(Ordering::SeqCst) {
                return self
                    .finish_failed(
                        execution_id,
                        workflow,
                        &ctx,
                        current_node,
                        "execution cancelled".to_string(),
                        &usage,
                        &emitter,
                    )
                    .await;
            }

            match outcome {
                Ok(success) => {
                    ctx.record_output(&node_id, success.output);
                    usage.absorb(&success.usage);
                    dispositions.insert(
                        node_id.clone(),
                        NodeDisposition::Succeeded {
                            branch: success.branch,
                        },
                    );
                    // A completed loop vouches for its whole body.
                    if let Some(body) = plan.loop_body(&node_id) {
                        for member in &body.members {
                            dispositions
                                .entry(member.clone())
                                .or_insert(NodeDisposition::Succeeded { branch: None });
                        }
                    }
                }
                Err(failure) => match plan.error_target(&node_id) {
                    Some(target) => {
                        warn!(
                            execution_id,
                            node_id = %node_id,
                            target,
                            "node failed; routing through error edge"
                        );
                        ctx.record_output(
                            &node_id,
                            json!({ "failed": true, "error": failure.message }),
                        );
                        dispositions.insert(node_id.clone(), NodeDisposition::Routed);
                    }
                    None => {
                        return self
                            .finish_failed(
                                execution_id,
                                workflow,
                                &ctx,
                                Some(node_id.clone()),
                                failure.message,
                                &usage,
                                &emitter,
                            )
                            .await;
                    }
                },
            }

            current_node = Some(node_id.clone());
            self.checkpoint(
                execution_id,
                workflow,
                &ctx,
                current_node.clone(),
                RunStatus::Running,
                None,
                &usage,
            )
            .await?;
        }

        // Terminal checkpoint: usage is finalized exactly once, here.
        self.checkpoint(
            execution_id,
            workflow,
            &ctx,
            current_node,
            RunStatus::Completed,
            None,
            &usage,
        )
        .await?;
        emitter.emit(RunEvent::ExecutionCompleted {
            execution_id: execution_id.to_string(),
        });
        info!(execution_id, "execution completed");

        Ok(RunReport {
            execution_id: execution_id.to_string(),
            status: RunStatus::Completed,
            outputs: ctx.outputs(),
            error: None,
            usage,
        })
    }

    /// Rebuilds edge-liveness dispositions for the already-completed prefix
    /// of a resumed run, from the restored context alone.
    fn reconstruct_dispositions(
        &self,
        registered: &Registered,
        ctx: &ContextStore,
        start_index: usize,
    ) -> HashMap<String, NodeDisposition> {
        let mut dispositions = HashMap::new();
        if start_index == 0 {
            return dispositions;
        }

        for node_id in &registered.plan.order[..start_index] {
            if registered.plan.in_loop_body(node_id) {
                continue;
            }
            let disposition = match ctx.output(node_id) {
                None => NodeDisposition::Skipped,
                Some(output) => {
                    if output.get("failed").and_then(Value::as_bool) == Some(true) {
                        NodeDisposition::Routed
                    } else {
                        let branch = match registered.workflow.node(node_id).map(|n| &n.config) {
                            Some(NodeConfig::Condition { .. }) => {
                                output.get("result").and_then(Value::as_bool).map(|b| {
                                    if b {
                                        EdgeLabel::True
                                    } else {
                                        EdgeLabel::False
                                    }
                                })
                            }
                            _ => None,
                        };
                        NodeDisposition::Succeeded { branch }
                    }
                }
            };
            dispositions.insert(node_id.clone(), disposition);
        }

        // Completed loops vouch for their body nodes, which sit after the
        // loop in the order and were driven by it.
        for (loop_id, body) in registered
            .plan
            .order
            .iter()
            .filter_map(|id| registered.plan.loop_body(id).map(|body| (id, body)))
        {
            if ctx.output(loop_id).is_some() {
                for member in &body.members {
                    dispositions
                        .entry(member.clone())
                        .or_insert(NodeDisposition::Succeeded { branch: None });
                }
            }
        }

        dispositions
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        execution_id: &str,
        workflow: &Workflow,
        ctx: &ContextStore,
        current_node: Option<String>,
        error: String,
        usage: &Usage,
        emitter: &EventEmitter,
    ) -> Result<RunReport> {
        self.checkpoint(
            execution_id,
            workflow,
            ctx,
            current_node,
            RunStatus::Failed,
            Some(error.clone()),
            usage,
        )
        .await?;
        emitter.emit(RunEvent::ExecutionFailed {
            execution_id: execution_id.to_string(),
            error: error.clone(),
        });
        warn!(execution_id, error = %error, "execution failed");

        Ok(RunReport {
            execution_id: execution_id.to_string(),
            status: RunStatus::Failed,
            outputs: ctx.outputs(),
            error: Some(error),
            usage: usage.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn checkpoint(
        &self,
        execution_id: &str,
        workflow: &Workflow,
        ctx: &ContextStore,
        current_node: Option<String>,
        status: RunStatus,
        error: Option<String>,
        usage: &Usage,
    ) -> Result<()> {
        let state = ExecutionState {
            execution_id: execution_id.to_string(),
            workflow_id: workflow.id.clone(),
            current_node,
            context: ctx.snapshot(),
            status,
            error,
            usage: usage.clone(),
            updated_at: Utc::now(),
        };
        self.state.put(&state).await?;
        Ok(())
    }
}
