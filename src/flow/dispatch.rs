//! Per-node dispatch.
//!
//! Every node runs the same state machine: `Pending -> Running` when the
//! dispatcher picks it up, then `Succeeded` or `Failed`. Behavior in the
//! `Running` state is selected by the node's configuration variant. Failures
//! reported here are node-level; the executor decides whether an error edge
//! absorbs them.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, warn};

use crate::capability::{SecretResolver, ToolInvoker, Usage};
use crate::core::config::EngineConfig;
use crate::core::events::{EventEmitter, RunEvent};
use crate::expr::{CompiledExpr, Scope};
use crate::flow::context::ContextStore;
use crate::flow::model::{EdgeLabel, Node, NodeConfig, Workflow};
use crate::flow::validate::{ExecutionPlan, NodeDisposition};
use crate::team;

/// Lifecycle of one node dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone)]
pub struct NodeSuccess {
    pub output: Value,
    /// Branch chosen by a condition node.
    pub branch: Option<EdgeLabel>,
    pub usage: Usage,
    pub attempts: u32,
}

impl NodeSuccess {
    fn new(output: Value) -> Self {
        Self {
            output,
            branch: None,
            usage: Usage::default(),
            attempts: 1,
        }
    }
}

/// A node-level failure, eligible for error-edge routing.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub message: String,
}

impl NodeFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Maps a node's declared type to its execution behavior.
pub struct Dispatcher {
    tools: Arc<dyn ToolInvoker>,
    secrets: Arc<dyn SecretResolver>,
}

impl Dispatcher {
    pub fn new(tools: Arc<dyn ToolInvoker>, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { tools, secrets }
    }

    /// Runs one node to completion and emits its lifecycle events. Loop
    /// nodes drive their body nodes through here recursively.
    pub async fn dispatch(
        &self,
        node: &Node,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        ctx: &ContextStore,
        config: &EngineConfig,
        emitter: &EventEmitter,
    ) -> Result<NodeSuccess, NodeFailure> {
        debug!(node_id = %node.id, kind = node.kind(), phase = ?NodePhase::Running, "dispatching node");
        emitter.emit(RunEvent::NodeStarted {
            node_id: node.id.clone(),
        });
        let started = Instant::now();

        let result = match &node.config {
            NodeConfig::Tool {
                tool_id,
                args,
                secrets,
            } => {
                self.run_tool(node, tool_id, args, secrets, ctx, config)
                    .await
            }
            NodeConfig::Condition { expression } => {
                self.run_condition(node, expression, ctx, emitter)
            }
            NodeConfig::Loop {
                stop_condition,
                max_iterations,
                ..
            } => {
                self.run_loop(
                    node,
                    stop_condition,
                    *max_iterations,
                    workflow,
                    plan,
                    ctx,
                    config,
                    emitter,
                )
                .await
            }
            NodeConfig::MultiAgentTeam {
                members,
                coordinator,
                budget,
            } => self.run_team(node, members, coordinator.as_deref(), *budget, ctx, emitter)
                .await,
        };

        match &result {
            Ok(success) => {
                debug!(node_id = %node.id, phase = ?NodePhase::Succeeded, "node finished");
                emitter.emit(RunEvent::NodeSucceeded {
                    node_id: node.id.clone(),
                    attempts: success.attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(failure) => {
                warn!(node_id = %node.id, phase = ?NodePhase::Failed, error = %failure.message, "node failed");
                emitter.emit(RunEvent::NodeFailed {
                    node_id: node.id.clone(),
                    error: failure.message.clone(),
                });
            }
        }

        result
    }

    fn dispatch_boxed<'a>(
        &'a self,
        node: &'a Node,
        workflow: &'a Workflow,
        plan: &'a ExecutionPlan,
        ctx: &'a ContextStore,
        config: &'a EngineConfig,
        emitter: &'a EventEmitter,
    ) -> BoxFuture<'a, Result<NodeSuccess, NodeFailure>> {
        Box::pin(self.dispatch(node, workflow, plan, ctx, config, emitter))
    }

    /// Tool nodes: resolve templated args, inject secrets, validate against
    /// the tool's declared schema, then invoke under timeout with bounded
    /// retries.
    async fn run_tool(
        &self,
        node: &Node,
        tool_id: &str,
        args: &Value,
        secrets: &BTreeMap<String, String>,
        ctx: &ContextStore,
        config: &EngineConfig,
    ) -> Result<NodeSuccess, NodeFailure> {
        let mut resolved = ctx
            .resolve_template_value(args)
            .map_err(|e| NodeFailure::new(e.to_string()))?;

        if !secrets.is_empty() {
            if resolved.is_null() {
                resolved = Value::Object(serde_json::Map::new());
            }
            let mut resolved_secrets = Vec::with_capacity(secrets.len());
            for (arg_key, secret_name) in secrets {
                let value = self
                    .secrets
                    .resolve(secret_name)
                    .await
                    .map_err(|e| NodeFailure::new(e.to_string()))?;
                resolved_secrets.push((arg_key.clone(), value));
            }
            let map = resolved.as_object_mut().ok_or_else(|| {
                NodeFailure::new(format!(
                    "node '{}' declares secrets but its args are not an object",
                    node.id
                ))
            })?;
            for (arg_key, value) in resolved_secrets {
                map.insert(arg_key, Value::String(value));
            }
        }

        if let Some(schema) = self.tools.args_schema(tool_id) {
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                NodeFailure::new(format!("invalid schema for tool '{}': {}", tool_id, e))
            })?;
            if let Err(error) = validator.validate(&resolved) {
                return Err(NodeFailure::new(format!(
                    "args for tool '{}' failed validation: {}",
                    tool_id, error
                )));
            }
        }

        let max_attempts = node.max_attempts(config);
        let call_timeout = Duration::from_secs(node.timeout_secs(config));
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match timeout(call_timeout, self.tools.invoke(tool_id, resolved.clone())).await {
                Ok(Ok(output)) => {
                    let mut success = NodeSuccess::new(output.output);
                    success.usage = output.usage.unwrap_or_default();
                    success.attempts = attempt;
                    return Ok(success);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(
                        node_id = %node.id,
                        attempt,
                        max_attempts,
                        error = %last_error,
                        "tool call failed"
                    );
                }
                Err(_) => {
                    last_error = format!("timed out after {:?}", call_timeout);
                    warn!(node_id = %node.id, attempt, max_attempts, "tool call timed out");
                }
            }

            if attempt < max_attempts {
                let delay = config.retry_strategy.delay_ms(attempt);
                if delay > 0 {
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        Err(NodeFailure::new(format!(
            "tool '{}' failed after {} attempts: {}",
            tool_id, max_attempts, last_error
        )))
    }

    /// Condition nodes: evaluate the boolean expression and select the
    /// matching branch edge.
    fn run_condition(
        &self,
        node: &Node,
        expression: &str,
        ctx: &ContextStore,
        emitter: &EventEmitter,
    ) -> Result<NodeSuccess, NodeFailure> {
        let compiled =
            CompiledExpr::compile(expression).map_err(|e| NodeFailure::new(e.to_string()))?;
        let scope = Scope::new()
            .with("input", ctx.input())
            .with("context", ctx.as_value());
        let outcome = compiled
            .eval_bool(&scope)
            .map_err(|e| NodeFailure::new(e.to_string()))?;

        let branch = if outcome {
            EdgeLabel::True
        } else {
            EdgeLabel::False
        };
        emitter.emit(RunEvent::BranchSelected {
            node_id: node.id.clone(),
            branch: branch.as_str().to_string(),
        });

        let mut success = NodeSuccess::new(json!({ "result": outcome }));
        success.branch = Some(branch);
        Ok(success)
    }

    /// Loop nodes: execute the body subgraph repeatedly until the stop
    /// condition holds or the iteration ceiling is reached. The ceiling pass
    /// itself executes, and exhausting it is still a success, flagged.
    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        node: &Node,
        stop_condition: &str,
        max_iterations: Option<u32>,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        ctx: &ContextStore,
        config: &EngineConfig,
        emitter: &EventEmitter,
    ) -> Result<NodeSuccess, NodeFailure> {
        let body = plan
            .loop_body(&node.id)
            .ok_or_else(|| NodeFailure::new(format!("loop '{}' has no resolved body", node.id)))?;
        let compiled =
            CompiledExpr::compile(stop_condition).map_err(|e| NodeFailure::new(e.to_string()))?;
        let ceiling = max_iterations
            .unwrap_or_else(|| config.default_loop_ceiling())
            .max(1);

        let mut usage = Usage::default();
        let mut ceiling_hit = false;
        let mut iterations = 0;
        let mut final_pass: BTreeMap<String, Value> = BTreeMap::new();

        for iteration in 1..=ceiling {
            iterations = iteration;
            emitter.emit(RunEvent::LoopIteration {
                node_id: node.id.clone(),
                iteration,
            });

            // One body pass, in validated order, with branch liveness scoped
            // to the body subgraph. Body failures fail the loop as a whole.
            let mut dispositions: HashMap<String, NodeDisposition> = HashMap::new();
            let mut pass_outputs: BTreeMap<String, Value> = BTreeMap::new();
            for body_node_id in &body.dispatch_order {
                if !plan.node_is_live(body_node_id, &dispositions, Some(&body.members)) {
                    dispositions.insert(body_node_id.clone(), NodeDisposition::Skipped);
                    continue;
                }
                let body_node = workflow.node(body_node_id).ok_or_else(|| {
                    NodeFailure::new(format!("body node '{}' missing", body_node_id))
                })?;
                match self
                    .dispatch_boxed(body_node, workflow, plan, ctx, config, emitter)
                    .await
                {
                    Ok(success) => {
                        ctx.record_output(body_node_id, success.output.clone());
                        usage.absorb(&success.usage);
                        pass_outputs.insert(body_node_id.clone(), success.output);
                        dispositions.insert(
                            body_node_id.clone(),
                            NodeDisposition::Succeeded {
                                branch: success.branch,
                            },
                        );
                    }
                    Err(failure) => {
                        return Err(NodeFailure::new(format!(
                            "iteration {} of loop '{}' failed at node '{}': {}",
                            iteration, node.id, body_node_id, failure.message
                        )));
                    }
                }
            }
            final_pass = pass_outputs;

            let scope = Scope::new()
                .with("iteration", json!(iteration))
                .with("input", ctx.input())
                .with("context", ctx.as_value());
            let stop = compiled
                .eval_bool(&scope)
                .map_err(|e| NodeFailure::new(e.to_string()))?;
            if stop {
                break;
            }
            if iteration == ceiling {
                ceiling_hit = true;
            }
        }

        let mut success = NodeSuccess::new(json!({
            "iterations": iterations,
            "ceilingHit": ceiling_hit,
            "context": Value::Object(final_pass.into_iter().collect()),
        }));
        success.usage = usage;
        Ok(success)
    }

    async fn run_team(
        &self,
        node: &Node,
        members: &[team::TeamMember],
        coordinator: Option<&str>,
        budget: Option<f64>,
        ctx: &ContextStore,
        emitter: &EventEmitter,
    ) -> Result<NodeSuccess, NodeFailure> {
        let result = team::run_team(
            &node.id,
            members,
            coordinator,
            budget,
            self.tools.clone(),
            ctx,
            emitter,
        )
        .await
        .map_err(NodeFailure::new)?;

        let usage = result.usage.clone();
        let output = serde_json::to_value(&result).map_err(|e| NodeFailure::new(e.to_string()))?;
        let mut success = NodeSuccess::new(output);
        success.usage = usage;
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NoSecrets, ToolOutput};
    use crate::flow::model::{Edge, RetryPolicy, Workflow};
    use crate::flow::validate::validate;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedInvoker {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, tool_id: &str, args: Value) -> anyhow::Result<ToolOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                anyhow::bail!("transient failure on call {}", call);
            }
            Ok(ToolOutput::new(json!({
                "tool": tool_id,
                "args": args,
                "call": call,
            })))
        }

        fn args_schema(&self, tool_id: &str) -> Option<Value> {
            if tool_id == "strict" {
                Some(json!({
                    "type": "object",
                    "required": ["url"],
                    "properties": { "url": { "type": "string" } }
                }))
            } else {
                None
            }
        }
    }

    fn tool_node(id: &str, tool_id: &str, args: Value) -> Node {
        Node {
            id: id.to_string(),
            config: NodeConfig::Tool {
                tool_id: tool_id.to_string(),
                args,
                secrets: Default::default(),
            },
            policy: None,
        }
    }

    fn test_bed(nodes: Vec<Node>, edges: Vec<Edge>) -> (Workflow, ExecutionPlan) {
        let workflow = Workflow {
            id: "wf".to_string(),
            version: 1,
            nodes,
            edges,
            config: None,
        };
        let plan = validate(&workflow).unwrap();
        (workflow, plan)
    }

    fn fast_config(attempts: u32) -> EngineConfig {
        EngineConfig {
            max_attempts: Some(attempts),
            retry_strategy: crate::core::config::RetryStrategy::Immediate,
            ..Default::default()
        }
    }

    struct StaticSecrets;

    #[async_trait]
    impl crate::capability::SecretResolver for StaticSecrets {
        async fn resolve(&self, name: &str) -> anyhow::Result<String> {
            match name {
                "API_KEY" => Ok("sk-test-123".to_string()),
                other => anyhow::bail!("unknown secret '{}'", other),
            }
        }
    }

    #[tokio::test]
    async fn secrets_are_injected_into_tool_args() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(StaticSecrets));
        let mut node = tool_node("n1", "echo", json!({"query": "hello"}));
        if let NodeConfig::Tool { secrets, .. } = &mut node.config {
            secrets.insert("apiKey".to_string(), "API_KEY".to_string());
        }
        let (workflow, plan) = test_bed(vec![node], vec![]);
        let ctx = ContextStore::new();

        let success = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(success.output["args"]["apiKey"], json!("sk-test-123"));
        assert_eq!(success.output["args"]["query"], json!("hello"));
    }

    #[tokio::test]
    async fn missing_secret_is_a_node_failure() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker.clone(), Arc::new(StaticSecrets));
        let mut node = tool_node("n1", "echo", json!({}));
        if let NodeConfig::Tool { secrets, .. } = &mut node.config {
            secrets.insert("token".to_string(), "MISSING".to_string());
        }
        let (workflow, plan) = test_bed(vec![node], vec![]);
        let ctx = ContextStore::new();

        let failure = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(failure.message.contains("MISSING"));
        // The tool itself was never invoked.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tool_retries_then_succeeds() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(NoSecrets));
        let (workflow, plan) = test_bed(vec![tool_node("n1", "echo", json!({}))], vec![]);
        let ctx = ContextStore::new();

        let success = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(2),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(success.attempts, 2);
    }

    #[tokio::test]
    async fn tool_exhausts_attempts_and_fails() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(NoSecrets));
        let (workflow, plan) = test_bed(vec![tool_node("n1", "echo", json!({}))], vec![]);
        let ctx = ContextStore::new();

        let failure = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(failure.message.contains("after 1 attempts"));
    }

    #[tokio::test]
    async fn schema_violation_is_a_node_failure() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(NoSecrets));
        let (workflow, plan) = test_bed(
            vec![tool_node("n1", "strict", json!({"not_url": 1}))],
            vec![],
        );
        let ctx = ContextStore::new();

        let failure = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(failure.message.contains("failed validation"));
    }

    #[tokio::test]
    async fn condition_selects_branch_from_context() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(NoSecrets));
        let gate = Node {
            id: "gate".to_string(),
            config: NodeConfig::Condition {
                expression: "context.n1.score > 10".to_string(),
            },
            policy: None,
        };
        let (workflow, plan) = test_bed(
            vec![gate, tool_node("yes", "echo", json!({})), tool_node("no", "echo", json!({}))],
            vec![
                Edge::labeled("gate", "yes", EdgeLabel::True),
                Edge::labeled("gate", "no", EdgeLabel::False),
            ],
        );
        let ctx = ContextStore::new();
        ctx.record_output("n1", json!({"score": 40}));

        let success = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(success.branch, Some(EdgeLabel::True));
        assert_eq!(success.output, json!({"result": true}));
    }

    #[tokio::test]
    async fn loop_stops_when_condition_holds() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker, Arc::new(NoSecrets));
        let looper = Node {
            id: "refine".to_string(),
            config: NodeConfig::Loop {
                stop_condition: "iteration >= 3".to_string(),
                max_iterations: Some(10),
                body_start: None,
            },
            policy: None,
        };
        let (workflow, plan) = test_bed(
            vec![looper, tool_node("work", "echo", json!({}))],
            vec![
                Edge::new("refine", "work"),
                Edge::labeled("work", "refine", EdgeLabel::LoopBack),
            ],
        );
        let ctx = ContextStore::new();

        let success = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(success.output["iterations"], json!(3));
        assert_eq!(success.output["ceilingHit"], json!(false));
    }

    #[tokio::test]
    async fn loop_reports_ceiling_hit() {
        let invoker = Arc::new(ScriptedInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(invoker.clone(), Arc::new(NoSecrets));
        let looper = Node {
            id: "refine".to_string(),
            config: NodeConfig::Loop {
                stop_condition: "false".to_string(),
                max_iterations: Some(5),
                body_start: None,
            },
            policy: None,
        };
        let (workflow, plan) = test_bed(
            vec![looper, tool_node("work", "echo", json!({}))],
            vec![
                Edge::new("refine", "work"),
                Edge::labeled("work", "refine", EdgeLabel::LoopBack),
            ],
        );
        let ctx = ContextStore::new();

        let success = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(success.output["iterations"], json!(5));
        assert_eq!(success.output["ceilingHit"], json!(true));
        // The ceiling pass itself executed.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn node_timeout_is_enforced() {
        struct SlowInvoker;

        #[async_trait]
        impl ToolInvoker for SlowInvoker {
            async fn invoke(&self, _tool_id: &str, _args: Value) -> anyhow::Result<ToolOutput> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::new(Value::Null))
            }
        }

        let dispatcher = Dispatcher::new(Arc::new(SlowInvoker), Arc::new(NoSecrets));
        let mut node = tool_node("n1", "slow", json!({}));
        node.policy = Some(RetryPolicy {
            max_attempts: Some(1),
            timeout_seconds: Some(1),
        });
        let (workflow, plan) = test_bed(vec![node], vec![]);
        let ctx = ContextStore::new();

        let failure = dispatcher
            .dispatch(
                &workflow.nodes[0],
                &workflow,
                &plan,
                &ctx,
                &fast_config(1),
                &EventEmitter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(failure.message.contains("timed out"));
    }
}
