//! Multi-agent team orchestration.
//!
//! A team node dispatches its roster concurrently, bounded only by roster
//! size and the cost budget. Budget admission is reservation-based: a member
//! whose estimated share would push the reserved total past the budget is
//! never started, but members already in flight always finish and contribute.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{ToolInvoker, Usage};
use crate::core::events::{EventEmitter, RunEvent};
use crate::flow::context::ContextStore;

/// Role of a member inside its team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberRole {
    Coordinator,
    #[default]
    Member,
}

/// One member of a multi-agent team.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    #[serde(default)]
    pub role: MemberRole,
    /// Tool identifiers this member may invoke; the first is its entry point.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Member input; string values may carry `{{path}}` template references.
    #[serde(default)]
    pub input: Value,
    /// Estimated cost used for budget admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_share: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    Finished,
    Failed,
    /// Not started because the budget would have been exceeded.
    Skipped,
}

/// Result entry for one member, in roster order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResult {
    pub member_id: String,
    pub status: MemberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost: f64,
}

/// Aggregate outcome of a team node. Budget exhaustion is a flag, not a
/// failure: the node still succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamResult {
    pub members: Vec<MemberResult>,
    pub budget_exceeded: bool,
    pub spent: f64,
    pub usage: Usage,
}

impl TeamResult {
    fn empty() -> Self {
        Self {
            members: Vec::new(),
            budget_exceeded: false,
            spent: 0.0,
            usage: Usage::default(),
        }
    }
}

struct MemberOutcome {
    roster_pos: usize,
    result: MemberResult,
    usage: Usage,
}

/// Executes one team node. `Err` is reserved for roster-level configuration
/// problems; individual member failures land in the result entries.
pub async fn run_team(
    team_node: &str,
    members: &[TeamMember],
    coordinator: Option<&str>,
    budget: Option<f64>,
    tools: Arc<dyn ToolInvoker>,
    ctx: &ContextStore,
    emitter: &EventEmitter,
) -> Result<TeamResult, String> {
    if members.is_empty() {
        return Ok(TeamResult::empty());
    }

    let coordinator_pos = match coordinator {
        Some(id) => Some(
            members
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| format!("coordinator '{}' is not in the roster", id))?,
        ),
        None => None,
    };

    let mut result = TeamResult::empty();
    let mut entries: Vec<Option<MemberResult>> = vec![None; members.len()];
    let mut reserved = 0.0_f64;

    // The coordinator (when named) runs first; its output becomes part of
    // every other member's input snapshot.
    let mut coordinator_output: Option<Value> = None;
    if let Some(pos) = coordinator_pos {
        let member = &members[pos];
        let estimate = member.budget_share.unwrap_or(0.0);
        if over_budget(budget, reserved, estimate) {
            result.budget_exceeded = true;
            emitter.emit(RunEvent::MemberSkipped {
                team_node: team_node.to_string(),
                member_id: member.id.clone(),
                projected_cost: reserved + estimate,
            });
            entries[pos] = Some(skipped(member));
        } else {
            reserved += estimate;
            emitter.emit(RunEvent::MemberStarted {
                team_node: team_node.to_string(),
                member_id: member.id.clone(),
            });
            let outcome = run_member(pos, member, None, tools.clone(), ctx, emitter, team_node)
                .await;
            result.spent += outcome.result.cost;
            result.usage.absorb(&outcome.usage);
            if outcome.result.status == MemberStatus::Finished {
                coordinator_output = outcome.result.output.clone();
            }
            entries[pos] = Some(outcome.result);
        }
    }

    // Admission pass: every member whose reservation fits starts now; once
    // the budget trips, no further member is dispatched.
    let mut in_flight = FuturesUnordered::new();
    for (pos, member) in members.iter().enumerate() {
        if Some(pos) == coordinator_pos {
            continue;
        }
        let estimate = member.budget_share.unwrap_or(0.0);
        if result.budget_exceeded || over_budget(budget, reserved, estimate) {
            if !result.budget_exceeded {
                warn!(
                    team_node,
                    member_id = %member.id,
                    projected = reserved + estimate,
                    "team budget exceeded; not dispatching further members"
                );
            }
            result.budget_exceeded = true;
            emitter.emit(RunEvent::MemberSkipped {
                team_node: team_node.to_string(),
                member_id: member.id.clone(),
                projected_cost: reserved + estimate,
            });
            entries[pos] = Some(skipped(member));
            continue;
        }
        reserved += estimate;
        emitter.emit(RunEvent::MemberStarted {
            team_node: team_node.to_string(),
            member_id: member.id.clone(),
        });
        in_flight.push(run_member(
            pos,
            member,
            coordinator_output.clone(),
            tools.clone(),
            ctx,
            emitter,
            team_node,
        ));
    }

    // Members already in flight always join; a failure never aborts siblings.
    while let Some(outcome) = in_flight.next().await {
        result.spent += outcome.result.cost;
        result.usage.absorb(&outcome.usage);
        entries[outcome.roster_pos] = Some(outcome.result);
    }

    result.members = entries.into_iter().flatten().collect();
    Ok(result)
}

fn over_budget(budget: Option<f64>, reserved: f64, estimate: f64) -> bool {
    match budget {
        Some(limit) => reserved + estimate > limit,
        None => false,
    }
}

fn skipped(member: &TeamMember) -> MemberResult {
    MemberResult {
        member_id: member.id.clone(),
        status: MemberStatus::Skipped,
        output: None,
        error: None,
        cost: 0.0,
    }
}

async fn run_member(
    roster_pos: usize,
    member: &TeamMember,
    coordinator_output: Option<Value>,
    tools: Arc<dyn ToolInvoker>,
    ctx: &ContextStore,
    emitter: &EventEmitter,
    team_node: &str,
) -> MemberOutcome {
    let failure = |error: String, emitter: &EventEmitter| {
        emitter.emit(RunEvent::MemberFailed {
            team_node: team_node.to_string(),
            member_id: member.id.clone(),
            error: error.clone(),
        });
        MemberOutcome {
            roster_pos,
            result: MemberResult {
                member_id: member.id.clone(),
                status: MemberStatus::Failed,
                output: None,
                error: Some(error),
                cost: 0.0,
            },
            usage: Usage::default(),
        }
    };

    let capability = match member.capabilities.first() {
        Some(capability) => capability.clone(),
        None => return failure(format!("member '{}' has no capabilities", member.id), emitter),
    };

    // Immutable input snapshot: resolved once, before dispatch. Members never
    // share mutable state; outputs merge after joining.
    let mut input = match ctx.resolve_template_value(&member.input) {
        Ok(input) => input,
        Err(err) => return failure(err.to_string(), emitter),
    };
    if let Some(coordination) = coordinator_output {
        match &mut input {
            Value::Object(map) => {
                map.insert("coordinator".to_string(), coordination);
            }
            Value::Null => {
                input = serde_json::json!({ "coordinator": coordination });
            }
            _ => {}
        }
    }

    debug!(team_node, member_id = %member.id, %capability, "dispatching team member");

    match tools.invoke(&capability, input).await {
        Ok(output) => {
            let usage = output.usage.unwrap_or_default();
            let cost = if usage.cost > 0.0 {
                usage.cost
            } else {
                member.budget_share.unwrap_or(0.0)
            };
            emitter.emit(RunEvent::MemberFinished {
                team_node: team_node.to_string(),
                member_id: member.id.clone(),
                cost,
            });
            MemberOutcome {
                roster_pos,
                result: MemberResult {
                    member_id: member.id.clone(),
                    status: MemberStatus::Finished,
                    output: Some(output.output),
                    error: None,
                    cost,
                },
                usage,
            }
        }
        Err(err) => failure(err.to_string(), emitter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ToolOutput;
    use crate::core::events::BufferingEventSink;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInvoker {
        started: AtomicUsize,
        cost: f64,
    }

    #[async_trait]
    impl ToolInvoker for CountingInvoker {
        async fn invoke(&self, tool_id: &str, args: Value) -> anyhow::Result<ToolOutput> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if tool_id == "broken" {
                anyhow::bail!("tool exploded");
            }
            Ok(ToolOutput::new(json!({"tool": tool_id, "args": args})).with_usage(Usage {
                cost: self.cost,
                total_tokens: 10,
                ..Default::default()
            }))
        }
    }

    fn member(id: &str, capability: &str, share: f64) -> TeamMember {
        TeamMember {
            id: id.to_string(),
            role: MemberRole::Member,
            capabilities: vec![capability.to_string()],
            input: json!({}),
            budget_share: Some(share),
        }
    }

    #[tokio::test]
    async fn empty_roster_succeeds_trivially() {
        let invoker = Arc::new(CountingInvoker {
            started: AtomicUsize::new(0),
            cost: 0.0,
        });
        let result = run_team(
            "team",
            &[],
            None,
            Some(100.0),
            invoker,
            &ContextStore::new(),
            &EventEmitter::disabled(),
        )
        .await
        .unwrap();

        assert!(result.members.is_empty());
        assert!(!result.budget_exceeded);
    }

    #[tokio::test]
    async fn third_member_is_not_started_when_budget_trips() {
        let invoker = Arc::new(CountingInvoker {
            started: AtomicUsize::new(0),
            cost: 40.0,
        });
        let roster = vec![
            member("m1", "analyze", 40.0),
            member("m2", "analyze", 40.0),
            member("m3", "analyze", 40.0),
        ];
        let sink = Arc::new(BufferingEventSink::new());
        let emitter = EventEmitter::new(Some(sink.clone()), "exec");

        let result = run_team(
            "team",
            &roster,
            None,
            Some(100.0),
            invoker.clone(),
            &ContextStore::new(),
            &emitter,
        )
        .await
        .unwrap();

        assert!(result.budget_exceeded);
        assert_eq!(invoker.started.load(Ordering::SeqCst), 2);
        assert_eq!(result.members.len(), 3);
        assert_eq!(result.members[0].status, MemberStatus::Finished);
        assert_eq!(result.members[1].status, MemberStatus::Finished);
        assert_eq!(result.members[2].status, MemberStatus::Skipped);
        assert!((result.spent - 80.0).abs() < f64::EPSILON);

        let skipped_events: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.event {
                RunEvent::MemberSkipped {
                    member_id,
                    projected_cost,
                    ..
                } => Some((member_id, projected_cost)),
                _ => None,
            })
            .collect();
        assert_eq!(skipped_events, vec![("m3".to_string(), 120.0)]);
    }

    #[tokio::test]
    async fn member_failure_does_not_abort_siblings() {
        let invoker = Arc::new(CountingInvoker {
            started: AtomicUsize::new(0),
            cost: 1.0,
        });
        let roster = vec![
            member("ok1", "analyze", 1.0),
            member("bad", "broken", 1.0),
            member("ok2", "analyze", 1.0),
        ];

        let result = run_team(
            "team",
            &roster,
            None,
            None,
            invoker,
            &ContextStore::new(),
            &EventEmitter::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(result.members[0].status, MemberStatus::Finished);
        assert_eq!(result.members[1].status, MemberStatus::Failed);
        assert_eq!(
            result.members[1].error.as_deref(),
            Some("tool exploded")
        );
        assert_eq!(result.members[2].status, MemberStatus::Finished);
        assert!(!result.budget_exceeded);
    }

    #[tokio::test]
    async fn coordinator_output_reaches_member_snapshots() {
        let invoker = Arc::new(CountingInvoker {
            started: AtomicUsize::new(0),
            cost: 0.0,
        });
        let mut lead = member("lead", "plan", 0.0);
        lead.role = MemberRole::Coordinator;
        let roster = vec![lead, member("worker", "analyze", 0.0)];

        let result = run_team(
            "team",
            &roster,
            Some("lead"),
            None,
            invoker,
            &ContextStore::new(),
            &EventEmitter::disabled(),
        )
        .await
        .unwrap();

        let worker = &result.members[1];
        let args = worker.output.as_ref().unwrap()["args"].clone();
        assert!(args.get("coordinator").is_some());
    }

    #[tokio::test]
    async fn unknown_coordinator_is_a_roster_error() {
        let invoker = Arc::new(CountingInvoker {
            started: AtomicUsize::new(0),
            cost: 0.0,
        });
        let roster = vec![member("m1", "analyze", 0.0)];
        let err = run_team(
            "team",
            &roster,
            Some("ghost"),
            None,
            invoker,
            &ContextStore::new(),
            &EventEmitter::disabled(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("ghost"));
    }
}
