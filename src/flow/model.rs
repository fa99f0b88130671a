//! Workflow definition model.
//!
//! Definitions arrive as YAML or JSON. Node configuration is a tagged variant
//! keyed by the node's `type`, so malformed configs are rejected while a
//! definition loads, not when the node dispatches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::config::EngineConfig;
use crate::core::errors::EngineError;
use crate::team::TeamMember;

/// A versioned workflow definition. Immutable once versioned; edits are
/// expected to produce a new version upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Optional overrides merged over the engine defaults at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<EngineConfig>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    pub fn from_yaml(text: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(text).map_err(EngineError::definition)
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(EngineError::definition)?;
        Self::from_yaml(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(EngineError::definition)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RetryPolicy>,
}

impl Node {
    pub fn kind(&self) -> &'static str {
        self.config.kind()
    }

    /// Attempts for this node, falling back to the engine default.
    pub fn max_attempts(&self, config: &EngineConfig) -> u32 {
        self.policy
            .as_ref()
            .and_then(|p| p.max_attempts)
            .unwrap_or_else(|| config.default_attempts())
            .max(1)
    }

    /// Per-node timeout in seconds, falling back to the engine default.
    pub fn timeout_secs(&self, config: &EngineConfig) -> u64 {
        self.policy
            .as_ref()
            .and_then(|p| p.timeout_seconds)
            .unwrap_or_else(|| config.default_node_timeout_secs())
    }
}

/// Type-specific node configuration, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeConfig {
    #[serde(rename_all = "camelCase")]
    Tool {
        tool_id: String,
        /// Arguments; string values may carry `{{path}}` template references.
        #[serde(default)]
        args: Value,
        /// Argument key -> secret name, resolved through the secret backend
        /// at dispatch time and injected into the args object.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        secrets: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Condition { expression: String },
    #[serde(rename_all = "camelCase")]
    Loop {
        stop_condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        /// First node of the loop body. Optional when the body start can be
        /// inferred unambiguously from the graph.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_start: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MultiAgentTeam {
        #[serde(default)]
        members: Vec<TeamMember>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinator: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        budget: Option<f64>,
    },
}

impl NodeConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeConfig::Tool { .. } => "tool",
            NodeConfig::Condition { .. } => "condition",
            NodeConfig::Loop { .. } => "loop",
            NodeConfig::MultiAgentTeam { .. } => "multiAgentTeam",
        }
    }
}

/// Retry and timeout policy for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Semantic edge labels. `loopBack` edges are excluded from scheduling order;
/// the rest route branches and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeLabel {
    True,
    False,
    Error,
    LoopBack,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeLabel::True => "true",
            EdgeLabel::False => "false",
            EdgeLabel::Error => "error",
            EdgeLabel::LoopBack => "loopBack",
        }
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn labeled(
        source: impl Into<String>,
        target: impl Into<String>,
        label: EdgeLabel,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label),
        }
    }
}
