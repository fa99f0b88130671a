//! External capability interfaces.
//!
//! Tools and model backends are reachable only through [`ToolInvoker`];
//! credentials only through [`SecretResolver`]. The engine never talks to the
//! outside world any other way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token and cost counters accumulated over all model-backed calls in a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub model: Option<String>,
}

impl Usage {
    /// Folds another usage record into this one. Counters are monotonic for
    /// the life of one execution; the model id keeps the latest reported.
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        if other.model.is_some() {
            self.model = other.model.clone();
        }
    }
}

/// Result of one capability invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: Value,
    /// Present for model-backed calls, absent for plain tools.
    pub usage: Option<Usage>,
}

impl ToolOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Uniform invocation interface for built-in and pluggable capabilities.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_id: &str, args: Value) -> anyhow::Result<ToolOutput>;

    /// Optional JSON Schema for a tool's arguments. When present, the
    /// dispatcher validates resolved args against it before invoking.
    fn args_schema(&self, _tool_id: &str) -> Option<Value> {
        None
    }
}

/// Supplies credentials to tool invocations by name.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> anyhow::Result<String>;
}

/// Resolver for engines with no secret backend; any lookup fails.
pub struct NoSecrets;

#[async_trait]
impl SecretResolver for NoSecrets {
    async fn resolve(&self, name: &str) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("no secret backend configured for '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_absorb_accumulates() {
        let mut total = Usage::default();
        total.absorb(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: 0.25,
            model: Some("alpha".to_string()),
        });
        total.absorb(&Usage {
            prompt_tokens: 2,
            completion_tokens: 3,
            total_tokens: 5,
            cost: 0.05,
            model: None,
        });

        assert_eq!(total.total_tokens, 20);
        assert!((total.cost - 0.30).abs() < f64::EPSILON);
        assert_eq!(total.model.as_deref(), Some("alpha"));
    }
}
