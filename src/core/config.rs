use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

/// Configuration for retry backoff between node attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_ms(&self, failed_attempts: u32) -> u64 {
        match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64
                    * multiplier.powf(failed_attempts.saturating_sub(1) as f64))
                .round() as u64;
                delay.min(*max_delay_ms)
            }
            RetryStrategy::Linear { delay_ms } => *delay_ms,
            RetryStrategy::Immediate => 0,
        }
    }
}

/// Engine-level execution defaults. A workflow may carry its own config,
/// merged over these via [`EngineConfig::merge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum attempts for a node without an explicit retry policy
    pub max_attempts: Option<u32>,
    /// Default per-node timeout in seconds
    pub node_timeout_seconds: Option<u64>,
    /// Maximum runtime for a whole run in seconds
    pub run_timeout_seconds: Option<u64>,
    /// Iteration ceiling for loops that do not declare `maxIterations`
    pub max_loop_iterations: Option<u32>,
    /// Retry backoff configuration
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            node_timeout_seconds: Some(3600),
            run_timeout_seconds: Some(3600),
            max_loop_iterations: Some(50),
            retry_strategy: RetryStrategy::default(),
        }
    }
}

impl EngineConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(attempts) = self.max_attempts {
            if attempts == 0 {
                return Err(anyhow!("max_attempts must be greater than 0"));
            }
        }

        if let Some(timeout) = self.node_timeout_seconds {
            if timeout == 0 {
                return Err(anyhow!("node_timeout_seconds must be greater than 0"));
            }
        }

        if let Some(timeout) = self.run_timeout_seconds {
            if timeout == 0 {
                return Err(anyhow!("run_timeout_seconds must be greater than 0"));
            }
            if timeout > 86_400 {
                return Err(anyhow!("run_timeout_seconds cannot exceed 24 hours"));
            }
        }

        if let Some(iterations) = self.max_loop_iterations {
            if iterations == 0 {
                return Err(anyhow!("max_loop_iterations must be greater than 0"));
            }
        }

        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self, Error> {
        let merged = Self {
            max_attempts: override_with.max_attempts.or(base.max_attempts),
            node_timeout_seconds: override_with
                .node_timeout_seconds
                .or(base.node_timeout_seconds),
            run_timeout_seconds: override_with
                .run_timeout_seconds
                .or(base.run_timeout_seconds),
            max_loop_iterations: override_with
                .max_loop_iterations
                .or(base.max_loop_iterations),
            retry_strategy: override_with.retry_strategy.clone(),
        };

        merged.validate()?;
        Ok(merged)
    }

    pub fn default_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(1).max(1)
    }

    pub fn default_node_timeout_secs(&self) -> u64 {
        self.node_timeout_seconds.unwrap_or(3600)
    }

    pub fn default_loop_ceiling(&self) -> u32 {
        self.max_loop_iterations.unwrap_or(50).max(1)
    }
}
