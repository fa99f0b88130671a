use thiserror::Error;

use crate::flow::context::ContextError;
use crate::flow::validate::StructuralError;
use crate::state::StateError;

/// Unified error type for the lattice engine surface.
///
/// Structural and state errors keep their own enums and convert in; node-level
/// failures never surface here directly because they are offered error-edge
/// routing first and only escalate as `ExecutionFailed`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow failed validation; execution never started.
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Checkpoint persistence failed. Fatal: aborts the run immediately and
    /// is never offered error-edge routing.
    #[error(transparent)]
    State(#[from] StateError),

    #[error("workflow '{0}' is not registered")]
    WorkflowNotFound(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("execution '{execution_id}' is {status} and cannot be resumed")]
    NotResumable {
        execution_id: String,
        status: String,
    },

    #[error("failed to read workflow definition: {0}")]
    Definition(String),
}

impl EngineError {
    pub fn definition(err: impl std::fmt::Display) -> Self {
        EngineError::Definition(err.to_string())
    }
}

impl From<ContextError> for EngineError {
    fn from(err: ContextError) -> Self {
        // A context error at the engine surface means a checkpoint could not
        // be restored; node-level template misses are handled at dispatch.
        EngineError::Definition(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
