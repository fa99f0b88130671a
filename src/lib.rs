//! Lattice - a library for executing directed workflow graphs.
//!
//! A workflow is a directed graph of computation nodes: external tool calls,
//! conditional branches, feedback loops, and coordinated multi-agent teams.
//! The engine validates the graph once, steps it in topological order with a
//! checkpoint after every node, evaluates user-authored expressions against a
//! closed namespace, and resumes interrupted runs from their last checkpoint.
//!
//! External collaborators plug in through narrow traits: [`ToolInvoker`] for
//! tools and model backends, [`SecretResolver`] for credentials,
//! [`StateStore`] for checkpoints, and [`EventSink`] for progress streaming.

// Core infrastructure modules
pub mod capability;
pub mod core;

// Execution engine
pub mod expr;
pub mod flow;
pub mod state;
pub mod team;

// Re-exports for convenience
pub use capability::{NoSecrets, SecretResolver, ToolInvoker, ToolOutput, Usage};
pub use crate::core::config::{EngineConfig, RetryStrategy};
pub use crate::core::errors::{EngineError, Result};
pub use crate::core::events::{
    BufferingEventSink, EventEmitter, EventEnvelope, EventSink, LoggingEventSink, RunEvent,
};
pub use expr::{CompiledExpr, ExprError, Scope};
pub use flow::{
    ContextStore, Edge, EdgeLabel, FlowExecutor, Node, NodeConfig, RetryPolicy, RunReport,
    StructuralError, Workflow,
};
pub use state::{ExecutionState, MemoryStateStore, RunStatus, SledStateStore, StateStore};
pub use team::{MemberResult, MemberRole, MemberStatus, TeamMember, TeamResult};
