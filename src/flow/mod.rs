//! Workflow graph execution: model, validation, context, dispatch, driver.

pub mod context;
pub mod dispatch;
pub mod executor;
pub mod model;
pub mod validate;

pub use context::{ContextError, ContextStore};
pub use dispatch::{Dispatcher, NodeFailure, NodePhase, NodeSuccess};
pub use executor::{FlowExecutor, RunReport};
pub use model::{Edge, EdgeLabel, Node, NodeConfig, RetryPolicy, Workflow};
pub use validate::{validate, ExecutionPlan, LoopBody, NodeDisposition, StructuralError};
