// Core infrastructure modules shared across the engine
pub mod config;
pub mod errors;
pub mod events;

pub use config::{EngineConfig, RetryStrategy};
pub use errors::{EngineError, Result};
pub use events::{
    BufferingEventSink, EventEmitter, EventEnvelope, EventSink, LoggingEventSink, RunEvent,
};
