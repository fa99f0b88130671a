//! Typed lifecycle events emitted during execution.
//!
//! Every event is wrapped in an envelope carrying the execution id, a
//! per-execution monotonic sequence number, and a timestamp, so consumers can
//! reconstruct transition order independent of delivery timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Runtime event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    NodeStarted {
        node_id: String,
    },
    NodeSucceeded {
        node_id: String,
        attempts: u32,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    BranchSelected {
        node_id: String,
        branch: String,
    },
    LoopIteration {
        node_id: String,
        iteration: u32,
    },
    MemberStarted {
        team_node: String,
        member_id: String,
    },
    MemberFinished {
        team_node: String,
        member_id: String,
        cost: f64,
    },
    MemberFailed {
        team_node: String,
        member_id: String,
        error: String,
    },
    MemberSkipped {
        team_node: String,
        member_id: String,
        projected_cost: f64,
    },
    ExecutionCompleted {
        execution_id: String,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: RunEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        tracing::debug!(
            execution_id = %envelope.execution_id,
            sequence = envelope.sequence,
            "event: {:?}",
            envelope.event
        );
    }
}

/// A buffering event sink that collects events for inspection or streaming
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().expect("event buffer poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.write().expect("event buffer poisoned").clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events
            .write()
            .expect("event buffer poisoned")
            .push(envelope.clone());
    }
}

/// Per-execution emitter. Stamps envelopes with a monotonic sequence so event
/// order reflects transition order, then forwards to the configured sink.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
    execution_id: String,
    sequence: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new(sink: Option<Arc<dyn EventSink>>, execution_id: impl Into<String>) -> Self {
        Self {
            sink,
            execution_id: execution_id.into(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An emitter that drops everything; used where no sink is configured.
    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(sink) = &self.sink {
            let envelope = EventEnvelope {
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                execution_id: self.execution_id.clone(),
                timestamp: Utc::now(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let sink = Arc::new(BufferingEventSink::new());
        let emitter = EventEmitter::new(Some(sink.clone()), "exec-1");

        for i in 0..5 {
            emitter.emit(RunEvent::LoopIteration {
                node_id: "l1".to_string(),
                iteration: i,
            });
        }

        let events = sink.events();
        assert_eq!(events.len(), 5);
        for (i, envelope) in events.iter().enumerate() {
            assert_eq!(envelope.sequence, i as u64);
            assert_eq!(envelope.execution_id, "exec-1");
        }
    }

    #[test]
    fn disabled_emitter_is_silent() {
        let emitter = EventEmitter::disabled();
        emitter.emit(RunEvent::ExecutionCompleted {
            execution_id: "exec-1".to_string(),
        });
    }
}
