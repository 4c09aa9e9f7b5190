use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted while flow instances advance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    StepStarted {
        trace_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        trace_id: String,
        step: String,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        trace_id: String,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Suspended {
        trace_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },
    Forwarded {
        trace_id: String,
        machine: String,
        timestamp: DateTime<Utc>,
    },
    FlowFinished {
        trace_id: String,
        failed: bool,
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            FlowEvent::StepStarted { trace_id, .. }
            | FlowEvent::StepCompleted { trace_id, .. }
            | FlowEvent::StepFailed { trace_id, .. }
            | FlowEvent::Suspended { trace_id, .. }
            | FlowEvent::Forwarded { trace_id, .. }
            | FlowEvent::FlowFinished { trace_id, .. } => trace_id,
        }
    }
}

/// Broadcast bus for flow events
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped when nobody listens.
    pub fn emit(&self, event: FlowEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!("No subscriber for event of {}", event.trace_id());
        }
    }

    pub fn step_started(&self, trace_id: &str, step: &str) {
        self.emit(FlowEvent::StepStarted {
            trace_id: trace_id.to_string(),
            step: step.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn step_completed(&self, trace_id: &str, step: &str, duration_ms: i64) {
        self.emit(FlowEvent::StepCompleted {
            trace_id: trace_id.to_string(),
            step: step.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn step_failed(&self, trace_id: &str, step: &str, error: impl Into<String>) {
        self.emit(FlowEvent::StepFailed {
            trace_id: trace_id.to_string(),
            step: step.to_string(),
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn suspended(&self, trace_id: &str, step: &str) {
        self.emit(FlowEvent::Suspended {
            trace_id: trace_id.to_string(),
            step: step.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn forwarded(&self, trace_id: &str, machine: &str) {
        self.emit(FlowEvent::Forwarded {
            trace_id: trace_id.to_string(),
            machine: machine.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn flow_finished(&self, trace_id: &str, failed: bool) {
        self.emit(FlowEvent::FlowFinished {
            trace_id: trace_id.to_string(),
            failed,
            timestamp: Utc::now(),
        });
    }
}
