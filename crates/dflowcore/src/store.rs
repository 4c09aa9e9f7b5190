use crate::{Checkpoint, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Keyed persistence of checkpoints, one per trace id.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, trace_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn put(&self, trace_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Hint that the flow finished. Backends with TTLs can start expiry here.
    async fn expire(&self, _trace_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove(&self, trace_id: &str) -> Result<(), StoreError>;
}

/// Shared key/value store with per-key atomic counters.
///
/// Every operation must be atomic per key across all processes of the fleet.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically set the counter to zero, returning the previous value.
    async fn reset(&self, key: &str) -> Result<i64, StoreError>;
}

/// Schedules a timer message for `(step, trace_id)` after `timeout_ms`.
#[async_trait]
pub trait DelayScheduler: Send + Sync {
    async fn add_task(&self, step: &str, trace_id: &str, timeout_ms: u64) -> Result<(), StoreError>;
}

/// Hands a raw message to the machine that owns a pinned flow instance.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Returns whether the owning machine accepted the message.
    async fn forward(&self, machine: &str, message: &InboundMessage) -> Result<bool, StoreError>;
}

/// Delivers step-to-step hops when the engine runs in channel dispatch mode.
#[async_trait]
pub trait StepChannel: Send + Sync {
    async fn send(&self, message: InboundMessage) -> Result<bool, StoreError>;
}

/// Everything that can arrive at an engine from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundMessage {
    /// External callback resuming a waiting step.
    Call {
        call_type: String,
        payload: String,
        trace_id: String,
    },
    /// Hop into the named step.
    Step { step: String, trace_id: String },
    /// Timer fired for a delay step.
    Timer { step: String, trace_id: String },
}

impl InboundMessage {
    pub fn trace_id(&self) -> &str {
        match self {
            InboundMessage::Call { trace_id, .. }
            | InboundMessage::Step { trace_id, .. }
            | InboundMessage::Timer { trace_id, .. } => trace_id,
        }
    }
}
