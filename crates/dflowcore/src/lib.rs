//! Core abstractions for the dflow engine
//!
//! Checkpoint data model, error taxonomy, event bus and the collaborator
//! traits (stores, scheduler, forwarding) the runtime is written against.
//! No engine logic lives here.

mod checkpoint;
mod error;
pub mod events;
mod store;

pub use checkpoint::{
    is_reserved_key, merge_branch_globals, sample_children, Checkpoint, Frame, FrameStatus, Pin,
    ERROR_MSG, FAILED, FINISHED, JOIN_SLOT, MOCK, NEXT_STEP, PARENT, PINNED, SAMPLE_GAP, TERMINATED,
};
pub use error::{ConstructionError, FlowError, RoutingError, StepError, StoreError};
pub use events::*;
pub use store::{ContextStore, CounterStore, DelayScheduler, Forwarder, InboundMessage, StepChannel};

/// Values flowing between steps
pub use serde_json::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
