
mod base;

pub use base::{EventBus, FlowEvent};
