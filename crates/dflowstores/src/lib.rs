//! Collaborator implementations
//!
//! In-memory context and counter stores, a tokio timer scheduler, an
//! in-process step channel and an HTTP forwarder.

mod channel;
mod delay;
mod http;
mod memory;

pub use channel::ChannelStepTransport;
pub use delay::TokioDelayScheduler;
pub use http::HttpForwarder;
pub use memory::{InMemoryContextStore, InMemoryCounterStore};
