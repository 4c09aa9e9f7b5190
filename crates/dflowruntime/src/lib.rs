//! Flow execution runtime
//!
//! This crate provides the flow builder, the routing table compiled from
//! installed flows, and the message-driven engine that advances flow
//! instances between suspension points.

mod engine;
mod flow;
mod join;
mod router;
mod step;
mod suspend;

pub use engine::{Dispatch, Engine, EngineBuilder, EngineConfig};
pub use flow::{
    trigger, CombineFn, ErrorFn, FlatMapFn, Flow, HookFn, JoinMode, JudgeFn, MapFn, MockFn, OrResult, TriggerFn,
};
pub use router::{Pipeline, Route, Router};
pub use step::{Step, ERROR_SENTINEL};
