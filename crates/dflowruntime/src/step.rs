use crate::flow::{CombineFn, ErrorFn, FlatMapFn, HookFn, JoinMode, JudgeFn, MapFn, MockFn, TriggerFn};
use dflowcore::Value;
use std::fmt;

/// Prefix marking a branch failure inside a join slot.
pub const ERROR_SENTINEL: &str = "_DFLOW_JOIN_ERROR_";

/// Compiled node, dispatched with one exhaustive match in the engine.
#[derive(Clone)]
pub(crate) enum StepKind {
    Constant(Value),
    Map(MapFn),
    FlatMap(FlatMapFn),
    /// `gate` calls pass their input through instead of emitting the payload.
    Call {
        call_type: String,
        on_init: Option<HookFn>,
        gate: bool,
    },
    Delay {
        millis: u64,
        value: Option<Value>,
    },
    /// `fan_in` joins collect the branches of a Zip or Or and never start a flow.
    MultiCall {
        arity: usize,
        mode: JoinMode,
        on_init: Option<HookFn>,
        fan_in: bool,
    },
    Zip(FanOut),
    Or(FanOut),
    /// Terminal step appended to every join branch.
    Forward { call_type: String, slot: usize },
    /// Reads the join result, merges branch globals and applies the user reducer.
    Collect(Reducer),
}

#[derive(Clone)]
pub(crate) struct FanOut {
    pub branches: Vec<String>,
    /// Internal call type each branch reports on, by branch index.
    pub slots: Vec<String>,
    pub join: String,
    pub triggers: Vec<TriggerFn>,
}

#[derive(Clone)]
pub(crate) enum Reducer {
    Combine(CombineFn),
    Judge(JudgeFn),
}

/// A node wired into the routing table.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub debug_name: Option<String>,
    /// Step entered after this one produces its result.
    pub next: Option<String>,
    /// Upstream step, `None` for entry nodes.
    pub source: Option<String>,
    pub(crate) kind: StepKind,
    pub(crate) on_error: Option<ErrorFn>,
    pub(crate) mock: Option<MockFn>,
}

impl Step {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            StepKind::Constant(_) => "just",
            StepKind::Map(_) => "map",
            StepKind::FlatMap(_) => "flatmap",
            StepKind::Call { .. } => "call",
            StepKind::Delay { .. } => "delay",
            StepKind::MultiCall { .. } => "multicall",
            StepKind::Zip(_) => "zip",
            StepKind::Or(_) => "or",
            StepKind::Forward { .. } => "forward",
            StepKind::Collect(_) => "collect",
        }
    }

    /// Shape of the step, used to tell an idempotent re-install from a clashing id.
    pub(crate) fn fingerprint(&self) -> String {
        let detail = match &self.kind {
            StepKind::Call { call_type, gate, .. } => format!("{}:{}", call_type, gate),
            StepKind::MultiCall { arity, mode, .. } => format!("{}:{:?}", arity, mode),
            StepKind::Delay { millis, .. } => millis.to_string(),
            StepKind::Zip(fan) | StepKind::Or(fan) => fan.branches.join(","),
            StepKind::Forward { call_type, .. } => call_type.clone(),
            _ => String::new(),
        };
        format!(
            "{}({})|{:?}|{:?}",
            self.kind_name(),
            detail,
            self.next,
            self.source
        )
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind_name())
            .field("next", &self.next)
            .field("source", &self.source)
            .finish()
    }
}
