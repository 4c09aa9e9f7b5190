use dflowcore::{Checkpoint, StepError, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type MapFn = Arc<dyn Fn(&mut Checkpoint, Value) -> Result<Value, StepError> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&mut Checkpoint, Value) -> Result<Flow, StepError> + Send + Sync>;
pub type HookFn = Arc<dyn Fn(&mut Checkpoint) -> Result<(), StepError> + Send + Sync>;
pub type TriggerFn = Arc<dyn Fn(&Checkpoint) -> Result<(), StepError> + Send + Sync>;
pub type CombineFn = Arc<dyn Fn(&mut Checkpoint, Vec<Value>) -> Result<Value, StepError> + Send + Sync>;
pub type JudgeFn = Arc<dyn Fn(&mut Checkpoint, OrResult) -> Result<Value, StepError> + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&mut Checkpoint) -> Result<Value, StepError> + Send + Sync>;
/// Stand-in result for a node in test mode. `None` runs the node for real.
pub type MockFn = Arc<dyn Fn(&mut Checkpoint) -> Result<Option<Value>, StepError> + Send + Sync>;

/// Winning branch of a race, handed to the judger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrResult {
    pub index: usize,
    pub data: Value,
}

/// Synchronization mode of an n-way join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    /// Wait for every branch (AND-merge).
    All,
    /// First successful arrival wins (OR-latch).
    First,
}

#[derive(Clone)]
pub(crate) enum FlowKind {
    Constant(Value),
    Map(MapFn),
    FlatMap(FlatMapFn),
    Call {
        call_type: String,
        on_init: Option<HookFn>,
    },
    Delay {
        millis: u64,
        value: Option<Value>,
    },
    MultiCall {
        call_types: Vec<String>,
        mode: JoinMode,
        on_init: Option<HookFn>,
    },
    Zip {
        branches: Vec<Flow>,
        triggers: Vec<TriggerFn>,
        combiner: CombineFn,
    },
    Or {
        branches: Vec<Flow>,
        triggers: Vec<TriggerFn>,
        judger: JudgeFn,
    },
}

impl FlowKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            FlowKind::Constant(_) => "just",
            FlowKind::Map(_) => "map",
            FlowKind::FlatMap(_) => "flatmap",
            FlowKind::Call { .. } => "call",
            FlowKind::Delay { .. } => "delay",
            FlowKind::MultiCall { .. } => "multicall",
            FlowKind::Zip { .. } => "zip",
            FlowKind::Or { .. } => "or",
        }
    }
}

/// Declarative description of a computation graph.
///
/// A `Flow` is a chain ending at its terminal node; each node owns its
/// upstream. Nothing runs until the flow is installed on an engine.
///
/// ```ignore
/// let flow = Flow::just(5)
///     .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
///     .await_call("approve")
///     .id("approve")
///     .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
/// ```
#[derive(Clone)]
pub struct Flow {
    pub(crate) id: Option<String>,
    pub(crate) debug_name: Option<String>,
    pub(crate) kind: FlowKind,
    pub(crate) upstream: Option<Box<Flow>>,
    pub(crate) on_error: Option<ErrorFn>,
    pub(crate) mock: Option<MockFn>,
}

impl Flow {
    fn source(kind: FlowKind) -> Self {
        Self {
            id: None,
            debug_name: None,
            kind,
            upstream: None,
            on_error: None,
            mock: None,
        }
    }

    fn then(self, kind: FlowKind) -> Self {
        Self {
            id: None,
            debug_name: None,
            kind,
            upstream: Some(Box::new(self)),
            on_error: None,
            mock: None,
        }
    }

    /// Emit a fixed value.
    pub fn just(value: impl Into<Value>) -> Self {
        Self::source(FlowKind::Constant(value.into()))
    }

    /// Start from an external callback. The payload becomes the value.
    pub fn from_call(call_type: impl Into<String>) -> Self {
        Self::source(FlowKind::Call {
            call_type: call_type.into(),
            on_init: None,
        })
    }

    /// Like [`Flow::from_call`], running `hook` when the checkpoint is created.
    pub fn from_call_with<F>(call_type: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut Checkpoint) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self::source(FlowKind::Call {
            call_type: call_type.into(),
            on_init: Some(Arc::new(hook)),
        })
    }

    /// Emit `value` once `millis` have elapsed.
    pub fn delay(value: impl Into<Value>, millis: u64) -> Self {
        Self::source(FlowKind::Delay {
            millis,
            value: Some(value.into()),
        })
    }

    /// Wait for every listed callback. Emits the payloads in declared order.
    pub fn from_calls<I, S>(call_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::multi(call_types, JoinMode::All, None)
    }

    pub fn from_calls_with<I, S, F>(call_types: I, hook: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut Checkpoint) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self::multi(call_types, JoinMode::All, Some(Arc::new(hook)))
    }

    /// Wait for the first of the listed callbacks.
    pub fn from_any_call<I, S>(call_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::multi(call_types, JoinMode::First, None)
    }

    fn multi<I, S>(call_types: I, mode: JoinMode, on_init: Option<HookFn>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::source(FlowKind::MultiCall {
            call_types: call_types.into_iter().map(Into::into).collect(),
            mode,
            on_init,
        })
    }

    /// Run every branch and combine their values, in declared order.
    pub fn zip<F>(branches: Vec<Flow>, combiner: F) -> Self
    where
        F: Fn(&mut Checkpoint, Vec<Value>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self::zip_with_triggers(branches, Vec::new(), combiner)
    }

    /// [`Flow::zip`] with one trigger per branch, called with the spawned branch checkpoint.
    pub fn zip_with_triggers<F>(branches: Vec<Flow>, triggers: Vec<TriggerFn>, combiner: F) -> Self
    where
        F: Fn(&mut Checkpoint, Vec<Value>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self::source(FlowKind::Zip {
            branches,
            triggers,
            combiner: Arc::new(combiner),
        })
    }

    /// Race the branches; the judger sees the first successful one.
    pub fn any<F>(branches: Vec<Flow>, judger: F) -> Self
    where
        F: Fn(&mut Checkpoint, OrResult) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self::any_with_triggers(branches, Vec::new(), judger)
    }

    pub fn any_with_triggers<F>(branches: Vec<Flow>, triggers: Vec<TriggerFn>, judger: F) -> Self
    where
        F: Fn(&mut Checkpoint, OrResult) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self::source(FlowKind::Or {
            branches,
            triggers,
            judger: Arc::new(judger),
        })
    }

    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(&mut Checkpoint, Value) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.then(FlowKind::Map(Arc::new(f)))
    }

    /// Build the rest of the computation at runtime from the current value.
    pub fn flat_map<F>(self, f: F) -> Self
    where
        F: Fn(&mut Checkpoint, Value) -> Result<Flow, StepError> + Send + Sync + 'static,
    {
        self.then(FlowKind::FlatMap(Arc::new(f)))
    }

    /// Suspend until the callback arrives, then pass the current value on.
    ///
    /// The callback payload is kept as closure data `"callback"` on this step's frame.
    pub fn await_call(self, call_type: impl Into<String>) -> Self {
        self.then(FlowKind::Call {
            call_type: call_type.into(),
            on_init: None,
        })
    }

    pub fn await_call_with<F>(self, call_type: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut Checkpoint) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.then(FlowKind::Call {
            call_type: call_type.into(),
            on_init: Some(Arc::new(hook)),
        })
    }

    /// Pass the current value on after `millis`.
    pub fn delay_for(self, millis: u64) -> Self {
        self.then(FlowKind::Delay {
            millis,
            value: None,
        })
    }

    /// Stable identity of the last node. Required on every node when strict ids are on.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Human readable name recorded on frames.
    pub fn name(mut self, debug_name: impl Into<String>) -> Self {
        self.debug_name = Some(debug_name.into());
        self
    }

    /// Recover from an upstream or own failure by producing a value.
    pub fn on_error_return<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Checkpoint) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Replace the last node's work in mocked checkpoints while the engine runs in test mode.
    ///
    /// Returning `Ok(None)` lets the node run normally.
    pub fn mock<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Checkpoint) -> Result<Option<Value>, StepError> + Send + Sync + 'static,
    {
        self.mock = Some(Arc::new(f));
        self
    }

    pub fn mock_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.mock(move |_| Ok(Some(value.clone())))
    }
}

/// Wrap a closure as a branch trigger.
pub fn trigger<F>(f: F) -> TriggerFn
where
    F: Fn(&Checkpoint) -> Result<(), StepError> + Send + Sync + 'static,
{
    Arc::new(f)
}
