use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Step '{step}' failed for {trace_id}: {message}")]
    Step {
        trace_id: String,
        step: String,
        message: String,
    },

    #[error("Retry requested by '{step}' for {trace_id}: {reason}")]
    Retry {
        trace_id: String,
        step: String,
        reason: String,
    },

    #[error("Flow {trace_id} terminated: {reason}")]
    Terminated { trace_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether the delivery layer should redeliver the message that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Retry { .. } | FlowError::Store(_))
    }
}

/// Failure raised from inside a step's own logic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// Application failure. Recorded and propagated downstream to the next error handler.
    #[error("{0}")]
    User(String),

    /// Ask the delivery layer to redeliver later.
    #[error("retry: {0}")]
    Retry(String),

    /// Abort the whole flow instance.
    #[error("terminal: {0}")]
    Terminal(String),

    /// Stop the current branch quietly. Never surfaced.
    #[error("local termination")]
    LocalTermination,
}

impl StepError {
    pub fn user(message: impl std::fmt::Display) -> Self {
        StepError::User(message.to_string())
    }

    pub fn retry(reason: impl std::fmt::Display) -> Self {
        StepError::Retry(reason.to_string())
    }

    pub fn terminal(reason: impl std::fmt::Display) -> Self {
        StepError::Terminal(reason.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::User(format!("serialization: {}", err))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    #[error("Node '{0}' has no id and strict ids are enabled")]
    MissingId(String),

    #[error("Duplicate node id: {0}")]
    DuplicateId(String),

    #[error("Call type '{call_type}' already routed to '{existing}', cannot route it to '{step}'")]
    DuplicateCallType {
        call_type: String,
        existing: String,
        step: String,
    },

    #[error("Call type '{0}' uses the reserved '#' separator")]
    ReservedCallType(String),

    #[error("Join '{0}' has no branches")]
    EmptyBranches(String),

    #[error("Invalid trace id pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Join '{step}' has {branches} branches but {triggers} triggers")]
    TriggerCountMismatch {
        step: String,
        branches: usize,
        triggers: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No route for call type: {0}")]
    UnknownCallType(String),

    #[error("Step not registered: {0}")]
    UnknownStep(String),

    #[error("Message for '{got}' does not match expected step {expected:?} of {trace_id}")]
    UnexpectedStep {
        trace_id: String,
        expected: Option<String>,
        got: String,
    },

    #[error("Duplicate delivery to '{step}' for {trace_id}")]
    Duplicate { trace_id: String, step: String },

    #[error("Flow {0} already finished")]
    AlreadyFinished(String),

    #[error("Flow {trace_id} was never started before '{step}'")]
    NotStarted { trace_id: String, step: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}
