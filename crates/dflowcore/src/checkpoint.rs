use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Accumulated error messages of a flow instance. Mergeable across branches.
pub const ERROR_MSG: &str = "ERROR_MSG";
pub const FINISHED: &str = "_FINISHED";
pub const NEXT_STEP: &str = "_NEXTSTEP";
pub const PARENT: &str = "_PARENT";
pub const PINNED: &str = "_PINNED";
pub const FAILED: &str = "_FAILED";
/// Call type a join branch reports its outcome on.
pub const JOIN_SLOT: &str = "_JOINSLOT";
/// Marks a flow instance whose nodes use their mocks when the engine runs in test mode.
pub const MOCK: &str = "_ISMOCK";

/// Next-step hint written once the terminal step has produced its result.
pub const TERMINATED: &str = "TERMINATED";

/// Placeholder between head and tail of a sampled child list.
pub const SAMPLE_GAP: &str = "...";

const RESERVED_KEYS: [&str; 6] = [FINISHED, NEXT_STEP, PARENT, PINNED, FAILED, JOIN_SLOT];

/// Engine-internal global keys. Never copied between branches on merge.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameStatus {
    Begin,
    PrepareSubcall,
    End,
    FailRetry { attempt: u32, reason: String },
    Retrying { attempt: u32, cause: String },
    Error,
}

impl FrameStatus {
    /// A step that has been entered and has not produced its result yet.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, FrameStatus::Begin | FrameStatus::Retrying { .. })
    }

    fn attempt(&self) -> u32 {
        match self {
            FrameStatus::FailRetry { attempt, .. } | FrameStatus::Retrying { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStatus::Begin => write!(f, "BEGIN"),
            FrameStatus::PrepareSubcall => write!(f, "PREPARE_SUBCALL"),
            FrameStatus::End => write!(f, "END"),
            FrameStatus::FailRetry { reason, .. } => write!(f, "FAIL_RETRY:{}", reason),
            FrameStatus::Retrying { attempt, cause } => write!(f, "RETRYING:{}:{}", attempt, cause),
            FrameStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_name: Option<String>,
    pub param: Value,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub ret: Option<Value>,
    pub status: FrameStatus,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_task: Option<Vec<String>>,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<usize>,
    #[serde(default)]
    pub parallel: bool,
    /// Step-local constants that must survive a suspension.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub closure: BTreeMap<String, Map<String, Value>>,
}

// A present `null` is a produced result, an absent field is not.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Frame {
    pub fn new(name: impl Into<String>, param: Value, ip: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            debug_name: None,
            param,
            ret: None,
            status: FrameStatus::Begin,
            ip: ip.into(),
            child_task: None,
            start_time: Utc::now().timestamp_millis(),
            cost_time: None,
            current_index: None,
            total_size: None,
            parallel: false,
            closure: BTreeMap::new(),
        }
    }
}

/// Where a pinned flow instance must be processed, and which sub-graph caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub machine: String,
    pub scope: String,
    pub entry: String,
}

/// Serializable state of one flow instance: a shared global map plus one frame per executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(default)]
    pub global: Map<String, Value>,
    #[serde(default)]
    pub stack: Vec<Frame>,
}

impl Checkpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            global: Map::new(),
            stack: Vec::new(),
        }
    }

    /// Flat string form for stores that only hold text.
    pub fn dump(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn rebuild(dumped: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(dumped)
    }

    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    /// Identity of the most recently entered step.
    pub fn name(&self) -> Option<&str> {
        self.top().map(|f| f.name.as_str())
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Input of the current step.
    pub fn param(&self) -> Value {
        self.top().map(|f| f.param.clone()).unwrap_or(Value::Null)
    }

    /// Output of the current step, once produced.
    pub fn result(&self) -> Option<&Value> {
        self.top().and_then(|f| f.ret.as_ref())
    }

    /// Push a frame for a newly entered step.
    ///
    /// The previous frame's result becomes the new input. When the previous
    /// frame asked for a retry it is popped first, its input is reused and
    /// the new frame is marked as the next retry attempt.
    pub fn push_frame(&mut self, name: &str, debug_name: Option<&str>, ip: &str) -> &mut Frame {
        let retrying = matches!(
            self.top().map(|f| &f.status),
            Some(FrameStatus::FailRetry { .. })
        );

        let (param, status) = match self.stack.pop() {
            Some(stale) if retrying => {
                let cause = match &stale.status {
                    FrameStatus::FailRetry { reason, .. } => reason.clone(),
                    _ => String::new(),
                };
                let status = FrameStatus::Retrying {
                    attempt: stale.status.attempt() + 1,
                    cause,
                };
                (stale.param, status)
            }
            Some(previous) => {
                let param = previous.ret.clone().unwrap_or(Value::Null);
                self.stack.push(previous);
                (param, FrameStatus::Begin)
            }
            None => (Value::Null, FrameStatus::Begin),
        };

        let mut frame = Frame::new(name, param, ip);
        frame.debug_name = debug_name.map(str::to_string);
        frame.status = status;
        self.stack.push(frame);
        let index = self.stack.len() - 1;
        &mut self.stack[index]
    }

    /// Record the current step's result. Returns false when a result was already recorded.
    pub fn set_result(&mut self, value: Value, status: FrameStatus) -> bool {
        let Some(frame) = self.top_mut() else {
            return false;
        };
        if frame.ret.is_some() {
            return false;
        }
        frame.ret = Some(value);
        frame.status = status;
        frame.cost_time = Some(Utc::now().timestamp_millis() - frame.start_time);
        true
    }

    pub fn set_status(&mut self, status: FrameStatus) {
        if let Some(frame) = self.top_mut() {
            frame.status = status;
        }
    }

    /// Mark the current step as waiting for redelivery.
    pub fn mark_retry(&mut self, reason: impl Into<String>) {
        if let Some(frame) = self.top_mut() {
            frame.status = FrameStatus::FailRetry {
                attempt: frame.status.attempt(),
                reason: reason.into(),
            };
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.global
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.global.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.global.get(key).and_then(Value::as_str)
    }

    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.global.insert(key.into(), value);
        Ok(())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        self.global.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.global.remove(key)
    }

    /// Attach a serializable bundle to the current frame.
    pub fn set_closure_data(&mut self, key: impl Into<String>, data: Map<String, Value>) {
        if let Some(frame) = self.top_mut() {
            frame.closure.insert(key.into(), data);
        }
    }

    pub fn closure_data(&self, key: &str) -> Option<&Map<String, Value>> {
        self.top().and_then(|f| f.closure.get(key))
    }

    /// Most recent frame of the named step.
    pub fn frame_named(&self, name: &str) -> Option<&Frame> {
        self.stack.iter().rev().find(|f| f.name == name)
    }

    pub fn frame_by_debug_name(&self, debug_name: &str) -> Option<&Frame> {
        self.stack
            .iter()
            .rev()
            .find(|f| f.debug_name.as_deref() == Some(debug_name))
    }

    pub fn is_finished(&self) -> bool {
        self.global.get(FINISHED).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_finished(&mut self) {
        self.global.insert(FINISHED.to_string(), Value::Bool(true));
    }

    pub fn is_failed(&self) -> bool {
        self.global.get(FAILED).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_failed(&mut self) {
        self.global.insert(FAILED.to_string(), Value::Bool(true));
    }

    pub fn next_step(&self) -> Option<&str> {
        self.get_str(NEXT_STEP)
    }

    pub fn set_next_step(&mut self, step: impl Into<String>) {
        self.global.insert(NEXT_STEP.to_string(), Value::String(step.into()));
    }

    /// Trace id of the checkpoint that spawned this one as a join branch.
    pub fn parent(&self) -> Option<&str> {
        self.get_str(PARENT)
    }

    pub fn set_parent(&mut self, parent: impl Into<String>) {
        self.global.insert(PARENT.to_string(), Value::String(parent.into()));
    }

    pub fn join_slot(&self) -> Option<&str> {
        self.get_str(JOIN_SLOT)
    }

    pub fn set_join_slot(&mut self, call_type: impl Into<String>) {
        self.global.insert(JOIN_SLOT.to_string(), Value::String(call_type.into()));
    }

    pub fn is_mock(&self) -> bool {
        self.global.get(MOCK).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_mock(&mut self) {
        self.global.insert(MOCK.to_string(), Value::Bool(true));
    }

    pub fn unset_mock(&mut self) {
        self.global.remove(MOCK);
    }

    pub fn pin(&self) -> Option<Pin> {
        self.global
            .get(PINNED)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_pin(&mut self, pin: Pin) {
        if let Ok(value) = serde_json::to_value(pin) {
            self.global.insert(PINNED.to_string(), value);
        }
    }

    pub fn unpin(&mut self) {
        self.global.remove(PINNED);
    }

    pub fn append_error(&mut self, step: &str, message: &str) {
        let entry = format!("[{}] {}", step, message);
        let merged = match self.get_str(ERROR_MSG) {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, entry),
            _ => entry,
        };
        self.global.insert(ERROR_MSG.to_string(), Value::String(merged));
    }

    pub fn error_message(&self) -> Option<&str> {
        self.get_str(ERROR_MSG)
    }

    /// Trace id of the `index`-th branch spawned when the stack was `depth` frames deep.
    pub fn child_id(parent: &str, depth: usize, index: usize) -> String {
        format!("{}_{}-{}", parent, depth, index)
    }

    /// Record spawned branches on the current frame, sampling long lists.
    pub fn record_children(&mut self, ids: &[String], sample: usize) {
        if let Some(frame) = self.top_mut() {
            frame.child_task = Some(sample_children(ids, sample));
            frame.total_size = Some(ids.len());
            frame.parallel = true;
        }
    }

    /// Full list of branch trace ids spawned by the nearest fan-out frame.
    pub fn spawned_children(&self) -> Vec<String> {
        self.stack
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.parallel)
            .and_then(|(index, f)| f.total_size.map(|n| (index + 1, n)))
            .map(|(depth, n)| {
                (0..n)
                    .map(|i| Self::child_id(&self.id, depth, i))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Keep `ids` verbatim up to `limit`, otherwise head, gap marker and tail.
pub fn sample_children(ids: &[String], limit: usize) -> Vec<String> {
    if ids.len() <= limit {
        return ids.to_vec();
    }
    match (ids.first(), ids.last()) {
        (Some(head), Some(tail)) => vec![head.clone(), SAMPLE_GAP.to_string(), tail.clone()],
        _ => Vec::new(),
    }
}

/// Merge branch globals into `target` in declared branch order.
///
/// Reserved keys are skipped, values inherited unchanged from `target` are
/// skipped, and a key that is already taken with a different value is kept
/// under the first free `key0`, `key1`, ... name.
pub fn merge_branch_globals(target: &mut Map<String, Value>, branches: &[Map<String, Value>]) {
    let inherited = target.clone();
    for branch in branches {
        for (key, value) in branch {
            if is_reserved_key(key) || inherited.get(key) == Some(value) {
                continue;
            }
            match target.get(key) {
                None => {
                    target.insert(key.clone(), value.clone());
                }
                Some(existing) if existing == value => {}
                Some(_) => {
                    let mut suffix = 0usize;
                    loop {
                        let candidate = format!("{}{}", key, suffix);
                        if !target.contains_key(&candidate) {
                            target.insert(candidate, value.clone());
                            break;
                        }
                        suffix += 1;
                    }
                }
            }
        }
    }
}
