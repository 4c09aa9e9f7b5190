//! Fan-out, n-way joins and the collectors behind Zip and Or.
//!
//! Join state lives in the counter store under `join:{step}:{trace}:{frame}`,
//! scoped to the frame of one entry into the join step: the arrival counter
//! (or the race latch) itself, one slot and one claim counter per branch,
//! and a failure counter used by races. Filled slots carry a one-character
//! prefix, so a payload of `null` is never mistaken for an empty slot.

use crate::engine::Engine;
use crate::flow::{JoinMode, OrResult};
use crate::step::{FanOut, Reducer, Step, StepKind, ERROR_SENTINEL};
use dflowcore::{merge_branch_globals, Checkpoint, FlowError, FrameStatus, RoutingError, StepError, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const FILLED: char = '+';

/// Rounds an arrival waits for a concurrent arrival to create the checkpoint.
const CREATE_WAIT_ROUNDS: usize = 200;
const CREATE_WAIT_STEP: Duration = Duration::from_millis(5);

fn join_key(step: &str, trace_id: &str, frame_id: &str) -> String {
    format!("join:{}:{}:{}", step, trace_id, frame_id)
}

fn create_key(step: &str, trace_id: &str) -> String {
    format!("create:{}:{}", step, trace_id)
}

fn slot_key(join: &str, slot: usize) -> String {
    format!("{}:slot{}", join, slot)
}

fn claim_key(join: &str, slot: usize) -> String {
    format!("{}:claim{}", join, slot)
}

fn failed_key(join: &str) -> String {
    format!("{}:failed", join)
}

fn fill(payload: &str) -> String {
    format!("{}{}", FILLED, payload)
}

enum Slot {
    Value(Value),
    Failed(String),
    Empty,
}

fn decode_slot(raw: &Value) -> Slot {
    match raw {
        Value::Null => Slot::Empty,
        Value::String(s) => match s.strip_prefix(ERROR_SENTINEL) {
            Some(reason) => Slot::Failed(reason.to_string()),
            None => Slot::Value(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))),
        },
        other => Slot::Value(other.clone()),
    }
}

impl Engine {
    /// Enter the join, then spawn one child checkpoint per branch.
    pub(crate) async fn fan_out(&self, step: &Step, mut cp: Checkpoint, fan: &FanOut) -> Result<bool, FlowError> {
        let param = cp.param();
        cp.set_result(param.clone(), FrameStatus::PrepareSubcall);
        self.save(&cp).await?;
        self.gauge_down(&step.name).await;

        let join = self.step(&fan.join).await?;
        self.enter(join, &cp.id).await?;

        let mut parent = self.require(&cp.id, &step.name).await?;
        let depth = parent.depth();
        let ids: Vec<String> = (0..fan.branches.len())
            .map(|i| Checkpoint::child_id(&parent.id, depth, i))
            .collect();
        parent.record_children(&ids, self.inner.config.child_task_sample);
        self.save(&parent).await?;
        info!("{} spawns {} branches for {}", step.name, ids.len(), parent.id);

        let mut deferred = None;
        for (i, entry) in fan.branches.iter().enumerate() {
            let mut child = parent.clone();
            child.id = ids[i].clone();
            child.set_parent(parent.id.clone());
            child.set_join_slot(fan.slots[i].clone());
            if let Some(frame) = child.top_mut() {
                frame.status = FrameStatus::PrepareSubcall;
                frame.current_index = Some(i);
                frame.ret = Some(param.clone());
                frame.parallel = false;
                frame.child_task = None;
                frame.total_size = None;
            }
            self.save(&child).await?;

            let entry = self.step(entry).await?;
            match self.enter(entry, &child.id).await {
                Ok(_) => {}
                Err(e @ FlowError::Step { .. }) => debug!("Branch {} failed: {}", child.id, e),
                Err(e) => {
                    warn!("Branch {} of {} stopped: {}", child.id, parent.id, e);
                    deferred.get_or_insert(e);
                }
            }
        }

        for (i, trigger) in fan.triggers.iter().enumerate() {
            match self.load(&ids[i]).await? {
                Some(child) => {
                    if let Err(e) = trigger(&child) {
                        warn!("Trigger of branch {} failed: {}", child.id, e);
                    }
                }
                None => warn!("Branch {} vanished before its trigger ran", ids[i]),
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Report a branch outcome to its join and stop the branch.
    pub(crate) async fn forward_branch(
        &self,
        step: &Step,
        mut cp: Checkpoint,
        call_type: &str,
        outcome: Result<Value, String>,
    ) -> Result<bool, FlowError> {
        let Some(parent) = cp.parent().map(str::to_string) else {
            return Err(RoutingError::UnexpectedStep {
                trace_id: cp.id.clone(),
                expected: None,
                got: step.name.clone(),
            }
            .into());
        };

        let (payload, value) = match outcome {
            Ok(value) => (serde_json::to_string(&value)?, value),
            Err(reason) => (format!("{}{}", ERROR_SENTINEL, reason), Value::Null),
        };
        if let StepKind::Forward { slot, .. } = &step.kind {
            debug!("Branch {} reports to slot {} of {}", cp.id, slot, parent);
        }

        cp.set_result(value, FrameStatus::End);
        cp.set_finished();
        self.save(&cp).await?;
        self.gauge_down(&step.name).await;
        self.inner.router.release(&cp.id).await;

        self.deliver(call_type, &payload, &parent).await?;
        Ok(true)
    }

    /// One arrival at a MultiCall join.
    pub(crate) async fn arrive(
        &self,
        step: &Arc<Step>,
        trace_id: &str,
        slot: usize,
        payload: &str,
    ) -> Result<bool, FlowError> {
        let StepKind::MultiCall { arity, mode, fan_in, .. } = &step.kind else {
            return Err(RoutingError::UnknownStep(step.name.clone()).into());
        };

        let Some(cp) = self.joinable(step, trace_id, *fan_in).await? else {
            warn!("Branch arrived on slot {} of {} after {} was removed", slot, step.name, trace_id);
            return Ok(false);
        };

        let waiting = !cp.is_finished()
            && cp
                .top()
                .map(|f| f.name == step.name && f.status.is_in_progress())
                .unwrap_or(false);
        if !waiting {
            warn!("Late arrival on slot {} of {} for {}", slot, step.name, trace_id);
            return Ok(false);
        }

        let frame_id = cp.top().map(|f| f.id.clone()).unwrap_or_default();
        let key = join_key(&step.name, trace_id, &frame_id);
        let counters = &self.inner.counters;
        let occupied = counters
            .get(&slot_key(&key, slot))
            .await?
            .map(|v| v.starts_with(FILLED))
            .unwrap_or(false);
        if occupied || counters.incr(&claim_key(&key, slot)).await? != 1 {
            debug!("Duplicate arrival on slot {} of {} for {}", slot, step.name, trace_id);
            return Ok(false);
        }

        match mode {
            JoinMode::All => {
                counters.put(&slot_key(&key, slot), &fill(payload)).await?;
                let arrived = counters.incr(&key).await?;
                if arrived < *arity as i64 {
                    debug!("{}/{} arrived at {} for {}", arrived, arity, step.name, trace_id);
                    return Ok(false);
                }
            }
            JoinMode::First if payload.starts_with(ERROR_SENTINEL) => {
                counters.put(&slot_key(&key, slot), &fill(payload)).await?;
                let failed = counters.incr(&failed_key(&key)).await?;
                if failed < *arity as i64 {
                    return Ok(false);
                }
                warn!("Every branch of {} failed for {}", step.name, trace_id);
            }
            // Losers keep their slot so a concurrent tie goes to the lowest index.
            JoinMode::First => {
                counters.put(&slot_key(&key, slot), &fill(payload)).await?;
                if counters.incr(&key).await? != 1 {
                    counters.decr(&key).await?;
                    return Ok(false);
                }
            }
        }

        let values = self.drain_join(&key, *arity).await?;
        info!("{} fired for {}", step.name, trace_id);
        // Reload: the copy read on arrival may predate the init hook's writes.
        let cp = self.require(trace_id, &step.name).await?;
        self.on_return(step, cp, Value::Array(values)).await
    }

    /// Load the checkpoint an arrival joins, creating it for a flow that
    /// starts with this join. While one arrival holds the creation claim the
    /// others wait, so nobody fires on a half-written checkpoint.
    async fn joinable(&self, step: &Arc<Step>, trace_id: &str, fan_in: bool) -> Result<Option<Checkpoint>, FlowError> {
        let counters = &self.inner.counters;
        let key = create_key(&step.name, trace_id);
        for _ in 0..CREATE_WAIT_ROUNDS {
            match self.load(trace_id).await? {
                Some(cp) => {
                    let creating = counters
                        .get(&key)
                        .await?
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0);
                    if creating == 0 {
                        return Ok(Some(cp));
                    }
                }
                None if fan_in => return Ok(None),
                None => {
                    if counters.incr(&key).await? == 1 {
                        let entered = self.enter(step.clone(), trace_id).await;
                        counters.reset(&key).await?;
                        match entered {
                            Ok(_)
                            | Err(FlowError::Routing(RoutingError::Duplicate { .. }))
                            | Err(FlowError::Routing(RoutingError::AlreadyFinished(_))) => {}
                            Err(e) => return Err(e),
                        }
                        return self.require(trace_id, &step.name).await.map(Some);
                    }
                }
            }
            sleep(CREATE_WAIT_STEP).await;
        }
        warn!("{} was not created in time for {}", trace_id, step.name);
        Err(FlowError::Retry {
            trace_id: trace_id.to_string(),
            step: step.name.clone(),
            reason: "checkpoint is being created by another arrival".to_string(),
        })
    }

    /// Read every slot in declared order. Empty slots read as `null`.
    ///
    /// Counters and claims are left as they are so stragglers stay no-ops;
    /// the next entry into the step uses a fresh frame and fresh keys.
    async fn drain_join(&self, key: &str, arity: usize) -> Result<Vec<Value>, FlowError> {
        let mut values = Vec::with_capacity(arity);
        for slot in 0..arity {
            let raw = self.inner.counters.get(&slot_key(key, slot)).await?;
            values.push(match raw.as_deref().and_then(|v| v.strip_prefix(FILLED)) {
                Some(payload) => Value::String(payload.to_string()),
                None => Value::Null,
            });
        }
        Ok(values)
    }

    /// Merge branch state into the parent and apply the combiner or judger.
    pub(crate) async fn collect(&self, step: &Step, mut cp: Checkpoint, reducer: &Reducer) -> Result<bool, FlowError> {
        let slots = match cp.param() {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut branches = Vec::new();
        for id in cp.spawned_children() {
            match self.load(&id).await? {
                Some(child) => branches.push(child.global),
                None => debug!("Branch {} left no checkpoint", id),
            }
        }
        merge_branch_globals(&mut cp.global, &branches);

        let outcome = match reducer {
            Reducer::Combine(combiner) => {
                let mut values = Vec::with_capacity(slots.len());
                let mut failure = None;
                for (i, raw) in slots.iter().enumerate() {
                    match decode_slot(raw) {
                        Slot::Value(v) => values.push(v),
                        Slot::Failed(reason) => {
                            failure = Some(format!("zip failed, branch {} failed: {}", i, reason));
                            break;
                        }
                        Slot::Empty => {
                            failure = Some(format!("zip failed, branch {} produced nothing", i));
                            break;
                        }
                    }
                }
                match failure {
                    Some(reason) => Err(StepError::Terminal(reason)),
                    None => combiner(&mut cp, values),
                }
            }
            Reducer::Judge(judger) => {
                let winner = slots.iter().enumerate().find_map(|(index, raw)| match decode_slot(raw) {
                    Slot::Value(data) => Some(OrResult { index, data }),
                    _ => None,
                });
                match winner {
                    Some(winner) => {
                        debug!("Branch {} won {} for {}", winner.index, step.name, cp.id);
                        judger(&mut cp, winner)
                    }
                    None => Err(StepError::terminal("all branches of the race failed")),
                }
            }
        };

        match outcome {
            Ok(value) => self.on_return(step, cp, value).await,
            Err(e) => self.fail(step, cp, e).await,
        }
    }
}
