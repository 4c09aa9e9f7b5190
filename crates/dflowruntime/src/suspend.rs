//! Suspension points: external callbacks, delays, runtime sub-graphs and
//! the machine affinity they imply.

use crate::engine::Engine;
use crate::flow::{FlatMapFn, HookFn};
use crate::step::{Step, StepKind};
use dflowcore::{
    Checkpoint, FlowError, FrameStatus, InboundMessage, Pin, RoutingError, StepError, Value,
};
use serde_json::Map;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Engine {
    /// Deliver an external callback to the step waiting on `call_type`.
    ///
    /// Join slot call types (`...#slotN`) are internal and rejected here.
    pub async fn resume(&self, call_type: &str, payload: &str, trace_id: &str) -> Result<bool, FlowError> {
        if call_type.contains('#') {
            warn!("Rejected internal call type {} for {}", call_type, trace_id);
            return Err(RoutingError::UnknownCallType(call_type.to_string()).into());
        }
        self.deliver(call_type, payload, trace_id).await
    }

    /// Route a callback, internal join slots included.
    pub(crate) async fn deliver(&self, call_type: &str, payload: &str, trace_id: &str) -> Result<bool, FlowError> {
        let message = InboundMessage::Call {
            call_type: call_type.to_string(),
            payload: payload.to_string(),
            trace_id: trace_id.to_string(),
        };

        let mut existing = self.load(trace_id).await?;
        if let Some(cp) = existing.as_mut() {
            if let Some(accepted) = self.route_to_owner(cp, &message).await? {
                return Ok(accepted);
            }
        }

        let waiting = existing.as_ref().and_then(|cp| cp.name().map(str::to_string));
        let Some(route) = self.inner.router.resolve(call_type, waiting.as_deref()).await else {
            if let Some(cp) = existing.as_ref() {
                if let Some(accepted) = self.forward_to_creator(cp, &message).await? {
                    return Ok(accepted);
                }
            }
            return Err(RoutingError::UnknownCallType(call_type.to_string()).into());
        };

        let step = self.step(&route.step).await?;
        debug!("{} for {} routed to {}", call_type, trace_id, step.name);
        match (&step.kind, route.slot) {
            (StepKind::MultiCall { .. }, Some(slot)) => self.arrive(&step, trace_id, slot, payload).await,
            _ => self.callback(&step, trace_id, call_type, payload).await,
        }
    }

    /// Park the flow instance until a message resumes this step.
    pub(crate) async fn await_message(
        &self,
        step: &Step,
        mut cp: Checkpoint,
        hook: Option<&HookFn>,
    ) -> Result<bool, FlowError> {
        if let Some(hook) = hook {
            if let Err(e) = hook(&mut cp) {
                return self.fail(step, cp, e).await;
            }
        }
        self.save(&cp).await?;
        self.inner.events.suspended(&cp.id, &step.name);
        debug!("{} waits in {}", cp.id, step.name);
        Ok(false)
    }

    async fn callback(
        &self,
        step: &Arc<Step>,
        trace_id: &str,
        call_type: &str,
        payload: &str,
    ) -> Result<bool, FlowError> {
        let gate = matches!(step.kind, StepKind::Call { gate: true, .. });

        let mut cp = match self.load(trace_id).await? {
            Some(cp) => cp,
            None if gate => {
                return Err(RoutingError::NotStarted {
                    trace_id: trace_id.to_string(),
                    step: step.name.clone(),
                }
                .into())
            }
            None => {
                // First message of a flow that starts with this call.
                if self.enter(step.clone(), trace_id).await? {
                    return Ok(true);
                }
                self.require(trace_id, &step.name).await?
            }
        };

        if cp.is_finished() {
            return Err(RoutingError::AlreadyFinished(trace_id.to_string()).into());
        }
        match cp.top() {
            Some(frame) if frame.name != step.name => {
                warn!("{} arrived for {} while it waits in {}", call_type, trace_id, frame.name);
                return Err(RoutingError::UnexpectedStep {
                    trace_id: trace_id.to_string(),
                    expected: Some(frame.name.clone()),
                    got: step.name.clone(),
                }
                .into());
            }
            Some(frame) if !frame.status.is_in_progress() => {
                return Err(RoutingError::Duplicate {
                    trace_id: trace_id.to_string(),
                    step: step.name.clone(),
                }
                .into());
            }
            Some(_) => {}
            None => {
                return Err(RoutingError::UnexpectedStep {
                    trace_id: trace_id.to_string(),
                    expected: None,
                    got: step.name.clone(),
                }
                .into())
            }
        }

        let value = if gate {
            let mut data = Map::new();
            data.insert("call_type".to_string(), Value::String(call_type.to_string()));
            data.insert("payload".to_string(), Value::String(payload.to_string()));
            cp.set_closure_data("callback", data);
            cp.param()
        } else {
            Value::String(payload.to_string())
        };
        info!("{} resumed {} at {}", call_type, trace_id, step.name);
        self.on_return(step, cp, value).await
    }

    /// Hand the message to the machine a pinned checkpoint belongs to.
    ///
    /// `Some` means the message was dealt with remotely, `None` that it
    /// should be processed here.
    pub(crate) async fn route_to_owner(
        &self,
        cp: &mut Checkpoint,
        message: &InboundMessage,
    ) -> Result<Option<bool>, FlowError> {
        let Some(pin) = cp.pin() else {
            return Ok(None);
        };

        if pin.machine == self.machine_id() {
            if self.inner.router.fully_registered(&pin.scope, &pin.entry).await? {
                debug!("{} is now known fleet-wide, unpinning {}", pin.entry, cp.id);
                cp.unpin();
                self.save(cp).await?;
            }
            return Ok(None);
        }

        let outcome = match &self.inner.forwarder {
            Some(forwarder) => forwarder.forward(&pin.machine, message).await,
            None => Ok(false),
        };
        match outcome {
            Ok(true) => {
                debug!("Forwarded {} to {}", cp.id, pin.machine);
                self.inner.events.forwarded(&cp.id, &pin.machine);
                Ok(Some(true))
            }
            Ok(false) => Err(self.release_pin(cp, &pin, "owner did not accept the message".to_string()).await?),
            Err(e) => Err(self.release_pin(cp, &pin, e.to_string()).await?),
        }
    }

    async fn release_pin(&self, cp: &mut Checkpoint, pin: &Pin, reason: String) -> Result<FlowError, FlowError> {
        warn!("Could not forward {} to {}: {}", cp.id, pin.machine, reason);
        cp.unpin();
        self.save(cp).await?;
        Ok(FlowError::Retry {
            trace_id: cp.id.clone(),
            step: pin.entry.clone(),
            reason,
        })
    }

    /// Pass a message this process cannot route to the machine that ran the last step.
    pub(crate) async fn forward_to_creator(
        &self,
        cp: &Checkpoint,
        message: &InboundMessage,
    ) -> Result<Option<bool>, FlowError> {
        let (Some(frame), Some(forwarder)) = (cp.top(), &self.inner.forwarder) else {
            return Ok(None);
        };
        if frame.ip == self.machine_id() {
            return Ok(None);
        }
        if forwarder.forward(&frame.ip, message).await? {
            debug!("Forwarded unroutable message of {} to {}", cp.id, frame.ip);
            self.inner.events.forwarded(&cp.id, &frame.ip);
            return Ok(Some(true));
        }
        Ok(None)
    }

    /// Build the sub-graph for this invocation, install it and continue inside it.
    pub(crate) async fn flat_map(&self, step: &Step, mut cp: Checkpoint, f: &FlatMapFn) -> Result<bool, FlowError> {
        let input = cp.param();
        let flow = match f(&mut cp, input.clone()) {
            Ok(flow) => flow,
            Err(e) => return self.fail(step, cp, e).await,
        };

        let scope = format!("{}@{}", step.name, cp.id);
        let entry = match self
            .inner
            .router
            .install_dynamic(&flow, &scope, step.next.clone(), &cp.id)
            .await
        {
            Ok(entry) => entry,
            Err(FlowError::Construction(e)) => return self.fail(step, cp, StepError::user(e)).await,
            Err(e) => return Err(e),
        };

        if !self.inner.router.fully_registered(&step.name, &entry).await? {
            debug!("{} only known here, pinning {} to {}", entry, cp.id, self.machine_id());
            cp.set_pin(Pin {
                machine: self.machine_id().to_string(),
                scope: step.name.clone(),
                entry: entry.clone(),
            });
        }

        cp.set_result(input, FrameStatus::PrepareSubcall);
        self.save(&cp).await?;
        self.gauge_down(&step.name).await;

        let entry_step = self.step(&entry).await?;
        self.enter(entry_step, &cp.id).await
    }

    pub(crate) async fn schedule_delay(
        &self,
        step: &Step,
        mut cp: Checkpoint,
        millis: u64,
        value: Option<&Value>,
    ) -> Result<bool, FlowError> {
        let Some(scheduler) = &self.inner.delay else {
            warn!("No delay scheduler configured, {} continues immediately", step.name);
            cp.append_error(&step.name, "no delay scheduler configured, delay skipped");
            let value = value.cloned().unwrap_or_else(|| cp.param());
            return self.on_return(step, cp, value).await;
        };

        if let Err(e) = scheduler.add_task(&step.name, &cp.id, millis).await {
            return self.fail(step, cp, StepError::retry(format!("delay not scheduled: {}", e))).await;
        }
        debug!("{} sleeps {}ms in {}", cp.id, millis, step.name);
        self.inner.events.suspended(&cp.id, &step.name);
        Ok(false)
    }

    /// Timer fired for a delay step.
    pub(crate) async fn resume_delay(&self, name: &str, trace_id: &str) -> Result<bool, FlowError> {
        let message = InboundMessage::Timer {
            step: name.to_string(),
            trace_id: trace_id.to_string(),
        };
        let Some(mut cp) = self.load(trace_id).await? else {
            warn!("Timer for unknown flow {}", trace_id);
            return Ok(false);
        };
        if let Some(accepted) = self.route_to_owner(&mut cp, &message).await? {
            return Ok(accepted);
        }

        let step = self.step(name).await?;
        let waiting = !cp.is_finished()
            && cp
                .top()
                .map(|f| f.name == step.name && f.status.is_in_progress())
                .unwrap_or(false);
        if !waiting {
            warn!("Stale timer for {} at {}", trace_id, name);
            return Ok(false);
        }

        let value = match &step.kind {
            StepKind::Delay { value, .. } => value.clone().unwrap_or_else(|| cp.param()),
            _ => {
                return Err(RoutingError::UnexpectedStep {
                    trace_id: trace_id.to_string(),
                    expected: cp.name().map(str::to_string),
                    got: step.name.clone(),
                }
                .into())
            }
        };
        self.on_return(&step, cp, value).await
    }
}
