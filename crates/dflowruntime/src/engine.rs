use crate::flow::Flow;
use crate::router::{Pipeline, Router};
use crate::step::{Step, StepKind, ERROR_SENTINEL};
use dflowcore::{
    Checkpoint, ConstructionError, ContextStore, CounterStore, DelayScheduler, EventBus, FlowError, FlowEvent,
    Forwarder, Frame, FrameStatus, InboundMessage, RoutingError, StepChannel, StepError, Value,
    TERMINATED,
};
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// How a step hands over to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Enter the next step in the same task.
    Inline,
    /// Send every hop through the configured [`StepChannel`].
    Channel,
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address other machines use to reach this process.
    pub machine_id: String,
    pub strict_ids: bool,
    /// Child ids kept verbatim on a fan-out frame before sampling.
    pub child_task_sample: usize,
    pub remove_finished: bool,
    pub dispatch: Dispatch,
    pub event_buffer_size: usize,
    /// Let nodes with a mock answer for checkpoints marked as mocked.
    pub test_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            machine_id: "127.0.0.1".to_string(),
            strict_ids: false,
            child_task_sample: 3,
            remove_finished: false,
            dispatch: Dispatch::Inline,
            event_buffer_size: 1000,
            test_mode: false,
        }
    }
}

impl EngineConfig {
    /// Defaults, with `DFLOW_MACHINE_ID`, `DFLOW_STRICT_IDS` and `DFLOW_TEST_MODE` applied when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(machine_id) = std::env::var("DFLOW_MACHINE_ID") {
            config.machine_id = machine_id;
        }
        if let Ok(strict) = std::env::var("DFLOW_STRICT_IDS") {
            config.strict_ids = flag(&strict);
        }
        if let Ok(test_mode) = std::env::var("DFLOW_TEST_MODE") {
            config.test_mode = flag(&test_mode);
        }
        config
    }
}

fn flag(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "yes")
}

pub struct EngineBuilder {
    config: EngineConfig,
    contexts: Arc<dyn ContextStore>,
    counters: Arc<dyn CounterStore>,
    delay: Option<Arc<dyn DelayScheduler>>,
    forwarder: Option<Arc<dyn Forwarder>>,
    channel: Option<Arc<dyn StepChannel>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn delay_scheduler(mut self, scheduler: Arc<dyn DelayScheduler>) -> Self {
        self.delay = Some(scheduler);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn step_channel(mut self, channel: Arc<dyn StepChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn build(self) -> Engine {
        let router = Router::new(self.counters.clone(), self.config.strict_ids);
        let events = EventBus::new(self.config.event_buffer_size);
        Engine {
            inner: Arc::new(Inner {
                config: self.config,
                router,
                contexts: self.contexts,
                counters: self.counters,
                delay: self.delay,
                forwarder: self.forwarder,
                channel: self.channel,
                events,
                omitted: RwLock::new(Vec::new()),
            }),
        }
    }
}

pub(crate) struct Inner {
    pub config: EngineConfig,
    pub router: Router,
    pub contexts: Arc<dyn ContextStore>,
    pub counters: Arc<dyn CounterStore>,
    pub delay: Option<Arc<dyn DelayScheduler>>,
    pub forwarder: Option<Arc<dyn Forwarder>>,
    pub channel: Option<Arc<dyn StepChannel>>,
    pub events: EventBus,
    /// Trace ids matching any of these fail on entry.
    pub omitted: RwLock<Vec<Regex>>,
}

/// Message-driven flow engine.
///
/// Cheap to clone. Every inbound message loads the checkpoint of its trace,
/// advances as far as possible and writes the checkpoint back.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

fn gauge_key(step: &str) -> String {
    format!("stats:{}", step)
}

impl Engine {
    pub fn builder(contexts: Arc<dyn ContextStore>, counters: Arc<dyn CounterStore>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            contexts,
            counters,
            delay: None,
            forwarder: None,
            channel: None,
        }
    }

    pub fn new(contexts: Arc<dyn ContextStore>, counters: Arc<dyn CounterStore>) -> Self {
        Self::builder(contexts, counters).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn machine_id(&self) -> &str {
        &self.inner.config.machine_id
    }

    /// Subscribe to flow events
    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    /// Wire a flow into this engine's routing table.
    pub async fn install(&self, flow: &Flow, pipeline: &str) -> Result<Pipeline, FlowError> {
        self.inner.router.install(flow, pipeline).await
    }

    /// Start a flow instance at the pipeline's entry step.
    pub async fn start(&self, pipeline: &Pipeline, trace_id: &str) -> Result<bool, FlowError> {
        let step = self.step(&pipeline.entry).await?;
        info!("Starting {} as {}", pipeline.name, trace_id);
        self.enter(step, trace_id).await
    }

    /// Start a flow instance whose nodes answer with their mocks (test mode only).
    pub async fn start_mocked(&self, pipeline: &Pipeline, trace_id: &str) -> Result<bool, FlowError> {
        if self.load(trace_id).await?.is_none() {
            let mut cp = Checkpoint::new(trace_id);
            cp.set_mock();
            self.save(&cp).await?;
        }
        self.start(pipeline, trace_id).await
    }

    /// Fail every flow instance whose trace id matches `pattern`. Returns the active patterns.
    pub async fn add_omit_pattern(&self, pattern: &str) -> Result<Vec<String>, FlowError> {
        let regex = Regex::new(pattern).map_err(|e| ConstructionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let mut omitted = self.inner.omitted.write().await;
        if !omitted.iter().any(|r| r.as_str() == pattern) {
            info!("Omitting trace ids matching {}", pattern);
            omitted.push(regex);
        }
        Ok(omitted.iter().map(|r| r.as_str().to_string()).collect())
    }

    pub async fn omit_patterns(&self) -> Vec<String> {
        let omitted = self.inner.omitted.read().await;
        omitted.iter().map(|r| r.as_str().to_string()).collect()
    }

    pub async fn clear_omit_pattern(&self, pattern: &str) {
        self.inner.omitted.write().await.retain(|r| r.as_str() != pattern);
    }

    async fn omitted_by(&self, trace_id: &str) -> Option<String> {
        let omitted = self.inner.omitted.read().await;
        omitted
            .iter()
            .find(|r| r.is_match(trace_id))
            .map(|r| r.as_str().to_string())
    }

    pub async fn checkpoint(&self, trace_id: &str) -> Result<Option<Checkpoint>, FlowError> {
        self.load(trace_id).await
    }

    /// Handle one inbound message, whatever its kind.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<bool, FlowError> {
        match message {
            InboundMessage::Call {
                call_type,
                payload,
                trace_id,
            } => self.deliver(&call_type, &payload, &trace_id).await,
            InboundMessage::Step { step, trace_id } => self.step_received(&step, &trace_id).await,
            InboundMessage::Timer { step, trace_id } => self.resume_delay(&step, &trace_id).await,
        }
    }

    /// Feed messages from a channel (timers, hops) into the engine until it closes.
    pub async fn drive(&self, mut messages: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = messages.recv().await {
            let trace_id = message.trace_id().to_string();
            if let Err(e) = self.dispatch(message).await {
                warn!("Message for {} failed: {}", trace_id, e);
            }
        }
    }

    /// Re-enter a step whose frame asked for a retry.
    pub async fn retry(&self, trace_id: &str) -> Result<bool, FlowError> {
        let cp = self.require(trace_id, "retry").await?;
        let Some(frame) = cp.top().filter(|f| matches!(f.status, FrameStatus::FailRetry { .. })) else {
            warn!("Nothing to retry for {}", trace_id);
            return Ok(false);
        };
        let step = self.step(&frame.name).await?;
        info!("Retrying {} for {}", step.name, trace_id);
        self.enter(step, trace_id).await
    }

    /// Roll a flow instance back to the named step and run it again.
    pub async fn replay_step(&self, trace_id: &str, step_name: &str) -> Result<bool, FlowError> {
        let mut cp = self.require(trace_id, step_name).await?;
        let position = cp
            .stack
            .iter()
            .rposition(|f| f.name == step_name)
            .ok_or_else(|| RoutingError::UnknownStep(step_name.to_string()))?;
        let step = self.step(step_name).await?;

        cp.stack.truncate(position);
        cp.remove(dflowcore::FINISHED);
        cp.remove(dflowcore::FAILED);
        cp.set_next_step(step.name.clone());
        cp.push_frame(&step.name, step.debug_name.as_deref(), self.machine_id());
        self.save(&cp).await?;
        info!("Replaying {} for {}", step.name, trace_id);
        self.run_step(&step, cp).await
    }

    /// Search a flow instance and its spawned branches for a frame by debug name.
    pub async fn find_frame(
        &self,
        trace_id: &str,
        debug_name: &str,
    ) -> Result<Option<(String, Frame)>, FlowError> {
        let mut pending = vec![trace_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(cp) = self.load(&id).await? else {
                continue;
            };
            if let Some(frame) = cp.frame_by_debug_name(debug_name) {
                return Ok(Some((id, frame.clone())));
            }
            for (index, frame) in cp.stack.iter().enumerate() {
                if let (true, Some(total)) = (frame.parallel, frame.total_size) {
                    pending.extend((0..total).map(|i| Checkpoint::child_id(&cp.id, index + 1, i)));
                }
            }
        }
        Ok(None)
    }

    /// Messages currently inside `step` (entered, not yet handed on).
    pub async fn backlog(&self, step: &str) -> Result<i64, FlowError> {
        let raw = self.inner.counters.get(&gauge_key(step)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn step_received(&self, name: &str, trace_id: &str) -> Result<bool, FlowError> {
        let message = InboundMessage::Step {
            step: name.to_string(),
            trace_id: trace_id.to_string(),
        };
        let mut existing = self.load(trace_id).await?;
        if let Some(cp) = existing.as_mut() {
            if let Some(accepted) = self.route_to_owner(cp, &message).await? {
                return Ok(accepted);
            }
        }
        match self.inner.router.step(name).await {
            Some(step) => self.enter(step, trace_id).await,
            None => {
                if let Some(cp) = existing.as_mut() {
                    if let Some(accepted) = self.forward_to_creator(cp, &message).await? {
                        return Ok(accepted);
                    }
                }
                Err(RoutingError::UnknownStep(name.to_string()).into())
            }
        }
    }

    /// Entry point of every step: load or create the checkpoint, push a frame, run.
    pub(crate) fn enter<'a>(
        &'a self,
        step: Arc<Step>,
        trace_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, FlowError>> {
        async move {
            let mut cp = match self.load(trace_id).await? {
                Some(cp) => {
                    if cp.is_finished() {
                        return Err(RoutingError::AlreadyFinished(trace_id.to_string()).into());
                    }
                    if cp.top().map(|f| f.status.is_in_progress()).unwrap_or(false) {
                        warn!("{} is still running {:?}, rejecting {}", trace_id, cp.name(), step.name);
                        return Err(RoutingError::Duplicate {
                            trace_id: trace_id.to_string(),
                            step: step.name.clone(),
                        }
                        .into());
                    }
                    cp
                }
                None => Checkpoint::new(trace_id),
            };

            if step.source.is_some() {
                if let Some(expected) = cp.next_step() {
                    if expected != step.name {
                        warn!("{} expects {}, got {}", trace_id, expected, step.name);
                        return Err(RoutingError::UnexpectedStep {
                            trace_id: trace_id.to_string(),
                            expected: Some(expected.to_string()),
                            got: step.name.clone(),
                        }
                        .into());
                    }
                }
            }

            self.gauge_up(&step.name).await;
            if matches!(cp.top().map(|f| &f.status), Some(FrameStatus::Error)) {
                return self.error_return(&step, cp).await;
            }

            cp.push_frame(&step.name, step.debug_name.as_deref(), self.machine_id());
            self.save(&cp).await?;
            debug!("Entered {} for {}", step.name, trace_id);
            self.inner.events.step_started(trace_id, &step.name);

            if let Some(pattern) = self.omitted_by(trace_id).await {
                warn!("{} is omitted by pattern {}", trace_id, pattern);
                let reason = format!("trace id is omitted by pattern: {}", pattern);
                return self.fail(&step, cp, StepError::User(reason)).await;
            }

            if let (true, Some(mock)) = (self.inner.config.test_mode && cp.is_mock(), &step.mock) {
                match mock(&mut cp) {
                    Ok(Some(value)) => {
                        debug!("{} answered by its mock for {}", step.name, trace_id);
                        return self.on_return(&step, cp, value).await;
                    }
                    Ok(None) => {}
                    Err(e) => return self.fail(&step, cp, e).await,
                }
            }

            self.run_step(&step, cp).await
        }
        .boxed()
    }

    /// Do the step's work. Returns whether it produced a result right away.
    pub(crate) async fn run_step(&self, step: &Step, mut cp: Checkpoint) -> Result<bool, FlowError> {
        match &step.kind {
            StepKind::Constant(value) => self.on_return(step, cp, value.clone()).await,
            StepKind::Map(f) => {
                let input = cp.param();
                match f(&mut cp, input) {
                    Ok(value) => self.on_return(step, cp, value).await,
                    Err(e) => self.fail(step, cp, e).await,
                }
            }
            StepKind::FlatMap(f) => self.flat_map(step, cp, f).await,
            StepKind::Call { on_init, .. } => self.await_message(step, cp, on_init.as_ref()).await,
            StepKind::MultiCall { on_init, .. } => self.await_message(step, cp, on_init.as_ref()).await,
            StepKind::Delay { millis, value } => {
                self.schedule_delay(step, cp, *millis, value.as_ref()).await
            }
            StepKind::Zip(fan) | StepKind::Or(fan) => self.fan_out(step, cp, fan).await,
            StepKind::Forward { call_type, .. } => {
                let value = cp.param();
                self.forward_branch(step, cp, call_type, Ok(value)).await
            }
            StepKind::Collect(reducer) => self.collect(step, cp, reducer).await,
        }
    }

    /// Record the step's result and hand over to the next step.
    pub(crate) async fn on_return(&self, step: &Step, mut cp: Checkpoint, value: Value) -> Result<bool, FlowError> {
        if !cp.set_result(value, FrameStatus::End) {
            warn!("{} already produced a result for {}", step.name, cp.id);
            return Err(RoutingError::Duplicate {
                trace_id: cp.id.clone(),
                step: step.name.clone(),
            }
            .into());
        }
        self.save(&cp).await?;
        let cost = cp.top().and_then(|f| f.cost_time).unwrap_or(0);
        self.inner.events.step_completed(&cp.id, &step.name, cost);

        self.trigger_next(step, cp).await?;
        Ok(true)
    }

    pub(crate) async fn trigger_next(&self, step: &Step, mut cp: Checkpoint) -> Result<(), FlowError> {
        self.gauge_down(&step.name).await;
        let Some(next) = step.next.as_deref() else {
            return self.finish(cp).await;
        };

        cp.set_next_step(next);
        self.save(&cp).await?;

        match (self.inner.config.dispatch, &self.inner.channel) {
            (Dispatch::Channel, Some(channel)) => {
                let message = InboundMessage::Step {
                    step: next.to_string(),
                    trace_id: cp.id.clone(),
                };
                match channel.send(message).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(self.send_failed(&cp, next, "channel refused the hop".to_string())),
                    Err(e) => Err(self.send_failed(&cp, next, e.to_string())),
                }
            }
            (dispatch, _) => {
                if dispatch == Dispatch::Channel {
                    warn!("Channel dispatch configured without a step channel, running {} inline", next);
                }
                let next_step = self.step(next).await?;
                self.enter(next_step, &cp.id).await.map(|_| ())
            }
        }
    }

    fn send_failed(&self, cp: &Checkpoint, next: &str, reason: String) -> FlowError {
        warn!("Could not hand {} to {}: {}", cp.id, next, reason);
        FlowError::Retry {
            trace_id: cp.id.clone(),
            step: next.to_string(),
            reason,
        }
    }

    /// The terminal step produced its result.
    async fn finish(&self, mut cp: Checkpoint) -> Result<(), FlowError> {
        if matches!(cp.top().map(|f| &f.status), Some(FrameStatus::Error)) {
            cp.set_failed();
        }
        cp.set_finished();
        cp.set_next_step(TERMINATED);
        self.save(&cp).await?;

        let failed = cp.is_failed();
        if failed {
            error!("Flow {} finished in failure: {:?}", cp.id, cp.error_message());
        } else {
            info!("Flow {} finished", cp.id);
        }
        self.inner.events.flow_finished(&cp.id, failed);

        self.inner.contexts.expire(&cp.id).await?;
        if self.inner.config.remove_finished {
            self.inner.contexts.remove(&cp.id).await?;
        }
        self.inner.router.release(&cp.id).await;
        Ok(())
    }

    /// Classify a step failure and update the checkpoint accordingly.
    pub(crate) async fn fail(&self, step: &Step, mut cp: Checkpoint, err: StepError) -> Result<bool, FlowError> {
        let StepError::User(message) = err else {
            return self.settle(step, cp, err).await;
        };

        warn!("Step {} failed for {}: {}", step.name, cp.id, message);
        cp.set_status(FrameStatus::Error);
        cp.append_error(&step.name, &message);
        self.save(&cp).await?;
        self.inner.events.step_failed(&cp.id, &step.name, message.clone());

        let trace_id = cp.id.clone();
        if self.error_return(step, cp).await? {
            Ok(true)
        } else {
            Err(FlowError::Step {
                trace_id,
                step: step.name.clone(),
                message,
            })
        }
    }

    /// Everything but user errors: local termination, retry and terminal.
    async fn settle(&self, step: &Step, mut cp: Checkpoint, err: StepError) -> Result<bool, FlowError> {
        let trace_id = cp.id.clone();
        self.gauge_down(&step.name).await;
        match err {
            StepError::LocalTermination => {
                debug!("{} stopped {} locally", step.name, trace_id);
                cp.set_finished();
                self.save(&cp).await?;
                self.inner.router.release(&trace_id).await;
                Ok(false)
            }
            StepError::Retry(reason) => {
                warn!("{} asks to retry {}: {}", step.name, trace_id, reason);
                cp.mark_retry(reason.clone());
                self.save(&cp).await?;
                self.inner.events.step_failed(&trace_id, &step.name, format!("retry: {}", reason));
                Err(FlowError::Retry {
                    trace_id,
                    step: step.name.clone(),
                    reason,
                })
            }
            StepError::Terminal(reason) => {
                error!("{} terminated {}: {}", step.name, trace_id, reason);
                cp.set_status(FrameStatus::Error);
                cp.append_error(&step.name, &reason);
                cp.set_failed();
                self.inner.events.step_failed(&trace_id, &step.name, reason.clone());
                let branch = cp.parent().map(str::to_string).zip(cp.join_slot().map(str::to_string));
                self.finish(cp).await?;
                if let Some((parent, call_type)) = branch {
                    let payload = format!("{}{}", ERROR_SENTINEL, reason);
                    debug!("Reporting terminated branch {} to {}", trace_id, parent);
                    self.deliver(&call_type, &payload, &parent).await?;
                }
                Err(FlowError::Terminated { trace_id, reason })
            }
            StepError::User(message) => Err(FlowError::Step {
                trace_id,
                step: step.name.clone(),
                message,
            }),
        }
    }

    /// Let `step` react to an error recorded on the top frame.
    ///
    /// Returns true when the step recovered (its error handler produced a
    /// value, or it is a branch forwarder reporting the failure to its join).
    /// Otherwise the error travels on to the next step.
    pub(crate) async fn error_return(&self, step: &Step, mut cp: Checkpoint) -> Result<bool, FlowError> {
        if let StepKind::Forward { call_type, .. } = &step.kind {
            let reason = cp
                .error_message()
                .and_then(|m| m.lines().last())
                .unwrap_or("branch failed")
                .to_string();
            cp.push_frame(&step.name, step.debug_name.as_deref(), self.machine_id());
            self.forward_branch(step, cp, call_type, Err(reason)).await?;
            return Ok(true);
        }

        let Some(handler) = step.on_error.clone() else {
            debug!("{} has no error handler, passing the error of {} on", step.name, cp.id);
            self.trigger_next(step, cp).await?;
            return Ok(false);
        };

        cp.push_frame(&step.name, step.debug_name.as_deref(), self.machine_id());
        match handler(&mut cp) {
            Ok(value) => {
                info!("{} recovered {} with its error handler", step.name, cp.id);
                self.on_return(step, cp, value).await
            }
            Err(StepError::User(message)) => {
                warn!("Error handler of {} failed for {}: {}", step.name, cp.id, message);
                cp.set_status(FrameStatus::Error);
                cp.append_error(&step.name, &message);
                self.save(&cp).await?;
                self.trigger_next(step, cp).await?;
                Ok(false)
            }
            Err(other) => self.settle(step, cp, other).await,
        }
    }

    pub(crate) async fn step(&self, name: &str) -> Result<Arc<Step>, FlowError> {
        self.inner
            .router
            .step(name)
            .await
            .ok_or_else(|| RoutingError::UnknownStep(name.to_string()).into())
    }

    pub(crate) async fn load(&self, trace_id: &str) -> Result<Option<Checkpoint>, FlowError> {
        Ok(self.inner.contexts.get(trace_id).await?)
    }

    pub(crate) async fn require(&self, trace_id: &str, step: &str) -> Result<Checkpoint, FlowError> {
        self.load(trace_id).await?.ok_or_else(|| {
            RoutingError::NotStarted {
                trace_id: trace_id.to_string(),
                step: step.to_string(),
            }
            .into()
        })
    }

    pub(crate) async fn save(&self, cp: &Checkpoint) -> Result<(), FlowError> {
        Ok(self.inner.contexts.put(&cp.id, cp).await?)
    }

    async fn gauge_up(&self, step: &str) {
        if let Err(e) = self.inner.counters.incr(&gauge_key(step)).await {
            warn!("Backlog gauge of {} not updated: {}", step, e);
        }
    }

    pub(crate) async fn gauge_down(&self, step: &str) {
        if let Err(e) = self.inner.counters.decr(&gauge_key(step)).await {
            warn!("Backlog gauge of {} not updated: {}", step, e);
        }
    }
}
