use crate::flow::{Flow, FlowKind, JoinMode, TriggerFn};
use crate::step::{FanOut, Reducer, Step, StepKind};
use dflowcore::{ConstructionError, CounterStore, FlowError, StoreError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Routing entry: an inbound call type and the step (and join slot) that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub call_type: String,
    pub step: String,
    pub slot: Option<usize>,
    /// Registered by a runtime sub-graph rather than at bootstrap.
    pub dynamic: bool,
}

/// Handle returned by installing a flow.
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    pub name: String,
    pub entry: String,
    pub terminal: String,
    /// External call types this pipeline listens on.
    pub call_types: Vec<String>,
}

/// Routing table shared by every component of one engine.
///
/// Static pipelines are installed once at bootstrap. Runtime sub-graphs
/// built by flatMap steps are installed per flow instance and released when
/// that instance finishes.
pub struct Router {
    steps: RwLock<HashMap<String, Arc<Step>>>,
    routes: RwLock<HashMap<String, Vec<Route>>>,
    scopes: RwLock<HashMap<String, Vec<String>>>,
    counters: Arc<dyn CounterStore>,
    strict_ids: bool,
}

fn alive_key(step: &str) -> String {
    format!("alive:{}", step)
}

impl Router {
    pub fn new(counters: Arc<dyn CounterStore>, strict_ids: bool) -> Self {
        Self {
            steps: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            scopes: RwLock::new(HashMap::new()),
            counters,
            strict_ids,
        }
    }

    /// Wire a flow into the routing table. All construction errors surface here.
    pub async fn install(&self, flow: &Flow, pipeline: &str) -> Result<Pipeline, FlowError> {
        let compiled = Compiler::compile(flow, Scope::Root(pipeline.to_string()), None, self.strict_ids)?;
        let call_types: Vec<String> = compiled
            .routes
            .iter()
            .filter(|r| !r.call_type.contains('#'))
            .map(|r| r.call_type.clone())
            .collect();
        let pipeline = Pipeline {
            name: pipeline.to_string(),
            entry: compiled.entry.clone(),
            terminal: compiled.terminal.clone(),
            call_types,
        };
        let count = compiled.steps.len();
        self.register(compiled, None).await?;
        info!(
            "Installed pipeline {} ({} steps, entry {})",
            pipeline.name, count, pipeline.entry
        );
        Ok(pipeline)
    }

    /// Install a sub-graph built at runtime by `trace_id`. Returns its entry step.
    pub(crate) async fn install_dynamic(
        &self,
        flow: &Flow,
        scope: &str,
        next: Option<String>,
        trace_id: &str,
    ) -> Result<String, FlowError> {
        let mut compiled = Compiler::compile(flow, Scope::Nested(scope.to_string()), next, self.strict_ids)?;
        for route in &mut compiled.routes {
            route.dynamic = true;
        }
        let entry = compiled.entry.clone();
        self.register(compiled, Some(trace_id)).await?;
        debug!("Installed sub-graph {} for {}", scope, trace_id);
        Ok(entry)
    }

    async fn register(&self, compiled: Compiled, owner: Option<&str>) -> Result<(), FlowError> {
        let added = {
            let mut steps = self.steps.write().await;
            let mut routes = self.routes.write().await;

            if owner.is_none() {
                for step in &compiled.steps {
                    if let Some(existing) = steps.get(&step.name) {
                        if existing.fingerprint() != step.fingerprint() {
                            return Err(ConstructionError::DuplicateId(step.name.clone()).into());
                        }
                    }
                }
                for route in &compiled.routes {
                    let clash = routes.get(&route.call_type).and_then(|list| {
                        list.iter()
                            .find(|r| !r.dynamic && (r.step != route.step || r.slot != route.slot))
                    });
                    if let Some(existing) = clash {
                        return Err(ConstructionError::DuplicateCallType {
                            call_type: route.call_type.clone(),
                            existing: existing.step.clone(),
                            step: route.step.clone(),
                        }
                        .into());
                    }
                }
            }

            let mut added = Vec::new();
            for step in compiled.steps {
                let name = step.name.clone();
                // Static installs are idempotent, runtime ones replace their own scope.
                if owner.is_none() && steps.contains_key(&name) {
                    continue;
                }
                if steps.insert(name.clone(), Arc::new(step)).is_none() {
                    added.push(name);
                }
            }
            for route in compiled.routes {
                let list = routes.entry(route.call_type.clone()).or_default();
                if !list.contains(&route) {
                    list.push(route);
                }
            }
            added
        };

        if let Some(trace_id) = owner {
            self.scopes
                .write()
                .await
                .entry(trace_id.to_string())
                .or_default()
                .extend(added.iter().cloned());
        }
        for name in &added {
            self.counters.incr(&alive_key(name)).await?;
        }
        Ok(())
    }

    /// Drop every runtime sub-graph owned by a finished flow instance.
    pub(crate) async fn release(&self, trace_id: &str) {
        let Some(names) = self.scopes.write().await.remove(trace_id) else {
            return;
        };
        let names: HashSet<String> = names.into_iter().collect();
        {
            let mut steps = self.steps.write().await;
            steps.retain(|name, _| !names.contains(name));
        }
        {
            let mut routes = self.routes.write().await;
            for list in routes.values_mut() {
                list.retain(|r| !names.contains(&r.step));
            }
            routes.retain(|_, list| !list.is_empty());
        }
        for name in &names {
            if let Err(e) = self.counters.reset(&alive_key(name)).await {
                warn!("Could not reset registration gauge of {}: {}", name, e);
            }
        }
        debug!("Released {} sub-graph steps of {}", names.len(), trace_id);
    }

    pub async fn step(&self, name: &str) -> Option<Arc<Step>> {
        self.steps.read().await.get(name).cloned()
    }

    /// Pick the route for `call_type`, preferring the step the flow is waiting on.
    pub async fn resolve(&self, call_type: &str, waiting: Option<&str>) -> Option<Route> {
        let routes = self.routes.read().await;
        let candidates = routes.get(call_type)?;
        if let Some(waiting) = waiting {
            if let Some(route) = candidates.iter().find(|r| r.step == waiting) {
                return Some(route.clone());
            }
        }
        candidates
            .iter()
            .find(|r| !r.dynamic)
            .or_else(|| if candidates.len() == 1 { candidates.first() } else { None })
            .cloned()
    }

    /// All routes, ordered by call type.
    pub async fn routes(&self) -> Vec<Route> {
        let routes = self.routes.read().await;
        let mut all: Vec<Route> = routes.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.call_type.cmp(&b.call_type).then(a.step.cmp(&b.step)));
        all
    }

    pub async fn step_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether every process that registered `owner` has also registered `entry`.
    pub async fn fully_registered(&self, owner: &str, entry: &str) -> Result<bool, StoreError> {
        let owners = self.alive(owner).await?;
        let registered = self.alive(entry).await?;
        Ok(registered >= owners)
    }

    async fn alive(&self, step: &str) -> Result<i64, StoreError> {
        let key = alive_key(step);
        match self.counters.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| StoreError::Corrupt {
                key,
                reason: format!("not a counter: {}", raw),
            }),
        }
    }
}

pub(crate) struct Compiled {
    pub steps: Vec<Step>,
    pub routes: Vec<Route>,
    pub entry: String,
    pub terminal: String,
}

enum Scope {
    /// Top level of a pipeline. Explicit ids are used verbatim.
    Root(String),
    /// Inside a join branch or a runtime sub-graph.
    Nested(String),
}

impl Scope {
    fn name_for(&self, node: &Flow, index: usize, strict: bool) -> Result<String, ConstructionError> {
        let label = match self {
            Scope::Root(pipeline) => pipeline,
            Scope::Nested(prefix) => prefix,
        };
        match (self, &node.id) {
            (Scope::Root(_), Some(id)) => Ok(id.clone()),
            (Scope::Nested(prefix), Some(id)) => Ok(format!("{}/{}", prefix, id)),
            (_, None) if strict => Err(ConstructionError::MissingId(format!(
                "{} #{} in {}",
                node.kind.name(),
                index,
                label
            ))),
            (Scope::Root(pipeline), None) => Ok(format!("{}:{}{}", pipeline, node.kind.name(), index)),
            (Scope::Nested(prefix), None) => Ok(format!("{}/{}{}", prefix, node.kind.name(), index)),
        }
    }
}

/// Turns a [`Flow`] tree into routed steps, walking each chain from its entry.
struct Compiler {
    strict_ids: bool,
    steps: Vec<Step>,
    routes: Vec<Route>,
    names: HashSet<String>,
}

impl Compiler {
    fn compile(flow: &Flow, scope: Scope, next: Option<String>, strict_ids: bool) -> Result<Compiled, ConstructionError> {
        let mut compiler = Compiler {
            strict_ids,
            steps: Vec::new(),
            routes: Vec::new(),
            names: HashSet::new(),
        };
        let (entry, terminal) = compiler.chain(flow, &scope, next)?;
        Ok(Compiled {
            steps: compiler.steps,
            routes: compiler.routes,
            entry,
            terminal,
        })
    }

    /// Compile one chain. Returns its entry and terminal step names.
    fn chain(&mut self, flow: &Flow, scope: &Scope, next: Option<String>) -> Result<(String, String), ConstructionError> {
        let mut nodes = Vec::new();
        let mut cursor = Some(flow);
        while let Some(node) = cursor {
            nodes.push(node);
            cursor = node.upstream.as_deref();
        }
        nodes.reverse();

        let names = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| scope.name_for(node, i, self.strict_ids))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, node) in nodes.iter().enumerate() {
            let name = names[i].clone();
            let downstream = names.get(i + 1).cloned().or_else(|| next.clone());
            let source = if i == 0 { None } else { Some(names[i - 1].clone()) };

            let (kind, step_next) = match &node.kind {
                FlowKind::Constant(value) => (StepKind::Constant(value.clone()), downstream),
                FlowKind::Map(f) => (StepKind::Map(f.clone()), downstream),
                FlowKind::FlatMap(f) => (StepKind::FlatMap(f.clone()), downstream),
                FlowKind::Call { call_type, on_init } => {
                    self.route(call_type, &name, None)?;
                    let kind = StepKind::Call {
                        call_type: call_type.clone(),
                        on_init: on_init.clone(),
                        gate: i > 0,
                    };
                    (kind, downstream)
                }
                FlowKind::Delay { millis, value } => (
                    StepKind::Delay {
                        millis: *millis,
                        value: value.clone(),
                    },
                    downstream,
                ),
                FlowKind::MultiCall { call_types, mode, on_init } => {
                    if call_types.is_empty() {
                        return Err(ConstructionError::EmptyBranches(name));
                    }
                    for (slot, call_type) in call_types.iter().enumerate() {
                        self.route(call_type, &name, Some(slot))?;
                    }
                    let kind = StepKind::MultiCall {
                        arity: call_types.len(),
                        mode: *mode,
                        on_init: on_init.clone(),
                        fan_in: false,
                    };
                    (kind, downstream)
                }
                FlowKind::Zip { branches, triggers, combiner } => {
                    let reducer = Reducer::Combine(combiner.clone());
                    let fan = self.fan_out(&name, branches, triggers, JoinMode::All, reducer, downstream)?;
                    (StepKind::Zip(fan), None)
                }
                FlowKind::Or { branches, triggers, judger } => {
                    let reducer = Reducer::Judge(judger.clone());
                    let fan = self.fan_out(&name, branches, triggers, JoinMode::First, reducer, downstream)?;
                    (StepKind::Or(fan), None)
                }
            };

            self.push(Step {
                name,
                debug_name: node.debug_name.clone(),
                next: step_next,
                source,
                kind,
                on_error: node.on_error.clone(),
                mock: node.mock.clone(),
            })?;
        }

        let entry = names.first().cloned().unwrap_or_default();
        let terminal = names.last().cloned().unwrap_or_default();
        Ok((entry, terminal))
    }

    /// Wire the branches, forwarders, join and collector of a zip or race.
    fn fan_out(
        &mut self,
        name: &str,
        branches: &[Flow],
        triggers: &[TriggerFn],
        mode: JoinMode,
        reducer: Reducer,
        downstream: Option<String>,
    ) -> Result<FanOut, ConstructionError> {
        if branches.is_empty() {
            return Err(ConstructionError::EmptyBranches(name.to_string()));
        }
        if !triggers.is_empty() && triggers.len() != branches.len() {
            return Err(ConstructionError::TriggerCountMismatch {
                step: name.to_string(),
                branches: branches.len(),
                triggers: triggers.len(),
            });
        }

        let join = format!("{}#join", name);
        let collect = format!("{}#collect", name);
        let mut entries = Vec::with_capacity(branches.len());
        let mut slots = Vec::with_capacity(branches.len());

        for (slot, branch) in branches.iter().enumerate() {
            let call_type = format!("{}#slot{}", name, slot);
            let forward = format!("{}#forward{}", name, slot);
            let scope = Scope::Nested(format!("{}#branch{}", name, slot));
            let (entry, terminal) = self.chain(branch, &scope, Some(forward.clone()))?;

            self.routes.push(Route {
                call_type: call_type.clone(),
                step: join.clone(),
                slot: Some(slot),
                dynamic: false,
            });
            self.push(Step {
                name: forward,
                debug_name: None,
                next: None,
                source: Some(terminal),
                kind: StepKind::Forward {
                    call_type: call_type.clone(),
                    slot,
                },
                on_error: None,
                mock: None,
            })?;
            entries.push(entry);
            slots.push(call_type);
        }

        self.push(Step {
            name: join.clone(),
            debug_name: None,
            next: Some(collect.clone()),
            source: None,
            kind: StepKind::MultiCall {
                arity: branches.len(),
                mode,
                on_init: None,
                fan_in: true,
            },
            on_error: None,
            mock: None,
        })?;
        self.push(Step {
            name: collect,
            debug_name: None,
            next: downstream,
            source: Some(join.clone()),
            kind: StepKind::Collect(reducer),
            on_error: None,
            mock: None,
        })?;

        Ok(FanOut {
            branches: entries,
            slots,
            join,
            triggers: triggers.to_vec(),
        })
    }

    fn route(&mut self, call_type: &str, step: &str, slot: Option<usize>) -> Result<(), ConstructionError> {
        if call_type.contains('#') {
            return Err(ConstructionError::ReservedCallType(call_type.to_string()));
        }
        if let Some(existing) = self.routes.iter().find(|r| r.call_type == call_type) {
            return Err(ConstructionError::DuplicateCallType {
                call_type: call_type.to_string(),
                existing: existing.step.clone(),
                step: step.to_string(),
            });
        }
        self.routes.push(Route {
            call_type: call_type.to_string(),
            step: step.to_string(),
            slot,
            dynamic: false,
        });
        Ok(())
    }

    fn push(&mut self, step: Step) -> Result<(), ConstructionError> {
        if !self.names.insert(step.name.clone()) {
            return Err(ConstructionError::DuplicateId(step.name));
        }
        self.steps.push(step);
        Ok(())
    }
}
