//! Branches
//!
//! A [`Branch`] is one configuration's run of an experiment: its config,
//! its units, the instances it built, the latest output of every unit and
//! the result series saved so far.
//!
//! # State machine
//!
//! ```text
//! Alive ──(unit error / stream end)──> Alive+Failed ──(last unit, or eager)──> Dead
//! ```
//!
//! `alive` only goes down, `failed` and `last` only go up. Dead branches
//! still run always-run (`__`) units so results are saved and dumped.

use crate::action::{Action, Pull, SharedInstance};
use crate::config::{Config, ConfigAlias};
use crate::error::{ExperimentError, Result, UnitFailure};
use crate::instance::InstanceCreator;
use crate::monitor::Monitor;
use crate::settings::AbortPolicy;
use crate::sink::{Results, ResultsSink};
use crate::unit::{is_always_run, Body, Builtin, Step, UnitHandle};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rex_expr::{Args, ResolveContext, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use ulid::Ulid;

/// Branch identifier
///
/// Taken from the `id` key of the branch config when present, otherwise a
/// fresh ULID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl BranchId {
    /// Generate a new sortable id
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Id as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error captured by a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    /// Unit that failed
    pub unit: String,
    /// Formatted error chain
    pub trace: String,
}

/// Final state of a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
    /// Ran until the budget or until every branch stopped
    Completed,
    /// Stopped early because a stream ended
    Exhausted,
    /// Stopped because a unit failed
    Failed {
        /// Unit that failed
        unit: String,
        /// Formatted error chain
        trace: String,
    },
    /// Still running when a run-level error stopped every branch
    Aborted {
        /// Run-level error
        cause: String,
    },
}

/// Per-branch summary of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchReport {
    /// Branch id
    pub id: String,
    /// Branch index
    pub index: usize,
    /// Iterations the branch was alive for
    pub iterations: usize,
    /// Seed the branch's random generator starts from
    pub seed: u64,
    /// Final state
    pub status: BranchStatus,
}

/// What happened to one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    /// Branch is dead and the unit is not always-run
    Skipped,
    /// Schedule did not fire; previous output kept
    NoFire,
    /// Unit produced a value
    Fired,
    /// Unit's stream ended
    Exhausted,
    /// Unit failed
    Failed,
}

/// Shared run settings handed to every branch
#[derive(Clone)]
pub(crate) struct BranchEnv {
    pub(crate) task: String,
    pub(crate) abort: AbortPolicy,
    pub(crate) debug: bool,
    pub(crate) monitor: Option<Arc<dyn Monitor>>,
    pub(crate) sink: Option<Arc<dyn ResultsSink>>,
}

/// One configuration's run of an experiment
pub struct Branch {
    id: BranchId,
    index: usize,
    config: Config,
    alias: ConfigAlias,
    units: IndexMap<String, UnitHandle>,
    creators: Arc<IndexMap<String, InstanceCreator>>,
    instances: IndexMap<String, SharedInstance>,
    outputs: IndexMap<String, Value>,
    results: Results,
    alive: bool,
    failed: bool,
    last: bool,
    iteration: usize,
    active_iterations: usize,
    exception: Option<UnitError>,
    aborted: Option<String>,
    seed: u64,
    env: BranchEnv,
    span: Option<tracing::Span>,
}

impl Branch {
    pub(crate) fn new(
        index: usize,
        id: BranchId,
        seed: u64,
        config: Config,
        units: IndexMap<String, UnitHandle>,
        creators: Arc<IndexMap<String, InstanceCreator>>,
        env: BranchEnv,
    ) -> Self {
        let span = tracing::info_span!("branch", id = %id, index);
        let alias = config.alias();
        Self {
            id,
            index,
            config,
            alias,
            units,
            creators,
            instances: IndexMap::new(),
            outputs: IndexMap::new(),
            results: Results::new(),
            alive: true,
            failed: false,
            last: false,
            iteration: 0,
            active_iterations: 0,
            exception: None,
            aborted: None,
            seed,
            env,
            span: Some(span),
        }
    }

    /// Branch id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &BranchId {
        &self.id
    }

    /// Position of the branch in the executor
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Full branch config
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flat string view of the config
    #[inline]
    #[must_use]
    pub fn alias(&self) -> &ConfigAlias {
        &self.alias
    }

    /// Branch still runs regular units
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// A unit failed or a stream ended
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// The current iteration is the last one
    #[inline]
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Iteration of the latest call
    #[inline]
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Latest output of a unit
    #[inline]
    #[must_use]
    pub fn output(&self, unit: &str) -> Option<&Value> {
        self.outputs.get(unit)
    }

    /// Latest outputs of all units that fired
    #[inline]
    #[must_use]
    pub fn outputs(&self) -> &IndexMap<String, Value> {
        &self.outputs
    }

    /// Result series not yet flushed
    #[inline]
    #[must_use]
    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Seed of the branch's random generator
    ///
    /// Derived from the executor seed and the branch index, so a seeded run
    /// gives every branch the same stream again.
    #[inline]
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fresh random generator seeded with [`Branch::seed`]
    #[must_use]
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Error that failed the branch
    #[inline]
    #[must_use]
    pub fn exception(&self) -> Option<&UnitError> {
        self.exception.as_ref()
    }

    /// Instance built in this branch
    #[inline]
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&SharedInstance> {
        self.instances.get(name)
    }

    /// Summary of the branch
    #[must_use]
    pub fn report(&self) -> BranchReport {
        let status = match (&self.exception, &self.aborted, self.failed) {
            (Some(err), _, _) => BranchStatus::Failed {
                unit: err.unit.clone(),
                trace: err.trace.clone(),
            },
            (None, Some(cause), _) => BranchStatus::Aborted {
                cause: cause.clone(),
            },
            (None, None, true) => BranchStatus::Exhausted,
            (None, None, false) => BranchStatus::Completed,
        };
        BranchReport {
            id: self.id.to_string(),
            index: self.index,
            iterations: self.active_iterations,
            seed: self.seed,
            status,
        }
    }

    /// Whether the executor should dispatch `unit` to this branch
    #[inline]
    pub(crate) fn accepts(&self, unit: &str) -> bool {
        self.alive || is_always_run(unit)
    }

    pub(crate) fn start(&self) {
        let _entered = self.span.as_ref().map(tracing::Span::enter);
        tracing::info!(
            "{}[{}] has been started with config: {:?}",
            self.env.task,
            self.index,
            self.alias
        );
        if let Some(monitor) = &self.env.monitor {
            monitor.branch_started(self);
        }
    }

    /// Execute one unit for one iteration
    ///
    /// Unit errors are contained in the branch. In debug mode a unit error
    /// other than stream exhaustion is returned instead.
    pub(crate) fn call(
        &mut self,
        name: &str,
        iteration: usize,
        n_iters: Option<usize>,
    ) -> Result<CallOutcome> {
        if !self.accepts(name) {
            return Ok(CallOutcome::Skipped);
        }
        self.last = self.last || n_iters.is_some_and(|n| iteration + 1 == n);
        self.iteration = iteration;
        if self.alive {
            self.active_iterations = iteration + 1;
        }

        let span = self.span.clone().unwrap_or_else(tracing::Span::none);
        let _entered = span.enter();
        let n_label = n_iters.map_or_else(|| "?".to_string(), |n| n.to_string());
        tracing::debug!("Execute '{name}' [{iteration}/{n_label}]");

        let fired = panic::catch_unwind(AssertUnwindSafe(|| self.fire(name, iteration, n_iters)))
            .unwrap_or_else(|payload| Err(UnitFailure::from_panic(payload.as_ref())));

        let mut escalate = None;
        let outcome = match fired {
            Ok(None) => CallOutcome::NoFire,
            Ok(Some(value)) => {
                self.outputs.insert(name.to_string(), value);
                if let Some(monitor) = self.env.monitor.clone() {
                    monitor.unit_executed(name, self);
                }
                CallOutcome::Fired
            }
            Err(UnitFailure::Exhausted) => {
                self.failed = true;
                self.last = true;
                tracing::info!("Stop '{name}' [{iteration}/{n_label}]");
                if let Some(monitor) = self.env.monitor.clone() {
                    monitor.iteration_stopped(name, self);
                }
                CallOutcome::Exhausted
            }
            Err(UnitFailure::Error {
                trace,
                configuration_bug,
            }) => {
                self.failed = true;
                self.last = true;
                if configuration_bug {
                    tracing::error!("Fail '{name}' [{iteration}/{n_label}]: definition error: {trace}");
                } else {
                    tracing::error!("Fail '{name}' [{iteration}/{n_label}]: Exception\n{trace}");
                }
                if self.exception.is_none() {
                    self.exception = Some(UnitError {
                        unit: name.to_string(),
                        trace: trace.clone(),
                    });
                }
                if let Some(monitor) = self.env.monitor.clone() {
                    monitor.unit_failed(name, self, &trace);
                }
                if self.env.debug {
                    escalate = Some(ExperimentError::UnitExecution {
                        unit: name.to_string(),
                        branch: self.index,
                        trace,
                    });
                }
                CallOutcome::Failed
            }
        };

        self.settle(name);
        match escalate {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Run the unit body; `None` when the schedule did not fire
    fn fire(
        &mut self,
        name: &str,
        iteration: usize,
        n_iters: Option<usize>,
    ) -> std::result::Result<Option<Value>, UnitFailure> {
        let handle = self
            .units
            .get(name)
            .cloned()
            .ok_or_else(|| ExperimentError::UnknownUnit(name.to_string()))?;
        let step = handle
            .lock()
            .prepare(iteration, n_iters, self.last, &self.instances)?;
        let Step::Run { body, args } = step else {
            return Ok(None);
        };
        let args = args.resolve(&*self)?;

        let pulled = match body {
            Body::Action(Action::Callable(func)) => {
                Pull::Item(func(&args).map_err(|err| UnitFailure::from_user(&err))?)
            }
            Body::Action(Action::Generator(build)) => handle.lock().pull(&build, &args)?,
            Body::Pipeline { pipeline, mode } => {
                handle.lock().drive(&pipeline, mode, &args, &self.config)?
            }
            Body::Builtin(builtin) => Pull::Item(self.apply(builtin, args)?),
        };
        match pulled {
            Pull::Item(value) => Ok(Some(value)),
            Pull::End => Err(UnitFailure::Exhausted),
        }
    }

    fn apply(&mut self, builtin: Builtin, args: Args) -> std::result::Result<Value, UnitFailure> {
        match builtin {
            Builtin::Save { dsts } => {
                if args.positional.len() != dsts.len() {
                    let err = anyhow::anyhow!(
                        "length of sources and destinations must be the same ({} != {})",
                        args.positional.len(),
                        dsts.len()
                    );
                    return Err(UnitFailure::from_user(&err));
                }
                for (dst, value) in dsts.into_iter().zip(args.positional) {
                    self.results.entry(dst).or_default().insert(self.iteration, value);
                }
            }
            Builtin::Dump { variables } => self.dump(variables.as_deref()),
            Builtin::CreateInstance { name } => {
                let creator = self
                    .creators
                    .get(&name)
                    .ok_or_else(|| ExperimentError::UnknownInstance(name.clone()))?;
                let instance = creator
                    .create(&args)
                    .map_err(|err| UnitFailure::from_user(&err))?;
                self.instances.insert(name, instance);
            }
        }
        Ok(Value::Null)
    }

    /// Send result series to the sink value by value and drop them
    fn dump(&mut self, variables: Option<&[String]>) {
        let Some(sink) = self.env.sink.clone() else {
            return;
        };
        let names: Vec<String> = match variables {
            Some(names) => names.to_vec(),
            None => self.results.keys().cloned().collect(),
        };
        for name in names {
            if let Some(series) = self.results.shift_remove(&name) {
                tracing::debug!("Dump '{name}' ({} values)", series.len());
                for (iteration, value) in &series {
                    sink.record_value(self.id.as_str(), &name, *iteration, value);
                }
            }
        }
    }

    /// Take over the effect of a root unit fired on `source`
    ///
    /// The output is copied when this branch accepts the unit. A stream end
    /// stops this branch the same way it stopped `source`; a success leaves
    /// this branch's own flags alone.
    pub(crate) fn adopt_root(
        &mut self,
        unit: &str,
        source: &Branch,
        outcome: CallOutcome,
        instance: Option<&str>,
    ) {
        if self.accepts(unit) {
            if let Some(value) = source.outputs.get(unit) {
                self.outputs.insert(unit.to_string(), value.clone());
            }
            if self.alive {
                self.active_iterations = source.iteration + 1;
            }
        }
        if let Some(name) = instance {
            if let Some(shared) = source.instances.get(name) {
                self.instances.insert(name.to_string(), Arc::clone(shared));
            }
        }
        self.iteration = source.iteration;
        if outcome == CallOutcome::Exhausted {
            self.failed = true;
            self.last = true;
        }
        self.settle(unit);
    }

    /// Apply the abort policy after `unit` ran
    fn settle(&mut self, unit: &str) {
        let is_last_unit = self.units.last().is_some_and(|(last, _)| last == unit);
        if self.failed && (is_last_unit || self.env.abort == AbortPolicy::Eager) {
            self.alive = false;
        }
    }

    /// Mark the branch dead after a run-level failure
    ///
    /// Only a branch still alive records `cause`; one that already stopped
    /// keeps its own status.
    pub(crate) fn abort(&mut self, cause: &str) {
        if self.alive && self.exception.is_none() {
            self.aborted = Some(cause.to_string());
        }
        self.alive = false;
        self.failed = true;
    }

    /// Report the branch finished, flush its results and close its span
    pub(crate) fn finish(&mut self) {
        {
            let _entered = self.span.as_ref().map(tracing::Span::enter);
            if let Some(monitor) = &self.env.monitor {
                monitor.branch_finished(self);
            }
            tracing::info!("{}[{}] has been finished", self.env.task, self.index);
        }
        if let Some(sink) = self.env.sink.clone() {
            let results = std::mem::take(&mut self.results);
            sink.put(self.id.as_str(), results, &self.alias);
        }
        self.span = None;
    }
}

impl ResolveContext for Branch {
    fn output(&self, name: &str) -> Option<Value> {
        self.outputs.get(name).cloned()
    }

    fn config_value(&self, key: &str) -> Option<Value> {
        self.config.get(key).cloned()
    }

    fn config(&self) -> Value {
        self.config.to_value()
    }

    fn branch(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert("id".to_string(), Value::from(self.id.as_str()));
        map.insert("index".to_string(), Value::from(self.index));
        map.insert("iteration".to_string(), Value::from(self.iteration));
        map.insert(
            "seed".to_string(),
            Value::from(i64::try_from(self.seed).unwrap_or(i64::MAX)),
        );
        map.insert("config".to_string(), self.config.to_value());
        Value::Map(map)
    }

    fn variable(&self, unit: &str, name: &str) -> Option<Value> {
        let pipeline = self.units.get(unit)?.lock().pipeline()?;
        let value = pipeline.lock().variable(name);
        value
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("alive", &self.alive)
            .field("failed", &self.failed)
            .field("last", &self.last)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}
