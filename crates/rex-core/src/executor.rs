//! Branch coordinator
//!
//! The [`Executor`] clones the experiment template into one [`Branch`] per
//! configuration and steps them through the units in lock-step: every branch
//! finishes unit K before any branch starts unit K+1.
//!
//! Root units run once per iteration on a single branch and their effect is
//! adopted by the others before the next unit is dispatched. Non-root units
//! are fanned out over a rayon pool (or a plain loop with [`Target::For`]).
//!
//! # Example
//!
//! ```rust
//! use rex_core::{Config, Executor, ExecutorConfig, Experiment, UnitOptions};
//! use rex_expr::{Expr, Value};
//!
//! let experiment = Experiment::new()
//!     .add_callable("ten", |_| Ok(Value::from(10)), UnitOptions::new().root())
//!     .add_callable(
//!         "sum",
//!         |args| {
//!             let a = args.require("a")?.as_i64().unwrap_or_default();
//!             let b = args.require("b")?.as_i64().unwrap_or_default();
//!             Ok(Value::from(a + b))
//!         },
//!         UnitOptions::new()
//!             .kwarg("a", Expr::config("x"))
//!             .kwarg("b", Expr::output("ten")),
//!     );
//!
//! let mut executor = Executor::new(experiment, ExecutorConfig::new().with_n_iters(1))
//!     .with_configs(vec![Config::new().with("x", 10), Config::new().with("x", 20)]);
//! let report = executor.run().unwrap();
//!
//! assert_eq!(report.completed(), 2);
//! assert_eq!(executor.branch(0).and_then(|b| b.output("sum")), Some(&Value::from(20)));
//! assert_eq!(executor.branch(1).and_then(|b| b.output("sum")), Some(&Value::from(30)));
//! ```

use crate::branch::{Branch, BranchEnv, BranchId, BranchReport, BranchStatus, CallOutcome};
use crate::config::Config;
use crate::error::{ExperimentError, Result};
use crate::experiment::Experiment;
use crate::monitor::Monitor;
use crate::settings::{ExecutorConfig, Target};
use crate::sink::ResultsSink;
use crate::unit::UnitHandle;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Key of the branch config holding the branch id
const ID_KEY: &str = "id";

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Executor name
    pub name: String,
    /// Iterations stepped by the coordinator
    pub iterations: usize,
    /// Seed every branch seed was derived from
    pub seed: u64,
    /// One entry per branch, in branch order
    pub branches: Vec<BranchReport>,
}

impl RunReport {
    /// Branches that ran until the budget or the global stop
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(|status| matches!(status, BranchStatus::Completed))
    }

    /// Branches stopped by a stream end
    #[must_use]
    pub fn exhausted(&self) -> usize {
        self.count(|status| matches!(status, BranchStatus::Exhausted))
    }

    /// Branches stopped by a unit error
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, BranchStatus::Failed { .. }))
    }

    /// Branches stopped by a run-level error
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.count(|status| matches!(status, BranchStatus::Aborted { .. }))
    }

    /// No branch failed or was aborted
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.aborted() == 0
    }

    fn count(&self, predicate: impl Fn(&BranchStatus) -> bool) -> usize {
        self.branches.iter().filter(|b| predicate(&b.status)).count()
    }
}

/// Unit as seen by the run loop
#[derive(Debug, Clone)]
struct Planned {
    name: String,
    root: bool,
    instance: Option<String>,
}

/// Runs an experiment over a set of configurations
pub struct Executor {
    template: Experiment,
    settings: ExecutorConfig,
    configs: Vec<Config>,
    branch_configs: Vec<Config>,
    executor_config: Config,
    monitor: Option<Arc<dyn Monitor>>,
    sink: Option<Arc<dyn ResultsSink>>,
    branches: Vec<Branch>,
    iterations: usize,
    seed: u64,
}

impl Executor {
    /// Create executor for `template`
    #[must_use]
    pub fn new(template: Experiment, settings: ExecutorConfig) -> Self {
        Self {
            template,
            settings,
            configs: Vec::new(),
            branch_configs: Vec::new(),
            executor_config: Config::new(),
            monitor: None,
            sink: None,
            branches: Vec::new(),
            iterations: 0,
            seed: 0,
        }
    }

    /// With one config per branch
    #[inline]
    #[must_use]
    pub fn with_configs(mut self, configs: Vec<Config>) -> Self {
        self.configs = configs;
        self
    }

    /// With branch-specific overrides, one per branch
    #[inline]
    #[must_use]
    pub fn with_branch_configs(mut self, branch_configs: Vec<Config>) -> Self {
        self.branch_configs = branch_configs;
        self
    }

    /// With a config merged into every branch config
    #[inline]
    #[must_use]
    pub fn with_executor_config(mut self, config: Config) -> Self {
        self.executor_config = config;
        self
    }

    /// With a monitor notified of branch and unit events
    #[inline]
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// With a sink receiving results
    #[inline]
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Executor settings
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &ExecutorConfig {
        &self.settings
    }

    /// Branches of the latest run
    #[inline]
    #[must_use]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Branch by index
    #[inline]
    #[must_use]
    pub fn branch(&self, index: usize) -> Option<&Branch> {
        self.branches.get(index)
    }

    /// Number of branches a run creates
    #[must_use]
    pub fn n_branches(&self) -> usize {
        if self.configs.is_empty() {
            self.branch_configs.len().max(1)
        } else {
            self.configs.len()
        }
    }

    /// Summary of the latest run
    #[must_use]
    pub fn report(&self) -> RunReport {
        RunReport {
            name: self.settings.name.clone(),
            iterations: self.iterations,
            seed: self.seed,
            branches: self.branches.iter().map(Branch::report).collect(),
        }
    }

    /// Run every branch until the iteration budget is spent or no branch is
    /// alive
    ///
    /// Each call starts from fresh branches. Results are flushed to the sink
    /// even when the run fails.
    ///
    /// # Errors
    ///
    /// - [`ExperimentError::ConfigLengthMismatch`] or
    ///   [`ExperimentError::Config`] before anything runs
    /// - [`ExperimentError::ThreadPool`] when the worker pool cannot start
    /// - [`ExperimentError::RootUnit`] when a root unit fails
    /// - [`ExperimentError::UnitExecution`] on a unit error in debug mode
    pub fn run(&mut self) -> Result<RunReport> {
        self.settings.validate()?;
        self.seed = self.settings.seed.unwrap_or_else(rand::random);
        self.branches = self.create_branches()?;
        self.iterations = 0;
        let pool = match self.settings.target {
            Target::Threads => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.settings.workers.unwrap_or(self.branches.len()).max(1))
                    .thread_name(|i| format!("rex-worker-{i}"))
                    .build()
                    .map_err(|e| ExperimentError::ThreadPool(e.to_string()))?,
            ),
            Target::For => None,
        };

        tracing::info!(
            "{} started: {} branches, target {:?}",
            self.settings.name,
            self.branches.len(),
            self.settings.target
        );
        for branch in &self.branches {
            branch.start();
        }

        let plan = self.plan();
        let outcome = self.step_all(&plan, pool.as_ref());
        if let Err(err) = &outcome {
            tracing::error!("{} aborted: {err}", self.settings.name);
            let cause = err.to_string();
            for branch in &mut self.branches {
                branch.abort(&cause);
            }
        }
        self.finalize();
        outcome?;

        let report = self.report();
        tracing::info!(
            "{} finished after {} iterations: {} completed, {} exhausted, {} failed",
            report.name,
            report.iterations,
            report.completed(),
            report.exhausted(),
            report.failed()
        );
        Ok(report)
    }

    fn step_all(&mut self, plan: &[Planned], pool: Option<&rayon::ThreadPool>) -> Result<()> {
        let n_iters = self.settings.n_iters;
        let mut iteration = 0;
        while n_iters.map_or(true, |n| iteration < n) {
            for unit in plan {
                if unit.root {
                    call_root(&mut self.branches, unit, iteration, n_iters)?;
                } else {
                    call_each(pool, &mut self.branches, &unit.name, iteration, n_iters)?;
                }
            }
            iteration += 1;
            self.iterations = iteration;
            if !self.branches.iter().any(Branch::is_alive) {
                tracing::debug!("{}: no branch alive after iteration {}", self.settings.name, iteration - 1);
                break;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) {
        for branch in &mut self.branches {
            branch.finish();
        }
    }

    fn plan(&self) -> Vec<Planned> {
        self.template
            .units()
            .map(|unit| Planned {
                name: unit.name().to_string(),
                root: unit.is_root(),
                instance: unit.created_instance().map(str::to_string),
            })
            .collect()
    }

    /// `config + branch_config + executor_config` for every branch
    fn branch_configs(&self) -> Result<Vec<Config>> {
        if !self.configs.is_empty()
            && !self.branch_configs.is_empty()
            && self.configs.len() != self.branch_configs.len()
        {
            return Err(ExperimentError::ConfigLengthMismatch {
                configs: self.configs.len(),
                branch_configs: self.branch_configs.len(),
            });
        }
        let empty = Config::new();
        Ok((0..self.n_branches())
            .map(|i| {
                let base = self.configs.get(i).unwrap_or(&empty);
                let branch = self.branch_configs.get(i).unwrap_or(&empty);
                base.merge(branch).merge(&self.executor_config)
            })
            .collect())
    }

    fn create_branches(&self) -> Result<Vec<Branch>> {
        let configs = self.branch_configs()?;
        let roots: IndexMap<String, UnitHandle> = self
            .template
            .units()
            .filter(|unit| unit.is_root())
            .map(|unit| (unit.name().to_string(), unit.fresh().into_handle()))
            .collect();
        let creators = Arc::new(self.template.creators().clone());
        let mut seeds = StdRng::seed_from_u64(self.seed);
        let env = BranchEnv {
            task: self.settings.name.clone(),
            abort: self.settings.abort,
            debug: self.settings.debug,
            monitor: self.monitor.clone(),
            sink: self.sink.clone(),
        };

        Ok(configs
            .into_iter()
            .enumerate()
            .map(|(index, mut config)| {
                let id = config
                    .pop(ID_KEY)
                    .map_or_else(BranchId::generate, |id| BranchId(id.to_alias_string()));
                let units = self
                    .template
                    .units()
                    .map(|unit| {
                        let handle = roots
                            .get(unit.name())
                            .cloned()
                            .unwrap_or_else(|| unit.fresh().into_handle());
                        (unit.name().to_string(), handle)
                    })
                    .collect();
                let seed = seeds.next_u64() >> 1;
                Branch::new(index, id, seed, config, units, Arc::clone(&creators), env.clone())
            })
            .collect())
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("template", &self.template)
            .field("settings", &self.settings)
            .field("n_branches", &self.n_branches())
            .finish_non_exhaustive()
    }
}

/// Fire a root unit once and let every other branch adopt its effect
///
/// The unit runs on branch 0, or on the first branch still accepting it when
/// branch 0 stopped.
fn call_root(
    branches: &mut [Branch],
    unit: &Planned,
    iteration: usize,
    n_iters: Option<usize>,
) -> Result<()> {
    let Some(source) = branches.iter().position(|b| b.accepts(&unit.name)) else {
        return Ok(());
    };
    let outcome = match branches[source].call(&unit.name, iteration, n_iters) {
        Ok(outcome) => outcome,
        Err(ExperimentError::UnitExecution { unit, trace, .. }) => {
            return Err(ExperimentError::RootUnit { unit, trace });
        }
        Err(err) => return Err(err),
    };
    if outcome == CallOutcome::Failed {
        let trace = branches[source]
            .exception()
            .map(|err| err.trace.clone())
            .unwrap_or_default();
        return Err(ExperimentError::RootUnit {
            unit: unit.name.clone(),
            trace,
        });
    }

    let (before, rest) = branches.split_at_mut(source);
    let Some((fired, after)) = rest.split_first_mut() else {
        return Ok(());
    };
    for branch in before.iter_mut().chain(after.iter_mut()) {
        branch.adopt_root(&unit.name, fired, outcome, unit.instance.as_deref());
    }
    Ok(())
}

/// Dispatch a unit to every accepting branch and wait for all of them
fn call_each(
    pool: Option<&rayon::ThreadPool>,
    branches: &mut [Branch],
    name: &str,
    iteration: usize,
    n_iters: Option<usize>,
) -> Result<()> {
    let call = |branch: &mut Branch| -> Result<()> {
        if branch.accepts(name) {
            branch.call(name, iteration, n_iters)?;
        }
        Ok(())
    };
    let results: Vec<Result<()>> = match pool {
        Some(pool) => pool.install(|| branches.par_iter_mut().map(call).collect()),
        None => branches.iter_mut().map(call).collect(),
    };
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::UnitOptions;
    use crate::schedule::Schedule;
    use crate::settings::AbortPolicy;
    use pretty_assertions::assert_eq;
    use rex_expr::{Expr, Value};

    fn constant(value: i64) -> impl Fn(&rex_expr::Args) -> anyhow::Result<Value> + Send + Sync {
        move |_: &rex_expr::Args| Ok(Value::from(value))
    }

    #[test]
    fn one_branch_without_configs() {
        let executor = Executor::new(Experiment::new(), ExecutorConfig::new());
        assert_eq!(executor.n_branches(), 1);
    }

    #[test]
    fn branch_configs_must_match_configs() {
        let mut executor = Executor::new(Experiment::new(), ExecutorConfig::new())
            .with_configs(vec![Config::new(), Config::new()])
            .with_branch_configs(vec![Config::new()]);
        let err = executor.run().unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::ConfigLengthMismatch {
                configs: 2,
                branch_configs: 1
            }
        ));
    }

    #[test]
    fn configs_are_layered_and_id_is_popped() {
        let executor = Executor::new(Experiment::new(), ExecutorConfig::new())
            .with_configs(vec![Config::new().with("x", 1).with("y", 1)])
            .with_branch_configs(vec![Config::new().with("y", 2).with("id", "first")])
            .with_executor_config(Config::new().with("device", "cpu"));
        let configs = executor.branch_configs().unwrap();
        assert_eq!(configs[0].get("y"), Some(&Value::from(2)));
        assert_eq!(configs[0].get("device"), Some(&Value::from("cpu")));

        let branches = executor.create_branches().unwrap();
        assert_eq!(branches[0].id().as_str(), "first");
        assert!(!branches[0].config().contains_key("id"));
    }

    #[test]
    fn budget_bounds_iterations() {
        let experiment = Experiment::new().add_callable("one", constant(1), UnitOptions::new());
        let mut executor = Executor::new(
            experiment,
            ExecutorConfig::new().with_target(Target::For).with_n_iters(4),
        );
        let report = executor.run().unwrap();
        assert_eq!(report.iterations, 4);
        assert_eq!(report.branches[0].iterations, 4);
        assert_eq!(report.completed(), 1);
        assert!(executor.branch(0).is_some_and(Branch::is_last));
    }

    #[test]
    fn root_failure_is_fatal() {
        let experiment = Experiment::new()
            .add_callable("boom", |_| anyhow::bail!("no data"), UnitOptions::new().root())
            .add_callable("after", constant(1), UnitOptions::new());
        let mut executor = Executor::new(experiment, ExecutorConfig::new().with_n_iters(3))
            .with_configs(vec![Config::new(), Config::new()]);
        let err = executor.run().unwrap_err();
        assert!(matches!(err, ExperimentError::RootUnit { ref unit, .. } if unit == "boom"));
        assert!(err.is_fatal());
        assert!(executor.branches().iter().all(|b| !b.is_alive()));
        assert!(executor.branches().iter().all(|b| b.output("after").is_none()));
    }

    #[test]
    fn debug_mode_escalates_unit_errors() {
        let experiment = Experiment::new()
            .add_callable("boom", |_| anyhow::bail!("bad"), UnitOptions::new());
        let mut executor = Executor::new(
            experiment,
            ExecutorConfig::new().with_n_iters(2).with_debug(true),
        );
        let err = executor.run().unwrap_err();
        assert!(matches!(err, ExperimentError::UnitExecution { branch: 0, .. }));
    }

    #[test]
    fn finish_iteration_policy_runs_remaining_units() {
        let experiment = Experiment::new()
            .add_callable("boom", |_| anyhow::bail!("bad"), UnitOptions::new())
            .add_callable("after", constant(7), UnitOptions::new());
        let mut executor = Executor::new(
            experiment,
            ExecutorConfig::new()
                .with_target(Target::For)
                .with_n_iters(5)
                .with_abort(AbortPolicy::FinishIteration),
        );
        let report = executor.run().unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(executor.branch(0).and_then(|b| b.output("after")), Some(&Value::from(7)));
    }

    #[test]
    fn eager_policy_skips_remaining_units() {
        let experiment = Experiment::new()
            .add_callable("boom", |_| anyhow::bail!("bad"), UnitOptions::new())
            .add_callable("after", constant(7), UnitOptions::new())
            .save(Expr::lit(1), "marker", Schedule::always());
        let mut executor = Executor::new(
            experiment,
            ExecutorConfig::new().with_target(Target::For).with_n_iters(5),
        );
        executor.run().unwrap();
        let branch = executor.branch(0).unwrap();
        assert!(branch.output("after").is_none());
        assert!(branch.output("__save_results_0").is_some());
    }

    #[test]
    fn report_serializes_status_tags() {
        let report = RunReport {
            name: "executor".to_string(),
            iterations: 1,
            seed: 7,
            branches: vec![BranchReport {
                id: "a".to_string(),
                index: 0,
                iterations: 1,
                seed: 3,
                status: BranchStatus::Exhausted,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["branches"][0]["status"]["status"], "exhausted");
        assert!(report.is_success());
    }
}
