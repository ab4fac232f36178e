//! Testing utilities for REX workspace
//!
//! Shared test helpers, fixtures, and probes.

#![allow(missing_docs)]

use indexmap::IndexMap;
use parking_lot::Mutex;
use rex_core::pipeline::shared;
use rex_core::{
    Action, Config, ExecutorConfig, Instance, InstanceCreator, PipelineAdapter, SharedPipeline,
    Target, UnitOptions, UnitStream,
};
use rex_expr::{Args, Expr, Value};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// One recorded unit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub branch: usize,
    pub unit: String,
    pub iteration: usize,
}

/// Shared log of unit calls across branches
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callable that records the call and returns the iteration
    ///
    /// Needs the `branch` argument from [`CallLog::options`].
    pub fn probe(&self, unit: &str) -> Action {
        let log = Arc::clone(&self.inner);
        let unit = unit.to_string();
        Action::callable(move |args| {
            let branch = args.require("branch")?;
            let index = branch.get("index").and_then(Value::as_i64).unwrap_or(-1);
            let iteration = branch.get("iteration").and_then(Value::as_i64).unwrap_or(-1);
            log.lock().push(Call {
                branch: usize::try_from(index)?,
                unit: unit.clone(),
                iteration: usize::try_from(iteration)?,
            });
            Ok(Value::from(iteration))
        })
    }

    /// Unit options passing the branch view to a probe
    pub fn options(&self) -> UnitOptions {
        UnitOptions::new().kwarg("branch", Expr::branch())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().clone()
    }

    /// `(unit, iteration)` pairs seen by one branch, in call order
    pub fn for_branch(&self, branch: usize) -> Vec<(String, usize)> {
        self.inner
            .lock()
            .iter()
            .filter(|call| call.branch == branch)
            .map(|call| (call.unit.clone(), call.iteration))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Generator yielding the running sum of `0..n`, counting constructions
pub fn running_sum(n: i64, built: Arc<AtomicUsize>) -> Action {
    Action::generator(move |_| {
        built.fetch_add(1, Ordering::SeqCst);
        let sums = (0..n).scan(0_i64, |acc, x| {
            *acc += x;
            Some(Ok(Value::from(*acc)))
        });
        Ok(Box::new(sums) as UnitStream)
    })
}

/// Callable adding its named `a` and `b` integer arguments
pub fn sum() -> Action {
    Action::callable(|args: &Args| {
        let a = args.require("a")?.as_i64().unwrap_or_default();
        let b = args.require("b")?.as_i64().unwrap_or_default();
        Ok(Value::from(a + b))
    })
}

/// Callable failing with `message` when its `fail` argument is true
///
/// Returns its `value` argument (or null) otherwise.
pub fn fail_if(message: &'static str) -> Action {
    Action::callable(move |args: &Args| {
        if args.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!(message);
        }
        Ok(args.get("value").cloned().unwrap_or_default())
    })
}

/// Configs `{id: "b<i>", x: <value>}`
pub fn configs(values: &[i64]) -> Vec<Config> {
    values
        .iter()
        .enumerate()
        .map(|(i, x)| Config::new().with("id", format!("b{i}")).with("x", *x))
        .collect()
}

/// Sequential settings with an optional budget
pub fn sequential(n_iters: Option<usize>) -> ExecutorConfig {
    let settings = ExecutorConfig::new().with_target(Target::For);
    match n_iters {
        Some(n) => settings.with_n_iters(n),
        None => settings,
    }
}

/// Threaded settings with an optional budget
pub fn threaded(n_iters: Option<usize>) -> ExecutorConfig {
    let settings = ExecutorConfig::new().with_target(Target::Threads);
    match n_iters {
        Some(n) => settings.with_n_iters(n),
        None => settings,
    }
}

/// Pipeline over a fixed list of integer items
///
/// Variables: `pulled` (items pulled since reset), `applied` (items applied),
/// `last` (latest produced value) and `config` (config received).
/// Produced values are items multiplied by the config's `factor` (default 1).
#[derive(Debug, Clone, Default)]
pub struct ScriptedPipeline {
    items: Vec<Value>,
    position: usize,
    factor: i64,
    variables: IndexMap<String, Value>,
    fail_at: Option<usize>,
    resets: Arc<AtomicUsize>,
}

impl ScriptedPipeline {
    pub fn new(items: impl IntoIterator<Item = i64>) -> Self {
        Self {
            items: items.into_iter().map(Value::from).collect(),
            factor: 1,
            ..Self::default()
        }
    }

    /// Fail the pull of the item at `position`
    pub fn failing_at(mut self, position: usize) -> Self {
        self.fail_at = Some(position);
        self
    }

    /// Number of resets across this pipeline and its forks
    pub fn resets(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.resets)
    }

    fn scale(&self, item: &Value) -> anyhow::Result<Value> {
        let x = item
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("expected an integer item, got {}", item.kind()))?;
        Ok(Value::from(x * self.factor))
    }
}

impl PipelineAdapter for ScriptedPipeline {
    fn set_config(&mut self, config: &Value) {
        self.factor = config.get("factor").and_then(Value::as_i64).unwrap_or(1);
        self.variables.insert("config".to_string(), config.clone());
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.position = 0;
        self.variables.insert("pulled".to_string(), Value::from(0));
    }

    fn next_item(&mut self) -> Option<anyhow::Result<Value>> {
        let item = self.items.get(self.position)?.clone();
        if self.fail_at == Some(self.position) {
            return Some(Err(anyhow::anyhow!("scripted failure at item {}", self.position)));
        }
        self.position += 1;
        self.variables.insert("pulled".to_string(), Value::from(self.position));
        let scaled = self.scale(&item);
        if let Ok(value) = &scaled {
            self.variables.insert("last".to_string(), value.clone());
        }
        Some(scaled)
    }

    fn run(&mut self) -> anyhow::Result<Value> {
        let mut total = 0;
        for item in &self.items {
            total += self.scale(item)?.as_i64().unwrap_or_default();
        }
        self.variables.insert("last".to_string(), Value::from(total));
        Ok(Value::from(total))
    }

    fn apply_to(&mut self, item: Value) -> anyhow::Result<Value> {
        let value = self.scale(&item)?;
        let applied = self
            .variables
            .get("applied")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        self.variables.insert("applied".to_string(), Value::from(applied + 1));
        self.variables.insert("last".to_string(), value.clone());
        Ok(value)
    }

    fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }

    fn fork(&self) -> Box<dyn PipelineAdapter> {
        Box::new(Self {
            items: self.items.clone(),
            factor: 1,
            fail_at: self.fail_at,
            resets: Arc::clone(&self.resets),
            ..Self::default()
        })
    }
}

/// Instance with a counter, a countdown generator and a `loader` pipeline
pub struct Counter {
    start: i64,
    count: AtomicI64,
    loader: SharedPipeline,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            count: AtomicI64::new(start),
            loader: shared(ScriptedPipeline::new(1..=3)),
        }
    }

    /// Creator reading the `start` argument, counting constructions
    pub fn creator(name: &str, built: Arc<AtomicUsize>) -> InstanceCreator {
        InstanceCreator::new(name, move |args| {
            built.fetch_add(1, Ordering::SeqCst);
            let start = args.get("start").and_then(Value::as_i64).unwrap_or_default();
            Ok(Counter::new(start))
        })
    }

    pub fn value(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Instance for Counter {
    fn method(self: Arc<Self>, name: &str) -> Option<Action> {
        match name {
            "increment" => Some(Action::callable(move |args| {
                let by = args.get("by").and_then(Value::as_i64).unwrap_or(1);
                Ok(Value::from(self.count.fetch_add(by, Ordering::SeqCst) + by))
            })),
            "countdown" => Some(Action::iter(move |_| Ok((1..=self.start).rev().map(Value::from)))),
            _ => None,
        }
    }

    fn pipeline(&self, name: &str) -> Option<SharedPipeline> {
        (name == "loader").then(|| Arc::clone(&self.loader))
    }
}
