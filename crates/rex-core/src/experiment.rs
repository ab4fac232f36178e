//! Experiment definition
//!
//! An [`Experiment`] is the template every branch is cloned from: an ordered
//! list of units plus the instance creators they depend on. Unit order is
//! definition order and is the execution order in every iteration.
//!
//! # Example
//!
//! ```rust
//! use rex_core::{Experiment, Schedule, UnitOptions};
//! use rex_expr::{Expr, Value};
//!
//! let experiment = Experiment::new()
//!     .add_callable(
//!         "square",
//!         |args| {
//!             let x = args.require("x")?.as_i64().unwrap_or_default();
//!             Ok(Value::from(x * x))
//!         },
//!         UnitOptions::new().kwarg("x", Expr::config("x")).save_to("squares"),
//!     )
//!     .dump(None, Schedule::last());
//!
//! assert_eq!(experiment.unit_names(), vec!["square", "__save_results_0", "__dump_results_0"]);
//! ```

use crate::action::{Action, UnitStream};
use crate::error::{ExperimentError, Result};
use crate::instance::{InstanceCreator, InstanceOptions};
use crate::pipeline::{shared, PipelineAdapter, PipelineMode, BATCH_ARG};
use crate::schedule::Schedule;
use crate::unit::{Builtin, PipelineSource, Unit, UnitSource};
use indexmap::IndexMap;
use rex_expr::{ArgTree, Args, Expr, Value};
use std::fmt;

const SAVE_PREFIX: &str = "__save_results";
const DUMP_PREFIX: &str = "__dump_results";

/// Options shared by every kind of unit
#[derive(Debug, Clone, Default)]
pub struct UnitOptions {
    /// Run once on branch 0 and broadcast the output
    pub root: bool,
    /// When the unit fires
    pub when: Schedule,
    /// Argument expressions
    pub args: ArgTree,
    /// Save every output under this result name
    pub save_to: Option<String>,
    /// Dump the saved result on this schedule
    pub dump: Option<Schedule>,
}

impl UnitOptions {
    /// Default options: private unit firing every iteration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the unit across branches
    #[inline]
    #[must_use]
    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Set the schedule
    #[inline]
    #[must_use]
    pub fn when(mut self, when: impl Into<Schedule>) -> Self {
        self.when = when.into();
        self
    }

    /// Add a positional argument
    #[inline]
    #[must_use]
    pub fn arg(mut self, expr: impl Into<Expr>) -> Self {
        self.args = self.args.positional(expr);
        self
    }

    /// Add a named argument
    #[inline]
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.args = self.args.named(name, expr);
        self
    }

    /// Save the output under `dst`
    #[inline]
    #[must_use]
    pub fn save_to(mut self, dst: impl Into<String>) -> Self {
        self.save_to = Some(dst.into());
        self
    }

    /// Dump the saved output on `when`
    #[inline]
    #[must_use]
    pub fn dump(mut self, when: impl Into<Schedule>) -> Self {
        self.dump = Some(when.into());
        self
    }
}

/// Options of pipeline units
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Options of the pipeline unit itself
    pub unit: UnitOptions,
    /// Run to completion on every fire instead of pulling items
    pub run: bool,
    /// Pipeline variables to save every iteration
    pub variables: Vec<String>,
    /// Dump the saved variables on this schedule
    pub dump: Option<Schedule>,
}

impl PipelineOptions {
    /// Default options: generator mode, nothing saved
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With unit options
    #[inline]
    #[must_use]
    pub fn with_unit(mut self, unit: UnitOptions) -> Self {
        self.unit = unit;
        self
    }

    /// Run to completion on every fire
    #[inline]
    #[must_use]
    pub fn run(mut self) -> Self {
        self.run = true;
        self
    }

    /// Save a pipeline variable
    #[inline]
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.push(name.into());
        self
    }

    /// Dump saved variables on `when`
    #[inline]
    #[must_use]
    pub fn dump(mut self, when: impl Into<Schedule>) -> Self {
        self.dump = Some(when.into());
        self
    }

    fn mode(&self) -> PipelineMode {
        if self.run {
            PipelineMode::Run
        } else {
            PipelineMode::Generator
        }
    }
}

/// Named actions available to [`Experiment::add_registered`]
#[derive(Default, Clone)]
pub struct UnitRegistry {
    actions: IndexMap<String, Action>,
}

impl UnitRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under a name
    pub fn register(&mut self, name: impl Into<String>, action: Action) {
        self.actions.insert(name.into(), action);
    }

    /// Builder-style register
    #[inline]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, action: Action) -> Self {
        self.register(name, action);
        self
    }

    /// Look up an action
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// Check if an action exists
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names in registration order
    #[inline]
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Get number of registered actions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Template of units and instance creators
#[derive(Default)]
pub struct Experiment {
    units: IndexMap<String, Unit>,
    creators: IndexMap<String, InstanceCreator>,
    registry: UnitRegistry,
}

impl Experiment {
    /// Empty experiment
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a registry for [`Experiment::add_registered`]
    #[inline]
    #[must_use]
    pub fn with_registry(mut self, registry: UnitRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add a unit running `action`
    #[must_use]
    pub fn add_action(self, name: impl Into<String>, action: Action, options: UnitOptions) -> Self {
        self.add_unit(name.into(), UnitSource::Action(action), options)
    }

    /// Add a callable unit
    #[must_use]
    pub fn add_callable<F>(self, name: impl Into<String>, func: F, options: UnitOptions) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.add_action(name, Action::callable(func), options)
    }

    /// Add a generator unit; the stream is built on the first fire
    #[must_use]
    pub fn add_generator<F>(self, name: impl Into<String>, func: F, options: UnitOptions) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<UnitStream> + Send + Sync + 'static,
    {
        self.add_action(name, Action::generator(func), options)
    }

    /// Add a unit calling `method` of `instance`, written `"instance.method"`
    ///
    /// The method is looked up on the first call in each branch.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::UnknownAttribute`] when `name` has no dot.
    pub fn add_method(self, name: &str, options: UnitOptions) -> Result<Self> {
        let (instance, method) = split_attribute(name)?;
        let source = UnitSource::Method {
            instance: instance.to_string(),
            method: method.to_string(),
        };
        Ok(self.add_unit(name.to_string(), source, options))
    }

    /// Add a unit running an action from the registry
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::UnknownUnit`] when no action is
    /// registered under `name`.
    pub fn add_registered(self, name: &str, options: UnitOptions) -> Result<Self> {
        let action = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ExperimentError::UnknownUnit(name.to_string()))?;
        Ok(self.add_action(name, action, options))
    }

    /// Add an instance and its `init_<name>` unit, firing at iteration 0
    #[must_use]
    pub fn add_instance(mut self, creator: InstanceCreator, options: InstanceOptions) -> Self {
        let name = creator.name().to_string();
        let unit = Unit::new(
            creator.init_unit(),
            UnitSource::Builtin(Builtin::CreateInstance { name: name.clone() }),
            options.root,
            Schedule::at(0),
            options.args,
        );
        self.creators.insert(name, creator);
        self.insert(unit);
        self
    }

    /// Add a pipeline unit pulling items, or running the pipeline when
    /// `options.run` is set
    #[must_use]
    pub fn add_pipeline(
        self,
        name: impl Into<String>,
        pipeline: impl PipelineAdapter + 'static,
        options: PipelineOptions,
    ) -> Self {
        let source = PipelineSource::Direct(shared(pipeline));
        self.add_pipeline_unit(name.into(), source, options)
    }

    /// Add a pipeline unit using the pipeline attribute `"instance.attr"`
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::UnknownAttribute`] when `name` has no dot.
    pub fn add_instance_pipeline(self, name: &str, options: PipelineOptions) -> Result<Self> {
        let (instance, attr) = split_attribute(name)?;
        let source = PipelineSource::Attribute {
            instance: instance.to_string(),
            attr: attr.to_string(),
        };
        Ok(self.add_pipeline_unit(name.to_string(), source, options))
    }

    /// Add a root pipeline feeding a branch pipeline
    ///
    /// Creates `<name>_root` pulling items and `<name>` applying `branch`
    /// to each of them.
    #[must_use]
    pub fn add_branch_pipeline(
        self,
        name: impl Into<String>,
        root: impl PipelineAdapter + 'static,
        branch: impl PipelineAdapter + 'static,
        options: PipelineOptions,
    ) -> Self {
        let name = name.into();
        let root_name = format!("{name}_root");
        let mut unit_options = options.unit.clone();
        unit_options.save_to = None;
        unit_options.dump = None;
        let root_unit = Unit::new(
            root_name.clone(),
            UnitSource::Pipeline {
                source: PipelineSource::Direct(shared(root)),
                mode: PipelineMode::Generator,
            },
            unit_options.root,
            unit_options.when.clone(),
            unit_options.args.clone(),
        );
        let mut experiment = self;
        experiment.insert(root_unit);

        let mut branch_options = options;
        branch_options.unit = branch_options
            .unit
            .kwarg(BATCH_ARG, Expr::output(root_name));
        branch_options.unit.root = false;
        let source = UnitSource::Pipeline {
            source: PipelineSource::Direct(shared(branch)),
            mode: PipelineMode::ExecuteFor,
        };
        experiment.add_pipeline_with(name, source, branch_options)
    }

    /// Save `src` under `dst` on `when`
    #[must_use]
    pub fn save(self, src: Expr, dst: impl Into<String>, when: impl Into<Schedule>) -> Self {
        self.save_many(vec![src], vec![dst.into()], when)
    }

    /// Save each source under the matching destination
    ///
    /// Mismatched lengths fail the unit when it fires.
    #[must_use]
    pub fn save_many(mut self, srcs: Vec<Expr>, dsts: Vec<String>, when: impl Into<Schedule>) -> Self {
        let name = self.postfixed(SAVE_PREFIX);
        let args = srcs.into_iter().fold(ArgTree::new(), ArgTree::positional);
        let unit = Unit::new(
            name,
            UnitSource::Builtin(Builtin::Save { dsts }),
            false,
            when.into(),
            args,
        );
        self.insert(unit);
        self
    }

    /// Dump saved results to the sink on `when` and drop them from the
    /// branch; every result when `variables` is `None`
    #[must_use]
    pub fn dump(mut self, variables: Option<Vec<String>>, when: impl Into<Schedule>) -> Self {
        let name = self.postfixed(DUMP_PREFIX);
        let unit = Unit::new(
            name,
            UnitSource::Builtin(Builtin::Dump { variables }),
            false,
            when.into(),
            ArgTree::new(),
        );
        self.insert(unit);
        self
    }

    /// Unit names in execution order
    #[must_use]
    pub fn unit_names(&self) -> Vec<&str> {
        self.units.keys().map(String::as_str).collect()
    }

    /// Check if a unit exists
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Check if a unit is shared across branches
    #[inline]
    #[must_use]
    pub fn is_root(&self, name: &str) -> bool {
        self.units.get(name).is_some_and(Unit::is_root)
    }

    /// Schedule of a unit
    #[inline]
    #[must_use]
    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        self.units.get(name).map(Unit::schedule)
    }

    /// Names of declared instances
    #[must_use]
    pub fn instance_names(&self) -> Vec<&str> {
        self.creators.keys().map(String::as_str).collect()
    }

    /// Get number of units
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check if there are no units
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub(crate) fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub(crate) fn creators(&self) -> &IndexMap<String, InstanceCreator> {
        &self.creators
    }

    fn add_unit(mut self, name: String, source: UnitSource, options: UnitOptions) -> Self {
        let UnitOptions {
            root,
            when,
            args,
            save_to,
            dump,
        } = options;
        self.insert(Unit::new(name.clone(), source, root, when.clone(), args));
        if let Some(dst) = save_to {
            self = self.save(Expr::output(name), dst.clone(), when);
            if let Some(dump_when) = dump {
                self = self.dump(Some(vec![dst]), dump_when);
            }
        }
        self
    }

    fn add_pipeline_unit(self, name: String, source: PipelineSource, options: PipelineOptions) -> Self {
        let source = UnitSource::Pipeline {
            source,
            mode: options.mode(),
        };
        self.add_pipeline_with(name, source, options)
    }

    fn add_pipeline_with(self, name: String, source: UnitSource, options: PipelineOptions) -> Self {
        let PipelineOptions {
            unit,
            variables,
            dump,
            ..
        } = options;
        let mut experiment = self.add_unit(name.clone(), source, unit);
        for var in &variables {
            experiment = experiment.save(Expr::variable(name.clone(), var.clone()), var.clone(), Schedule::always());
        }
        if let Some(when) = dump {
            if !variables.is_empty() {
                experiment = experiment.dump(Some(variables), when);
            }
        }
        experiment
    }

    fn insert(&mut self, unit: Unit) {
        self.units.insert(unit.name().to_string(), unit);
    }

    /// `<base>_<count of units starting with base>`
    fn postfixed(&self, base: &str) -> String {
        let count = self.units.keys().filter(|name| name.starts_with(base)).count();
        format!("{base}_{count}")
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("units", &self.unit_names())
            .field("instances", &self.instance_names())
            .finish_non_exhaustive()
    }
}

fn split_attribute(name: &str) -> Result<(&str, &str)> {
    name.split_once('.')
        .filter(|(instance, attr)| !instance.is_empty() && !attr.is_empty())
        .ok_or_else(|| ExperimentError::UnknownAttribute {
            instance: name.to_string(),
            attr: String::new(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn noop() -> impl Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static {
        |_: &Args| Ok(Value::Null)
    }

    #[test]
    fn units_keep_definition_order() {
        let experiment = Experiment::new()
            .add_callable("b", noop(), UnitOptions::new())
            .add_callable("a", noop(), UnitOptions::new())
            .add_callable("c", noop(), UnitOptions::new());
        assert_eq!(experiment.unit_names(), vec!["b", "a", "c"]);
    }

    #[test]
    fn save_and_dump_names_are_postfixed() {
        let experiment = Experiment::new()
            .save(Expr::lit(1), "one", Schedule::always())
            .save(Expr::lit(2), "two", Schedule::always())
            .dump(None, Schedule::last());
        assert_eq!(
            experiment.unit_names(),
            vec!["__save_results_0", "__save_results_1", "__dump_results_0"]
        );
    }

    #[test]
    fn save_to_adds_save_with_same_schedule() {
        let experiment = Experiment::new().add_callable(
            "loss",
            noop(),
            UnitOptions::new().when(Schedule::every(3)).save_to("loss").dump(Schedule::last()),
        );
        assert_eq!(
            experiment.unit_names(),
            vec!["loss", "__save_results_0", "__dump_results_0"]
        );
        assert_eq!(experiment.schedule("__save_results_0"), Some(&Schedule::every(3)));
        assert_eq!(experiment.schedule("__dump_results_0"), Some(&Schedule::last()));
    }

    #[test]
    fn registered_units_are_looked_up() {
        let registry = UnitRegistry::new().with("train", Action::callable(|_| Ok(Value::from(1))));
        let experiment = Experiment::new()
            .with_registry(registry)
            .add_registered("train", UnitOptions::new())
            .unwrap();
        assert!(experiment.contains("train"));

        let err = Experiment::new()
            .add_registered("missing", UnitOptions::new())
            .unwrap_err();
        assert!(matches!(err, ExperimentError::UnknownUnit(ref n) if n == "missing"));
    }

    #[test]
    fn method_names_need_instance_and_attribute() {
        assert!(Experiment::new().add_method("model.train", UnitOptions::new()).is_ok());
        assert!(Experiment::new().add_method("train", UnitOptions::new()).is_err());
        assert!(Experiment::new().add_method(".train", UnitOptions::new()).is_err());
    }

    #[test]
    fn instance_adds_init_unit_at_first_iteration() {
        struct Nothing;
        impl crate::action::Instance for Nothing {
            fn method(self: Arc<Self>, _name: &str) -> Option<Action> {
                None
            }
        }
        let experiment = Experiment::new().add_instance(
            InstanceCreator::new("model", |_| Ok(Nothing)),
            InstanceOptions::new().root(),
        );
        assert_eq!(experiment.unit_names(), vec!["init_model"]);
        assert!(experiment.is_root("init_model"));
        assert_eq!(experiment.schedule("init_model"), Some(&Schedule::at(0)));
        assert_eq!(experiment.instance_names(), vec!["model"]);
    }
}
