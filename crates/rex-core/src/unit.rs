//! Executable units
//!
//! A [`Unit`] is the per-branch state of one named step of an experiment:
//! its source, schedule and argument tree, plus the state built while it
//! runs (the bound body, a live generator stream, pipeline setup flags).
//!
//! Branches hold units through [`UnitHandle`]s. A private unit gets a fresh
//! copy per branch; a root unit is one handle shared by every branch.

use crate::action::{Action, GeneratorFn, Pull, SharedInstance, UnitStream};
use crate::config::Config;
use crate::error::{ExperimentError, UnitFailure};
use crate::pipeline::{PipelineMode, SharedPipeline, BATCH_ARG};
use crate::schedule::Schedule;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rex_expr::{ArgTree, Args};
use std::sync::Arc;

/// Shared, lockable unit
pub(crate) type UnitHandle = Arc<Mutex<Unit>>;

/// Prefix of units that run even on dead branches
pub const ALWAYS_RUN_PREFIX: &str = "__";

/// Check whether a unit name marks an always-run unit
#[inline]
#[must_use]
pub fn is_always_run(name: &str) -> bool {
    name.starts_with(ALWAYS_RUN_PREFIX)
}

/// Where a pipeline unit gets its pipeline from
#[derive(Clone)]
pub(crate) enum PipelineSource {
    /// Pipeline given at definition time, forked per branch
    Direct(SharedPipeline),
    /// Pipeline attribute of a branch instance
    Attribute { instance: String, attr: String },
}

/// Engine-provided unit bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Builtin {
    /// Append positional args to the named result series
    Save { dsts: Vec<String> },
    /// Flush result series to the sink; all series when `None`
    Dump { variables: Option<Vec<String>> },
    /// Build a named instance from the resolved args
    CreateInstance { name: String },
}

/// Unit source as defined in the experiment
#[derive(Clone)]
pub(crate) enum UnitSource {
    /// Callable or generator given directly
    Action(Action),
    /// Method of a branch instance, looked up on first call
    Method { instance: String, method: String },
    /// External pipeline driven in one mode
    Pipeline {
        source: PipelineSource,
        mode: PipelineMode,
    },
    /// Engine-provided body
    Builtin(Builtin),
}

/// Body of a unit after instance references are resolved
#[derive(Clone)]
pub(crate) enum Body {
    Action(Action),
    Pipeline {
        pipeline: SharedPipeline,
        mode: PipelineMode,
    },
    Builtin(Builtin),
}

/// What the branch must do for this call
pub(crate) enum Step {
    /// Schedule did not fire
    Skip,
    /// Resolve `args` and run `body`
    Run { body: Body, args: ArgTree },
}

/// One named step of an experiment
pub(crate) struct Unit {
    name: String,
    source: UnitSource,
    root: bool,
    schedule: Schedule,
    args: ArgTree,
    body: Option<Body>,
    stream: Option<UnitStream>,
    configured: bool,
    started: bool,
}

impl Unit {
    pub(crate) fn new(
        name: impl Into<String>,
        source: UnitSource,
        root: bool,
        schedule: Schedule,
        args: ArgTree,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            root,
            schedule,
            args,
            body: None,
            stream: None,
            configured: false,
            started: false,
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    #[inline]
    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Name of the instance this unit creates, if it is an instance init unit
    pub(crate) fn created_instance(&self) -> Option<&str> {
        match &self.source {
            UnitSource::Builtin(Builtin::CreateInstance { name }) => Some(name),
            _ => None,
        }
    }

    /// Copy for a new branch: definition only, never live state
    ///
    /// Directly given pipelines are forked so branches do not share
    /// iteration state.
    pub(crate) fn fresh(&self) -> Self {
        let source = match &self.source {
            UnitSource::Pipeline {
                source: PipelineSource::Direct(pipeline),
                mode,
            } => UnitSource::Pipeline {
                source: PipelineSource::Direct(Arc::new(Mutex::new(pipeline.lock().fork()))),
                mode: *mode,
            },
            other => other.clone(),
        };
        Self::new(
            self.name.clone(),
            source,
            self.root,
            self.schedule.clone(),
            self.args.clone(),
        )
    }

    /// Wrap into a handle
    #[inline]
    pub(crate) fn into_handle(self) -> UnitHandle {
        Arc::new(Mutex::new(self))
    }

    /// Bind instance references, then check the schedule
    ///
    /// Binding happens once, on the first call in the branch.
    pub(crate) fn prepare(
        &mut self,
        iteration: usize,
        n_iters: Option<usize>,
        last: bool,
        instances: &IndexMap<String, SharedInstance>,
    ) -> Result<Step, UnitFailure> {
        let body = match &self.body {
            Some(body) => body.clone(),
            None => {
                let body = self.bind(instances)?;
                self.body = Some(body.clone());
                body
            }
        };
        if !self.schedule.fires(iteration, n_iters, last) {
            return Ok(Step::Skip);
        }
        Ok(Step::Run {
            body,
            args: self.args.clone(),
        })
    }

    fn bind(&self, instances: &IndexMap<String, SharedInstance>) -> Result<Body, ExperimentError> {
        let lookup = |name: &str| {
            instances
                .get(name)
                .cloned()
                .ok_or_else(|| ExperimentError::UnknownInstance(name.to_string()))
        };
        let unknown = |instance: &str, attr: &str| ExperimentError::UnknownAttribute {
            instance: instance.to_string(),
            attr: attr.to_string(),
        };
        Ok(match &self.source {
            UnitSource::Action(action) => Body::Action(action.clone()),
            UnitSource::Builtin(builtin) => Body::Builtin(builtin.clone()),
            UnitSource::Method { instance, method } => {
                let action = lookup(instance)?
                    .method(method)
                    .ok_or_else(|| unknown(instance, method))?;
                Body::Action(action)
            }
            UnitSource::Pipeline { source, mode } => {
                let pipeline = match source {
                    PipelineSource::Direct(pipeline) => Arc::clone(pipeline),
                    PipelineSource::Attribute { instance, attr } => lookup(instance)?
                        .pipeline(attr)
                        .ok_or_else(|| unknown(instance, attr))?,
                };
                Body::Pipeline {
                    pipeline,
                    mode: *mode,
                }
            }
        })
    }

    /// Pull the next element, building the stream on the first pull
    pub(crate) fn pull(&mut self, build: &GeneratorFn, args: &Args) -> Result<Pull, UnitFailure> {
        if self.stream.is_none() {
            let stream = build(args).map_err(|err| UnitFailure::from_user(&err))?;
            self.stream = Some(stream);
        }
        match self.stream.as_mut().and_then(Iterator::next) {
            Some(Ok(value)) => Ok(Pull::Item(value)),
            Some(Err(err)) => Err(UnitFailure::from_user(&err)),
            None => Ok(Pull::End),
        }
    }

    /// Drive a pipeline once in its mode
    ///
    /// The pipeline receives `config` merged with the named arguments
    /// (except `batch`) before its first use.
    pub(crate) fn drive(
        &mut self,
        pipeline: &SharedPipeline,
        mode: PipelineMode,
        args: &Args,
        config: &Config,
    ) -> Result<Pull, UnitFailure> {
        let mut pipeline = pipeline.lock();
        if !self.configured {
            let overrides: Config = args
                .named
                .iter()
                .filter(|(key, _)| key.as_str() != BATCH_ARG)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            pipeline.set_config(&config.merge(&overrides).to_value());
            self.configured = true;
        }
        match mode {
            PipelineMode::Generator => {
                if !self.started {
                    pipeline.reset();
                    self.started = true;
                }
                match pipeline.next_item() {
                    Some(Ok(value)) => Ok(Pull::Item(value)),
                    Some(Err(err)) => Err(UnitFailure::from_user(&err)),
                    None => Ok(Pull::End),
                }
            }
            PipelineMode::Run => pipeline
                .run()
                .map(Pull::Item)
                .map_err(|err| UnitFailure::from_user(&err)),
            PipelineMode::ExecuteFor => {
                let batch = args
                    .require(BATCH_ARG)
                    .map_err(UnitFailure::from)?
                    .clone();
                pipeline
                    .apply_to(batch)
                    .map(Pull::Item)
                    .map_err(|err| UnitFailure::from_user(&err))
            }
        }
    }

    /// Bound pipeline, used to read pipeline variables
    pub(crate) fn pipeline(&self) -> Option<SharedPipeline> {
        match &self.body {
            Some(Body::Pipeline { pipeline, .. }) => Some(Arc::clone(pipeline)),
            _ => None,
        }
    }
}
