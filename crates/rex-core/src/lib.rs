//! REX Core - Research Experiment eXecution
//!
//! Runs one unit graph over many configurations:
//! - Defines experiments as ordered units with schedules and lazy arguments
//! - Clones the experiment into one branch per configuration
//! - Steps all branches through each unit behind a barrier
//! - Shares root units across branches and broadcasts their output
//! - Contains unit failures in the branch that raised them
//! - Reports saved results to a sink and events to a monitor
//!
//! # Example
//!
//! ```rust
//! use rex_core::prelude::*;
//! use rex_expr::{Expr, Value};
//!
//! let experiment = Experiment::new()
//!     .add_generator(
//!         "running_sum",
//!         |_| {
//!             let sums = (0..5_i64).scan(0, |acc, x| {
//!                 *acc += x;
//!                 Some(Ok(Value::from(*acc)))
//!             });
//!             Ok(Box::new(sums) as UnitStream)
//!         },
//!         UnitOptions::new(),
//!     )
//!     .save(Expr::output("running_sum"), "total", Schedule::last());
//!
//! let sink = std::sync::Arc::new(MemorySink::new());
//! let mut executor = Executor::new(experiment, ExecutorConfig::new().with_target(Target::For))
//!     .with_configs(vec![Config::new().with("id", "only")])
//!     .with_sink(sink.clone());
//! let report = executor.run().unwrap();
//!
//! assert_eq!(report.exhausted(), 1);
//! let total = sink.series("only", "total").unwrap();
//! assert_eq!(total.values().collect::<Vec<_>>(), vec![&Value::from(10)]);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod action;
pub mod branch;
pub mod config;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod instance;
pub mod monitor;
pub mod pipeline;
pub mod schedule;
pub mod settings;
pub mod sink;
pub mod telemetry;
mod unit;

// Re-exports for convenience
pub use action::{Action, Instance, Pull, SharedInstance, UnitKind, UnitStream};
pub use branch::{Branch, BranchId, BranchReport, BranchStatus, UnitError};
pub use config::{Config, ConfigAlias};
pub use error::{ExperimentError, Result, UnitFailure};
pub use executor::{Executor, RunReport};
pub use experiment::{Experiment, PipelineOptions, UnitOptions, UnitRegistry};
pub use instance::{InstanceCreator, InstanceOptions};
pub use monitor::{Monitor, MonitorEvent, RecordedEvent, RecordingMonitor};
pub use pipeline::{PipelineAdapter, PipelineMode, SharedPipeline};
pub use schedule::{Schedule, Trigger};
pub use settings::{AbortPolicy, ExecutorConfig, Target};
pub use sink::{BranchResults, MemorySink, Results, ResultsSink, Series};
pub use unit::{is_always_run, ALWAYS_RUN_PREFIX};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for defining and running experiments
    pub use crate::{
        Action, Config, Executor, ExecutorConfig, Experiment, InstanceCreator, InstanceOptions,
        MemorySink, PipelineOptions, RecordingMonitor, RunReport, Schedule, Target, UnitOptions,
        UnitStream,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
