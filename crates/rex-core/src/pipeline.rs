//! Adapter contract for external data pipelines
//!
//! The engine never looks inside a pipeline. It drives it in one of three
//! modes:
//! - `generator`: pull items one by one
//! - `func`: run the whole pipeline and return its result
//! - `execute_for`: apply the pipeline to a single item

use crate::error::ExperimentError;
use parking_lot::Mutex;
use rex_expr::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Pipeline as seen by the engine
pub trait PipelineAdapter: Send {
    /// Receive the branch config merged with the unit's named arguments;
    /// called once, before the first use
    fn set_config(&mut self, config: &Value);

    /// Reset iteration state and variables
    fn reset(&mut self);

    /// Next item, `None` at the natural end
    fn next_item(&mut self) -> Option<anyhow::Result<Value>>;

    /// Run to completion
    ///
    /// # Errors
    ///
    /// Returns the pipeline's own error.
    fn run(&mut self) -> anyhow::Result<Value>;

    /// Apply the pipeline to one item
    ///
    /// # Errors
    ///
    /// Returns the pipeline's own error.
    fn apply_to(&mut self, item: Value) -> anyhow::Result<Value>;

    /// Current value of a pipeline variable
    fn variable(&self, name: &str) -> Option<Value>;

    /// Independent copy for another branch
    fn fork(&self) -> Box<dyn PipelineAdapter>;
}

/// Pipeline shared between a unit and the expressions that read its
/// variables
pub type SharedPipeline = Arc<Mutex<Box<dyn PipelineAdapter>>>;

/// Wrap an adapter for use in units
#[must_use]
pub fn shared(pipeline: impl PipelineAdapter + 'static) -> SharedPipeline {
    Arc::new(Mutex::new(Box::new(pipeline)))
}

/// How a pipeline unit drives its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineMode {
    /// Pull one item per fire
    #[default]
    Generator,
    /// Run to completion on every fire
    Run,
    /// Apply to the `batch` argument on every fire
    ExecuteFor,
}

impl PipelineMode {
    /// Mode name as used in definitions
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Run => "func",
            Self::ExecuteFor => "execute_for",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generator" => Ok(Self::Generator),
            "func" | "run" => Ok(Self::Run),
            "execute_for" => Ok(Self::ExecuteFor),
            other => Err(ExperimentError::InvalidPipelineMode(other.to_string())),
        }
    }
}

/// Name of the argument `execute_for` pipelines are applied to
pub const BATCH_ARG: &str = "batch";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_from_definition_names() {
        assert_eq!("generator".parse::<PipelineMode>().unwrap(), PipelineMode::Generator);
        assert_eq!("func".parse::<PipelineMode>().unwrap(), PipelineMode::Run);
        assert_eq!("execute_for".parse::<PipelineMode>().unwrap(), PipelineMode::ExecuteFor);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = "stream".parse::<PipelineMode>().unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidPipelineMode(ref m) if m == "stream"));
    }
}
