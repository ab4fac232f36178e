//! Executor settings
//!
//! [`ExecutorConfig`] can be built in code with `with_*` methods or loaded
//! from TOML and YAML:
//!
//! ```toml
//! name = "lr-sweep"
//! target = "threads"
//! workers = 4
//! n_iters = 100
//! abort = "finish_iteration"
//! seed = 42
//! ```

use crate::error::{ExperimentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How branch calls of one unit are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Worker thread pool
    #[default]
    Threads,
    /// Sequential loop in the calling thread
    For,
}

/// When a failed branch stops running its regular units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Right after the failing unit
    #[default]
    Eager,
    /// After the last unit of the failing iteration
    FinishIteration,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Name used in logs
    pub name: String,
    /// Dispatch mode
    pub target: Target,
    /// Worker threads; defaults to one per branch
    pub workers: Option<usize>,
    /// Iteration budget; `None` runs until every branch stops
    pub n_iters: Option<usize>,
    /// Failure abort policy
    pub abort: AbortPolicy,
    /// Abort the run on the first non-exhaustion unit error
    pub debug: bool,
    /// Root of the per-branch seeds; random when unset
    pub seed: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "executor".to_string(),
            target: Target::Threads,
            workers: None,
            n_iters: None,
            abort: AbortPolicy::Eager,
            debug: false,
            seed: None,
        }
    }
}

impl ExecutorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With name
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// With dispatch target
    #[inline]
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// With iteration budget
    #[inline]
    #[must_use]
    pub fn with_n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = Some(n_iters);
        self
    }

    /// With abort policy
    #[inline]
    #[must_use]
    pub fn with_abort(mut self, abort: AbortPolicy) -> Self {
        self.abort = abort;
        self
    }

    /// With debug mode
    #[inline]
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// With a fixed seed for reproducible branch generators
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parse from TOML
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Config`] on malformed input.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ExperimentError::Config(e.to_string()))
    }

    /// Parse from YAML
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Config`] on malformed input.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| ExperimentError::Config(e.to_string()))
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Config`] when the file cannot be read, has
    /// an unknown extension, or is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExperimentError::Config(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml" | "yml") => Self::from_yaml_str(&content),
            _ => Err(ExperimentError::Config(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }

    /// Validate values that serde cannot check
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Config`] for a zero worker count.
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(ExperimentError::Config("workers must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_eager_threaded_run() {
        let config = ExecutorConfig::new();
        assert_eq!(config.target, Target::Threads);
        assert_eq!(config.abort, AbortPolicy::Eager);
        assert_eq!(config.n_iters, None);
        assert!(!config.debug);
    }

    #[test]
    fn builder_sets_fields() {
        let config = ExecutorConfig::new()
            .with_name("sweep")
            .with_target(Target::For)
            .with_n_iters(5)
            .with_abort(AbortPolicy::FinishIteration)
            .with_debug(true)
            .with_seed(42);
        assert_eq!(config.name, "sweep");
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.target, Target::For);
        assert_eq!(config.n_iters, Some(5));
        assert_eq!(config.abort, AbortPolicy::FinishIteration);
        assert!(config.debug);
    }

    #[test]
    fn toml_and_yaml_agree() {
        let from_toml = ExecutorConfig::from_toml_str(
            "name = \"sweep\"\ntarget = \"for\"\nn_iters = 10\nabort = \"finish_iteration\"\n",
        )
        .unwrap();
        let from_yaml = ExecutorConfig::from_yaml_str(
            "name: sweep\ntarget: for\nn_iters: 10\nabort: finish_iteration\n",
        )
        .unwrap();
        assert_eq!(from_toml, from_yaml);
        assert_eq!(from_toml.workers, None);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = ExperimentError::Config(String::new());
        assert!(err.is_configuration_bug());
        assert!(ExecutorConfig::from_toml_str("target = \"processes\"").is_err());
    }

    #[test]
    fn zero_workers_fail_validation() {
        assert!(ExecutorConfig::new().with_workers(0).validate().is_err());
        assert!(ExecutorConfig::new().with_workers(2).validate().is_ok());
    }
}
