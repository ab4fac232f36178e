//! Error types for the experiment engine
//!
//! Two layers of failure exist:
//! - [`ExperimentError`] is returned by definition and run APIs
//! - [`UnitFailure`] is what a single unit call produced inside a branch;
//!   it is contained in that branch unless the run is in debug mode or the
//!   unit is a root unit

use rex_expr::ResolveError;

/// Main experiment error type
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// Argument expression could not be resolved
    #[error("unresolved reference: {0}")]
    Unresolved(#[from] ResolveError),

    /// Unit failed while the run was in debug mode
    #[error("unit '{unit}' failed in branch {branch}:\n{trace}")]
    UnitExecution {
        /// Unit name
        unit: String,
        /// Branch index
        branch: usize,
        /// Formatted error chain
        trace: String,
    },

    /// Shared root unit failed, which ends the run for every branch
    #[error("root unit '{unit}' failed:\n{trace}")]
    RootUnit {
        /// Unit name
        unit: String,
        /// Formatted error chain
        trace: String,
    },

    /// No unit or registered action with this name
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    /// No instance with this name in the branch
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// Instance has no such method or pipeline attribute
    #[error("instance '{instance}' has no attribute '{attr}'")]
    UnknownAttribute {
        /// Instance name
        instance: String,
        /// Attribute name
        attr: String,
    },

    /// `configs` and `branch_configs` differ in length
    #[error("configs and branch configs must be of the same length ({configs} != {branch_configs})")]
    ConfigLengthMismatch {
        /// Number of configs
        configs: usize,
        /// Number of branch configs
        branch_configs: usize,
    },

    /// Schedule literal could not be parsed
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Unknown pipeline mode
    #[error("unknown pipeline mode: {0}")]
    InvalidPipelineMode(String),

    /// Worker pool could not be built
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl ExperimentError {
    /// Check if the error ends a run rather than a single branch
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RootUnit { .. } | Self::UnitExecution { .. } | Self::ThreadPool(_)
        )
    }

    /// Check if the error points at a mistake in the experiment definition
    #[inline]
    #[must_use]
    pub fn is_configuration_bug(&self) -> bool {
        matches!(
            self,
            Self::Unresolved(_)
                | Self::UnknownUnit(_)
                | Self::UnknownInstance(_)
                | Self::UnknownAttribute { .. }
                | Self::ConfigLengthMismatch { .. }
                | Self::InvalidSchedule(_)
                | Self::InvalidPipelineMode(_)
                | Self::Config(_)
        )
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Outcome of a unit call that did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFailure {
    /// Generator reached its natural end
    Exhausted,
    /// User code or the engine reported an error
    Error {
        /// Formatted error chain
        trace: String,
        /// True when caused by a definition mistake (unresolved reference,
        /// unknown instance) rather than user code
        configuration_bug: bool,
    },
}

impl UnitFailure {
    /// Failure from a user error
    #[must_use]
    pub fn from_user(err: &anyhow::Error) -> Self {
        Self::Error {
            trace: format!("{err:?}"),
            configuration_bug: false,
        }
    }

    /// Failure from a definition mistake
    #[must_use]
    pub fn from_definition(err: &ExperimentError) -> Self {
        Self::Error {
            trace: err.to_string(),
            configuration_bug: true,
        }
    }

    /// Failure from a panic payload caught at the unit boundary
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::Error {
            trace: format!("panicked: {message}"),
            configuration_bug: false,
        }
    }

    /// Check for natural exhaustion
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

impl From<ResolveError> for UnitFailure {
    fn from(err: ResolveError) -> Self {
        Self::from_definition(&ExperimentError::Unresolved(err))
    }
}

impl From<ExperimentError> for UnitFailure {
    fn from(err: ExperimentError) -> Self {
        Self::from_definition(&err)
    }
}
