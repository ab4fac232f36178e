//! Expression resolution against branch state

use crate::expr::Expr;
use crate::value::Value;

/// Read-only view of a branch that expressions are resolved against
///
/// Implementations must not mutate branch state while answering.
pub trait ResolveContext {
    /// Most recent output of a unit, `None` when it never produced one
    fn output(&self, name: &str) -> Option<Value>;

    /// Config value for a key, `None` when absent
    fn config_value(&self, key: &str) -> Option<Value>;

    /// The whole branch config as a mapping
    fn config(&self) -> Value;

    /// Description of the branch itself
    fn branch(&self) -> Value;

    /// Variable exposed by a pipeline unit
    fn variable(&self, unit: &str, name: &str) -> Option<Value>;
}

/// Resolution errors
///
/// All of them point at a definition or ordering mistake in the experiment,
/// so they are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Referenced unit has no output yet
    #[error("unit '{0}' has no output to reference")]
    UnknownOutput(String),

    /// Referenced config key is absent
    #[error("config key '{0}' not found")]
    UnknownConfigKey(String),

    /// Pipeline variable is absent
    #[error("variable '{name}' not found in unit '{unit}'")]
    UnknownVariable {
        /// Pipeline unit
        unit: String,
        /// Variable name
        name: String,
    },

    /// Required argument was not supplied
    #[error("missing argument '{0}'")]
    MissingArgument(String),

    /// Explicit call returned an error
    #[error("call '{name}' failed: {message}")]
    CallFailed {
        /// Call name
        name: String,
        /// Rendered error
        message: String,
    },
}

/// Resolve an expression tree to a value
///
/// Literals are returned unchanged, references are looked up in `ctx`,
/// lists and maps resolve element-wise keeping their order.
///
/// # Errors
///
/// Returns [`ResolveError`] on the first reference that cannot be satisfied
/// or the first explicit call that fails.
pub fn resolve(expr: &Expr, ctx: &dyn ResolveContext) -> Result<Value, ResolveError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Output(name) => ctx
            .output(name)
            .ok_or_else(|| ResolveError::UnknownOutput(name.clone())),
        Expr::Config(Some(key)) => ctx
            .config_value(key)
            .ok_or_else(|| ResolveError::UnknownConfigKey(key.clone())),
        Expr::Config(None) => Ok(ctx.config()),
        Expr::Branch => Ok(ctx.branch()),
        Expr::Variable { unit, name } => {
            ctx.variable(unit, name)
                .ok_or_else(|| ResolveError::UnknownVariable {
                    unit: unit.clone(),
                    name: name.clone(),
                })
        }
        Expr::Call(call) => {
            let args = call
                .args
                .iter()
                .map(|arg| resolve(arg, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            (call.func)(&args).map_err(|err| ResolveError::CallFailed {
                name: call.name.clone(),
                message: format!("{err:#}"),
            })
        }
        Expr::List(items) => items
            .iter()
            .map(|item| resolve(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Map(entries) => entries
            .iter()
            .map(|(key, item)| resolve(item, ctx).map(|v| (key.clone(), v)))
            .collect::<Result<_, _>>()
            .map(Value::Map),
    }
}
