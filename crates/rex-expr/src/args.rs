//! Unit argument trees

use crate::expr::Expr;
use crate::resolve::{resolve, ResolveContext, ResolveError};
use crate::value::Value;
use indexmap::IndexMap;

/// Unresolved unit arguments: positional and named expressions
#[derive(Debug, Clone, Default)]
pub struct ArgTree {
    /// Positional expressions
    pub positional: Vec<Expr>,
    /// Named expressions in definition order
    pub named: IndexMap<String, Expr>,
}

impl ArgTree {
    /// Empty argument tree
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional expression
    #[inline]
    #[must_use]
    pub fn positional(mut self, expr: impl Into<Expr>) -> Self {
        self.positional.push(expr.into());
        self
    }

    /// Set a named expression
    #[inline]
    #[must_use]
    pub fn named(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.named.insert(name.into(), expr.into());
        self
    }

    /// Overlay `other` on top of `self`
    ///
    /// Positional arguments of `other` replace ours when present, named ones
    /// override key by key.
    #[must_use]
    pub fn merge(mut self, other: ArgTree) -> Self {
        if !other.positional.is_empty() {
            self.positional = other.positional;
        }
        self.named.extend(other.named);
        self
    }

    /// True when no argument is set
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Resolve every expression against `ctx`
    ///
    /// # Errors
    ///
    /// Returns the first [`ResolveError`] met, positional arguments first.
    pub fn resolve(&self, ctx: &dyn ResolveContext) -> Result<Args, ResolveError> {
        let positional = self
            .positional
            .iter()
            .map(|expr| resolve(expr, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let named = self
            .named
            .iter()
            .map(|(name, expr)| resolve(expr, ctx).map(|v| (name.clone(), v)))
            .collect::<Result<IndexMap<_, _>, _>>()?;
        Ok(Args { positional, named })
    }
}

/// Resolved unit arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Positional values
    pub positional: Vec<Value>,
    /// Named values in definition order
    pub named: IndexMap<String, Value>,
}

impl Args {
    /// Named argument
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// Named argument that must be present
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::MissingArgument`] when absent.
    pub fn require(&self, name: &str) -> Result<&Value, ResolveError> {
        self.get(name)
            .ok_or_else(|| ResolveError::MissingArgument(name.to_string()))
    }

    /// Positional argument at `index`
    #[inline]
    #[must_use]
    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Total count of arguments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    /// True when there are no arguments
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Named arguments as a mapping value
    #[must_use]
    pub fn named_value(&self) -> Value {
        Value::Map(self.named.clone())
    }
}
