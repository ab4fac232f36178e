//! Unit actions and instances
//!
//! An [`Action`] is what a unit runs: a callable invoked on every fire, or a
//! generator whose stream is built on the first fire and pulled once per
//! fire afterwards. Streams signal their natural end by returning `None`,
//! which the engine turns into [`Pull::End`].

use crate::pipeline::SharedPipeline;
use rex_expr::{Args, Value};
use std::fmt;
use std::sync::Arc;

/// Callable unit body
pub type CallableFn = Arc<dyn Fn(&Args) -> anyhow::Result<Value> + Send + Sync>;

/// Stream produced by a generator unit
pub type UnitStream = Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>;

/// Generator unit body: builds the stream from the resolved arguments
pub type GeneratorFn = Arc<dyn Fn(&Args) -> anyhow::Result<UnitStream> + Send + Sync>;

/// Executable body of a unit
#[derive(Clone)]
pub enum Action {
    /// Invoked on every fire
    Callable(CallableFn),
    /// Built once, pulled on every fire
    Generator(GeneratorFn),
}

impl Action {
    /// Callable action
    #[must_use]
    pub fn callable<F>(func: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Callable(Arc::new(func))
    }

    /// Generator action
    #[must_use]
    pub fn generator<F>(func: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<UnitStream> + Send + Sync + 'static,
    {
        Self::Generator(Arc::new(func))
    }

    /// Generator action over a plain iterator of values
    #[must_use]
    pub fn iter<F, I>(func: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<I> + Send + Sync + 'static,
        I: Iterator<Item = Value> + Send + 'static,
    {
        Self::generator(move |args| {
            let stream = func(args)?;
            Ok(Box::new(stream.map(Ok)) as UnitStream)
        })
    }

    /// Kind of the action
    #[inline]
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Callable(_) => UnitKind::Callable,
            Self::Generator(_) => UnitKind::Generator,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callable(_) => f.write_str("Action::Callable"),
            Self::Generator(_) => f.write_str("Action::Generator"),
        }
    }
}

/// Kind of a unit body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Called on every fire
    Callable,
    /// Pulled on every fire
    Generator,
}

/// Result of pulling a generator
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// Next element
    Item(Value),
    /// Stream is exhausted
    End,
}

/// Auxiliary object built once per branch (or once for all branches when
/// declared root) and used through its methods and pipelines
pub trait Instance: Send + Sync + 'static {
    /// Method usable as a unit body
    fn method(self: Arc<Self>, name: &str) -> Option<Action>;

    /// Pipeline attribute usable by pipeline units
    fn pipeline(&self, _name: &str) -> Option<SharedPipeline> {
        None
    }
}

/// Shared instance handle
pub type SharedInstance = Arc<dyn Instance>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_wraps_values_as_items() {
        let action = Action::iter(|_| Ok((0..3).map(Value::from)));
        let Action::Generator(build) = action else {
            panic!("expected a generator");
        };
        let items: Vec<Value> = build(&Args::default())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items, vec![Value::from(0), Value::from(1), Value::from(2)]);
    }

    #[test]
    fn kinds_match_variants() {
        assert_eq!(Action::callable(|_| Ok(Value::Null)).kind(), UnitKind::Callable);
        assert_eq!(
            Action::iter(|_| Ok(std::iter::empty())).kind(),
            UnitKind::Generator
        );
    }
}
