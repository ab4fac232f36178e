//! Deferred argument expressions
//!
//! An [`Expr`] is built when an experiment is defined and evaluated only
//! when the owning unit fires, against the state of the branch it fires in.

use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Function invoked by an explicit call expression
pub type CallFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Expression node of an argument tree
#[derive(Clone)]
pub enum Expr {
    /// Value used as is
    Literal(Value),
    /// Most recent output of the named unit in the current branch
    Output(String),
    /// Branch config value by key (slash separated paths allowed),
    /// or the whole config when the key is `None`
    Config(Option<String>),
    /// Description of the branch itself (id, index, iteration, config)
    Branch,
    /// Variable exposed by a pipeline unit
    Variable {
        /// Pipeline unit name
        unit: String,
        /// Variable name
        name: String,
    },
    /// Function applied to resolved argument expressions
    Call(ExplicitCall),
    /// Sequence of expressions, resolved element-wise
    List(Vec<Expr>),
    /// Mapping of expressions, resolved value-wise
    Map(IndexMap<String, Expr>),
}

impl Expr {
    /// Literal value
    #[inline]
    #[must_use]
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Reference to a unit output
    #[inline]
    #[must_use]
    pub fn output(unit: impl Into<String>) -> Self {
        Self::Output(unit.into())
    }

    /// Reference to a config key
    #[inline]
    #[must_use]
    pub fn config(key: impl Into<String>) -> Self {
        Self::Config(Some(key.into()))
    }

    /// Reference to the whole branch config
    #[inline]
    #[must_use]
    pub fn whole_config() -> Self {
        Self::Config(None)
    }

    /// Reference to the branch itself
    #[inline]
    #[must_use]
    pub fn branch() -> Self {
        Self::Branch
    }

    /// Reference to a pipeline variable
    #[inline]
    #[must_use]
    pub fn variable(unit: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Variable {
            unit: unit.into(),
            name: name.into(),
        }
    }

    /// Explicit call of `func` over resolved `args`
    #[must_use]
    pub fn call<F>(name: impl Into<String>, func: F, args: Vec<Expr>) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Call(ExplicitCall {
            name: name.into(),
            func: Arc::new(func),
            args,
        })
    }

    /// Sequence node
    #[inline]
    #[must_use]
    pub fn list(items: Vec<Expr>) -> Self {
        Self::List(items)
    }

    /// Mapping node
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Expr)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True when the tree contains no deferred reference
    #[must_use]
    pub fn is_literal(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::List(items) => items.iter().all(Expr::is_literal),
            Self::Map(entries) => entries.values().all(Expr::is_literal),
            _ => false,
        }
    }

    /// Names of the unit outputs this tree reads
    #[must_use]
    pub fn referenced_outputs(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.collect_outputs(&mut found);
        found
    }

    fn collect_outputs<'a>(&'a self, found: &mut Vec<&'a str>) {
        match self {
            Self::Output(name) => found.push(name),
            Self::Call(call) => call.args.iter().for_each(|a| a.collect_outputs(found)),
            Self::List(items) => items.iter().for_each(|a| a.collect_outputs(found)),
            Self::Map(entries) => entries.values().for_each(|a| a.collect_outputs(found)),
            _ => {}
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Output(name) => write!(f, "O({name})"),
            Self::Config(Some(key)) => write!(f, "C({key})"),
            Self::Config(None) => f.write_str("C()"),
            Self::Branch => f.write_str("E()"),
            Self::Variable { unit, name } => write!(f, "V({unit}.{name})"),
            Self::Call(call) => write!(f, "{}{:?}", call.name, call.args),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(entries) => f.debug_map().entries(entries).finish(),
        }
    }
}

/// Named function applied to argument expressions at resolve time
#[derive(Clone)]
pub struct ExplicitCall {
    /// Name shown in errors and debug output
    pub name: String,
    /// Function to apply
    pub func: CallFn,
    /// Argument expressions
    pub args: Vec<Expr>,
}

impl fmt::Debug for ExplicitCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitCall")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}
