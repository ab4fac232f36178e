//! Instance factory
//!
//! Instances are auxiliary objects (a model wrapper, a data source) built at
//! iteration 0 of every branch by an `init_<name>` unit. Their constructor
//! arguments are expressions, so they can read the branch config.

use crate::action::{Instance, SharedInstance};
use rex_expr::{ArgTree, Args, Expr};
use std::fmt;
use std::sync::Arc;

/// Constructor of an instance from resolved arguments
pub type CreatorFn = Arc<dyn Fn(&Args) -> anyhow::Result<SharedInstance> + Send + Sync>;

/// Prefix of the unit that builds an instance
pub const INIT_PREFIX: &str = "init_";

/// Named instance constructor
#[derive(Clone)]
pub struct InstanceCreator {
    name: String,
    creator: CreatorFn,
}

impl InstanceCreator {
    /// Creator returning any [`Instance`] type
    #[must_use]
    pub fn new<T, F>(name: impl Into<String>, creator: F) -> Self
    where
        T: Instance,
        F: Fn(&Args) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            creator: Arc::new(move |args| Ok(Arc::new(creator(args)?) as SharedInstance)),
        }
    }

    /// Creator returning already shared instances
    #[must_use]
    pub fn shared<F>(name: impl Into<String>, creator: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<SharedInstance> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            creator: Arc::new(creator),
        }
    }

    /// Instance name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the unit that builds this instance
    #[inline]
    #[must_use]
    pub fn init_unit(&self) -> String {
        format!("{INIT_PREFIX}{}", self.name)
    }

    /// Build the instance
    ///
    /// # Errors
    ///
    /// Returns the constructor's error.
    pub fn create(&self, args: &Args) -> anyhow::Result<SharedInstance> {
        tracing::debug!("Create instance '{}'", self.name);
        (self.creator)(args)
    }
}

impl fmt::Debug for InstanceCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCreator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Options of [`Experiment::add_instance`](crate::Experiment::add_instance)
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Build once on branch 0 and share with every branch
    pub root: bool,
    /// Constructor arguments
    pub args: ArgTree,
}

impl InstanceOptions {
    /// Default options: private instance, no arguments
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one instance across branches
    #[inline]
    #[must_use]
    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Positional constructor argument
    #[inline]
    #[must_use]
    pub fn arg(mut self, expr: impl Into<Expr>) -> Self {
        self.args = self.args.positional(expr);
        self
    }

    /// Named constructor argument
    #[inline]
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.args = self.args.named(name, expr);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use rex_expr::Value;

    struct Scale(i64);

    impl Instance for Scale {
        fn method(self: Arc<Self>, name: &str) -> Option<Action> {
            (name == "apply").then(move || {
                Action::callable(move |args| {
                    let x = args.positional(0).and_then(Value::as_i64).unwrap_or_default();
                    Ok(Value::from(x * self.0))
                })
            })
        }
    }

    #[test]
    fn creator_builds_from_args() {
        let creator = InstanceCreator::new("scale", |args: &Args| {
            Ok(Scale(args.require("factor")?.as_i64().unwrap_or(1)))
        });
        assert_eq!(creator.init_unit(), "init_scale");

        let mut args = Args::default();
        args.named.insert("factor".into(), Value::from(3));
        let instance = creator.create(&args).unwrap();

        let Some(Action::Callable(apply)) = instance.method("apply") else {
            panic!("expected a callable method");
        };
        let mut call_args = Args::default();
        call_args.positional.push(Value::from(5));
        assert_eq!(apply(&call_args).unwrap(), Value::from(15));
    }

    #[test]
    fn options_collect_arguments() {
        let options = InstanceOptions::new()
            .root()
            .arg(Expr::lit(1))
            .kwarg("lr", Expr::config("lr"));
        assert!(options.root);
        assert_eq!(options.args.positional.len(), 1);
        assert!(options.args.named.contains_key("lr"));
    }
}
