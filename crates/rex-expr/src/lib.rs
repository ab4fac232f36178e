//! REX Expression System
//!
//! Dynamic values and deferred argument expressions for experiment units.
//!
//! # Overview
//!
//! - **Value**: the dynamic value flowing between units, configs and results
//! - **Expr**: a literal or a deferred reference into branch state
//! - **ArgTree** / **Args**: unresolved and resolved unit arguments
//! - **ResolveContext**: the view of a branch an expression is resolved against
//!
//! # Example
//!
//! ```rust
//! use rex_expr::{ArgTree, Expr, ResolveContext, Value};
//!
//! struct Fixed;
//!
//! impl ResolveContext for Fixed {
//!     fn output(&self, name: &str) -> Option<Value> {
//!         (name == "root").then(|| Value::from(10))
//!     }
//!     fn config_value(&self, key: &str) -> Option<Value> {
//!         (key == "x").then(|| Value::from(20))
//!     }
//!     fn config(&self) -> Value {
//!         Value::Null
//!     }
//!     fn branch(&self) -> Value {
//!         Value::Null
//!     }
//!     fn variable(&self, _unit: &str, _name: &str) -> Option<Value> {
//!         None
//!     }
//! }
//!
//! let args = ArgTree::new()
//!     .named("a", Expr::config("x"))
//!     .named("b", Expr::output("root"))
//!     .resolve(&Fixed)
//!     .unwrap();
//!
//! assert_eq!(args.get("a"), Some(&Value::from(20)));
//! assert_eq!(args.get("b"), Some(&Value::from(10)));
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod args;
mod expr;
mod resolve;
mod value;

pub use args::{ArgTree, Args};
pub use expr::{CallFn, ExplicitCall, Expr};
pub use resolve::{resolve, ResolveContext, ResolveError};
pub use value::{Opaque, Value};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
