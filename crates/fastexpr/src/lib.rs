//! Runtime compiler from typed expression trees to callable functions.
//!
//! A tree of [`Expr`] nodes (or a [`FlatTree`] arena) describes a typed
//! computation: arithmetic, comparisons, conditionals, host calls, member
//! access, object and array construction, exception handling and nested
//! lambdas. [`Compiler`] turns it into a [`CompiledArtifact`] in four steps:
//!
//! 1. closure analysis collects embedded constants, captured parameters and
//!    nested lambdas (compiled recursively);
//! 2. closure materialisation picks a fixed-field or indexed layout;
//! 3. emission produces stack bytecode for the [`vm`];
//! 4. linking pairs the unit with its closure and, for plain integer and
//!    boolean code, installs a native version built by the [`jit`] tier.
//!
//! The compiler never guesses: a tree it cannot compile faithfully yields
//! [`NotSupported`], and [`Compiler::compile_or_fallback`] runs the tree on
//! the reference evaluator instead.
//!
//! ```
//! use fastexpr::{Compiler, Expr, Param, Requested, Type, Value};
//!
//! let a = Param::new("a", Type::I32);
//! let b = Param::new("b", Type::I32);
//! let body = Expr::add(Expr::param(&a), Expr::param(&b));
//!
//! let add = Compiler::default()
//!     .compile(&body, &[a, b], &Requested::Unconstrained)
//!     .unwrap();
//! let sum = add.invoke(&[Value::I32(2), Value::I32(3)]).unwrap();
//! assert_eq!(sum.as_i32(), Some(5));
//! ```

pub mod analyze;
pub mod closure;
pub mod compiler;
pub mod emit;
pub mod error;
pub mod eval;
pub mod jit;
pub mod node;
pub mod types;
pub mod value;
pub mod vm;

#[cfg(test)]
pub mod test_utils;

pub use closure::{ClosureStrategy, ClosureValue};
pub use compiler::{CompiledArtifact, Compiler, Function, Requested};
pub use error::{Error, NotSupported, Result};
pub use eval::{evaluate, interpret_lambda};
pub use node::{ArithOp, CmpOp, Expr, ExpressionNode, FlatTree, NodeKind, Param};
pub use types::{ClassDef, ClassRef, FuncSig, Member, MethodDef, MethodRef, StaticDef, Type};
pub use value::{builtin, exception_class, Callable, Thrown, Value};

pub use fastexpr_config::{CompilerConfig, ConfigError, EnvironmentMode};
pub use fastexpr_console::init as init_console;
