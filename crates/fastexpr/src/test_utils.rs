//! Test fixtures shared by the unit tests.
//!
//! Provides compilers with the native tier switched off, host members with
//! observable side effects, and the evaluator as an oracle.

use std::sync::Arc;

use fastexpr_config::CompilerConfig;

use crate::compiler::Compiler;
use crate::eval::evaluate;
use crate::node::{Expr, Param};
use crate::types::{ClassDef, ClassRef, Member, MethodDef, MethodRef, StaticDef, Type};
use crate::value::{Thrown, Value};

/// A compiler whose artifacts always run on the bytecode VM.
pub fn vm_compiler() -> Compiler {
    Compiler::new(CompilerConfig::default().with_native(false))
}

/// A static `i32` cell starting at zero, and an expression reading it.
pub fn counter(name: &str) -> (Expr, Arc<StaticDef>) {
    let cell = StaticDef::new(name, Type::I32, Value::I32(0));
    (Expr::member(None, Member::Static(cell.clone())), cell)
}

/// `target = target + 1`
pub fn increment(target: &Expr) -> Expr {
    Expr::assign(target.clone(), Expr::add(target.clone(), Expr::int(1)))
}

/// Reads a counter cell.
pub fn count(cell: &StaticDef) -> i32 {
    cell.load().as_i32().unwrap_or(-1)
}

/// A static method with no parameters that always throws
/// `InvalidOperationException("failed")`.
pub fn failing(ret: Type) -> MethodRef {
    MethodDef::new_static("fail", vec![], ret, |_| {
        Err(Thrown::invalid_operation("failed"))
    })
}

/// `struct Point { x: i32, y: i32 }`
pub fn point_class() -> ClassRef {
    ClassDef::build_struct("Point")
        .field("x", Type::I32)
        .field("y", Type::I32)
        .finish()
}

/// Evaluates `body` with the reference evaluator.
pub fn reference(body: &Expr, params: &[Param], args: &[Value]) -> Result<Value, Thrown> {
    evaluate(body, params, args)
}

/// Asserts two outcomes agree: equal values, or exceptions of the same class
/// and message.
pub fn assert_same_outcome(compiled: &Result<Value, Thrown>, expected: &Result<Value, Thrown>) {
    match (compiled, expected) {
        (Ok(a), Ok(b)) => assert!(a.generic_eq(b), "compiled {a:?}, expected {b:?}"),
        (Err(a), Err(b)) => {
            assert_eq!(a.class_name(), b.class_name());
            assert_eq!(a.message(), b.message());
        }
        (a, b) => panic!("compiled {a:?}, expected {b:?}"),
    }
}
