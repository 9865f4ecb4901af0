//! Tests for natively compiled units.

use super::compile_unit;
use crate::compiler::{CompiledArtifact, Compiler, Requested};
use crate::emit::{BranchKind, CodeBuilder, Instr};
use crate::node::{ArithOp, CmpOp, Expr, Param};
use crate::types::Type;
use crate::value::{Overflow, Value};

fn native(body: &Expr, params: &[Param]) -> CompiledArtifact {
    Compiler::default()
        .compile(body, params, &Requested::Unconstrained)
        .unwrap()
}

#[test]
fn test_add_is_native() {
    let a = Param::new("a", Type::I64);
    let b = Param::new("b", Type::I64);
    let f = native(&Expr::add(Expr::param(&a), Expr::param(&b)), &[a, b]);

    assert!(f.is_native());
    let result = f.invoke(&[Value::I64(40), Value::I64(2)]).unwrap();
    assert_eq!(result.as_i64(), Some(42));
}

#[test]
fn test_wrapping_matches_vm() {
    let a = Param::new("a", Type::I64);
    let f = native(&Expr::mul(Expr::param(&a), Expr::long(2)), &[a]);

    assert!(f.is_native());
    let result = f.invoke(&[Value::I64(i64::MAX)]).unwrap();
    assert_eq!(result.as_i64(), Some(i64::MAX.wrapping_mul(2)));
}

#[test]
fn test_comparison_returns_bool() {
    let a = Param::new("a", Type::I64);
    let b = Param::new("b", Type::I64);
    let f = native(&Expr::lt(Expr::param(&a), Expr::param(&b)), &[a, b]);

    assert!(f.is_native());
    assert_eq!(f.invoke(&[Value::I64(1), Value::I64(2)]).unwrap().as_bool(), Some(true));
    assert_eq!(f.invoke(&[Value::I64(2), Value::I64(1)]).unwrap().as_bool(), Some(false));
}

#[test]
fn test_condition_joins_blocks() {
    // max(a, b)
    let a = Param::new("a", Type::I64);
    let b = Param::new("b", Type::I64);
    let body = Expr::condition(
        Expr::gt(Expr::param(&a), Expr::param(&b)),
        Expr::param(&a),
        Expr::param(&b),
    );
    let f = native(&body, &[a, b]);

    assert!(f.is_native());
    assert_eq!(f.invoke(&[Value::I64(3), Value::I64(9)]).unwrap().as_i64(), Some(9));
    assert_eq!(f.invoke(&[Value::I64(-3), Value::I64(-9)]).unwrap().as_i64(), Some(-3));
}

#[test]
fn test_short_circuit_and_not() {
    let p = Param::new("p", Type::Bool);
    let q = Param::new("q", Type::Bool);
    let body = Expr::and_also(Expr::param(&p), Expr::not(Expr::param(&q)));
    let f = native(&body, &[p, q]);

    assert!(f.is_native());
    let call = |p: bool, q: bool| {
        f.invoke(&[Value::Bool(p), Value::Bool(q)])
            .unwrap()
            .as_bool()
    };
    assert_eq!(call(true, false), Some(true));
    assert_eq!(call(true, true), Some(false));
    assert_eq!(call(false, false), Some(false));
}

#[test]
fn test_block_locals_are_native() {
    let a = Param::new("a", Type::I64);
    let t = Param::new("t", Type::I64);
    let body = Expr::block(
        vec![t.clone()],
        vec![
            Expr::assign(Expr::param(&t), Expr::mul(Expr::param(&a), Expr::param(&a))),
            Expr::sub(Expr::param(&t), Expr::long(1)),
        ],
    );
    let f = native(&body, &[a]);

    assert!(f.is_native());
    assert_eq!(f.invoke(&[Value::I64(5)]).unwrap().as_i64(), Some(24));
}

#[test]
fn test_division_stays_on_vm() {
    let a = Param::new("a", Type::I64);
    let f = native(&Expr::div(Expr::long(10), Expr::param(&a)), &[a]);

    assert!(!f.is_native());
    assert!(f.invoke(&[Value::I64(0)]).is_err());
}

#[test]
fn test_checked_arithmetic_stays_on_vm() {
    let a = Param::new("a", Type::I64);
    let body = Expr::arith_checked(ArithOp::Add, Expr::param(&a), Expr::long(1));
    let f = native(&body, &[a]);
    assert!(!f.is_native());
}

#[test]
fn test_non_native_types_stay_on_vm() {
    let a = Param::new("a", Type::I32);
    let f = native(&Expr::add(Expr::param(&a), Expr::int(1)), &[a]);
    assert!(!f.is_native());
    assert_eq!(f.invoke(&[Value::I32(1)]).unwrap().as_i32(), Some(2));
}

#[test]
fn test_units_with_closures_stay_on_vm() {
    let a = Param::new("a", Type::I64);
    let k = Param::new("k", Type::I64);
    let inner = Expr::lambda(vec![a.clone()], Expr::add(Expr::param(&a), Expr::param(&k)));
    let outer = Expr::lambda(vec![k], inner);
    let f = Compiler::default().compile_lambda(&outer).unwrap();

    let add_two = f.invoke(&[Value::I64(2)]).unwrap();
    let callable = add_two.as_callable().unwrap();
    assert_eq!(callable.call(&[Value::I64(5)]).unwrap().as_i64(), Some(7));
}

#[test]
fn test_instruction_limit() {
    let a = Param::new("a", Type::I64);
    let body = Expr::add(Expr::param(&a), Expr::long(1));
    let config = fastexpr_config::CompilerConfig {
        native: fastexpr_config::NativeConfig {
            max_instructions: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let f = Compiler::new(config)
        .compile(&body, &[a], &Requested::Unconstrained)
        .unwrap();
    assert!(!f.is_native());
}

#[test]
fn test_backward_branch_loop() {
    // sum = 0; while n > 0 { sum += n; n -= 1 }; sum
    let wrap = |op| Instr::Arith {
        op,
        overflow: Overflow::Wrap,
    };
    let mut b = CodeBuilder::new("sum", vec![Type::I64], Type::I64, None);
    let sum = b.declare_local(Type::I64);
    let top = b.define_label();
    let done = b.define_label();
    b.emit(Instr::Const(Value::I64(0)));
    b.emit(Instr::StoreLocal(sum));
    b.mark(top);
    b.emit(Instr::LoadArg(0));
    b.emit(Instr::Const(Value::I64(0)));
    b.emit(Instr::Cmp(CmpOp::Gt));
    b.branch(BranchKind::IfFalse, done);
    b.emit(Instr::LoadLocal(sum));
    b.emit(Instr::LoadArg(0));
    b.emit(wrap(ArithOp::Add));
    b.emit(Instr::StoreLocal(sum));
    b.emit(Instr::LoadArg(0));
    b.emit(Instr::Const(Value::I64(1)));
    b.emit(wrap(ArithOp::Sub));
    b.emit(Instr::StoreArg(0));
    b.branch(BranchKind::Always, top);
    b.mark(done);
    b.emit(Instr::LoadLocal(sum));
    b.emit(Instr::Ret);
    let unit = b.finish();

    let code = compile_unit(&unit, 64).unwrap();
    assert_eq!(code.arity(), 1);
    assert_eq!(code.call(&[Value::I64(100)]).unwrap().as_i64(), Some(5050));
    assert!(code.call(&[Value::I32(100)]).is_none());
}
