use super::*;
use crate::compiler::{CompiledArtifact, Requested};
use crate::emit::{BranchKind, CodeBuilder};
use crate::node::{ArithOp, CmpOp, Expr, Param};
use crate::test_utils::{count, counter, failing, increment, point_class, vm_compiler};
use crate::types::{Member, Type};
use crate::value::{builtin, exception_class};

fn compile(body: &Expr, params: &[Param]) -> CompiledArtifact {
    vm_compiler()
        .compile(body, params, &Requested::Unconstrained)
        .unwrap()
}

fn exception() -> Type {
    Type::Class(exception_class().clone())
}

#[test]
fn test_invoke_adds_arguments() {
    let a = Param::new("a", Type::I32);
    let b = Param::new("b", Type::I32);
    let f = compile(&Expr::add(Expr::param(&a), Expr::param(&b)), &[a, b]);

    assert!(!f.is_native());
    let result = f.invoke(&[Value::I32(3), Value::I32(4)]).unwrap();
    assert_eq!(result.as_i32(), Some(7));
}

#[test]
fn test_unchecked_add_wraps() {
    let a = Param::new("a", Type::I32);
    let f = compile(&Expr::add(Expr::param(&a), Expr::int(1)), &[a]);
    let result = f.invoke(&[Value::I32(i32::MAX)]).unwrap();
    assert_eq!(result.as_i32(), Some(i32::MIN));
}

#[test]
fn test_checked_add_throws_overflow() {
    let a = Param::new("a", Type::I32);
    let body = Expr::arith_checked(ArithOp::Add, Expr::param(&a), Expr::int(1));
    let f = compile(&body, &[a]);

    let thrown = f.invoke(&[Value::I32(i32::MAX)]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::overflow()));
}

#[test]
fn test_division_by_zero_throws() {
    let a = Param::new("a", Type::I64);
    let f = compile(&Expr::div(Expr::long(10), Expr::param(&a)), &[a]);

    assert_eq!(f.invoke(&[Value::I64(5)]).unwrap().as_i64(), Some(2));
    let thrown = f.invoke(&[Value::I64(0)]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::divide_by_zero()));
}

#[test]
fn test_arity_mismatch_is_rejected() {
    let a = Param::new("a", Type::I32);
    let f = compile(&Expr::param(&a), &[a]);
    let thrown = f.invoke(&[]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::invalid_operation()));
}

#[test]
fn test_catch_and_finally_on_both_paths() {
    let (hits, cell) = counter("hits");
    let a = Param::new("a", Type::I32);
    let body = Expr::try_catch_finally(
        Expr::div(Expr::int(100), Expr::param(&a)),
        vec![Expr::catch(
            Type::Class(builtin::divide_by_zero().clone()),
            None,
            Expr::int(-1),
        )],
        Some(increment(&hits)),
    );
    let f = compile(&body, &[a]);

    assert_eq!(f.invoke(&[Value::I32(0)]).unwrap().as_i32(), Some(-1));
    assert_eq!(count(&cell), 1);
    assert_eq!(f.invoke(&[Value::I32(4)]).unwrap().as_i32(), Some(25));
    assert_eq!(count(&cell), 2);
}

#[test]
fn test_catch_variable_reads_message() {
    let e = Param::new("e", exception());
    let message = Member::field(exception_class(), "message").unwrap();
    let body = Expr::try_catch(
        Expr::call_static(failing(Type::Str), vec![]),
        vec![Expr::catch(
            exception(),
            Some(e.clone()),
            Expr::field(Expr::param(&e), message),
        )],
    );
    let f = compile(&body, &[]);
    assert_eq!(f.invoke(&[]).unwrap().as_str(), Some("failed"));
}

#[test]
fn test_unmatched_exception_escapes_through_finally() {
    let (hits, cell) = counter("hits");
    let body = Expr::try_catch_finally(
        Expr::throw_typed(Expr::string("boom"), Type::I32),
        vec![Expr::catch(exception(), None, Expr::int(0))],
        Some(increment(&hits)),
    );
    let f = compile(&body, &[]);

    let thrown = f.invoke(&[]).unwrap_err();
    assert_eq!(thrown.value().as_str(), Some("boom"));
    assert_eq!(count(&cell), 1);
}

#[test]
fn test_inner_finally_runs_before_outer_catch() {
    let (log, cell) = counter("log");
    // finally multiplies by ten, the handler adds one: 11 only in that order
    cell.store(Value::I32(1));
    let inner = Expr::try_finally(
        Expr::call_static(failing(Type::I32), vec![]),
        Expr::assign(log.clone(), Expr::mul(log.clone(), Expr::int(10))),
    );
    let outer = Expr::try_catch(
        inner,
        vec![Expr::catch(
            exception(),
            None,
            Expr::block(vec![], vec![increment(&log), Expr::int(7)]),
        )],
    );
    let f = compile(&outer, &[]);

    assert_eq!(f.invoke(&[]).unwrap().as_i32(), Some(7));
    assert_eq!(count(&cell), 11);
}

#[test]
fn test_exception_in_finally_replaces_pending_one() {
    let body = Expr::try_catch(
        Expr::try_finally(
            Expr::throw_typed(Expr::string("first"), Type::I32),
            Expr::throw(Expr::string("second")),
        ),
        vec![Expr::catch(Type::Str, None, Expr::int(2))],
    );
    let f = compile(&body, &[]);
    assert_eq!(f.invoke(&[]).unwrap().as_i32(), Some(2));
}

#[test]
fn test_rethrow_keeps_original_exception() {
    let (hits, cell) = counter("hits");
    let body = Expr::try_catch(
        Expr::call_static(failing(Type::I32), vec![]),
        vec![Expr::catch(
            exception(),
            None,
            Expr::block_typed(vec![], vec![increment(&hits), Expr::rethrow()], Type::I32),
        )],
    );
    let f = compile(&body, &[]);

    let thrown = f.invoke(&[]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::invalid_operation()));
    assert_eq!(thrown.message().as_deref(), Some("failed"));
    assert_eq!(count(&cell), 1);
}

#[test]
fn test_struct_argument_mutated_in_place() {
    let point = point_class();
    let p = Param::new("p", Type::Class(point.clone()));
    let x = Member::field(&point, "x").unwrap();
    let y = Member::field(&point, "y").unwrap();
    let body = Expr::block(
        vec![],
        vec![
            Expr::assign(Expr::field(Expr::param(&p), x.clone()), Expr::int(5)),
            Expr::add(
                Expr::field(Expr::param(&p), x),
                Expr::field(Expr::param(&p), y),
            ),
        ],
    );
    let f = compile(&body, &[p]);

    let arg = Value::new_struct(point, vec![Value::I32(1), Value::I32(2)]);
    assert_eq!(f.invoke(&[arg.clone()]).unwrap().as_i32(), Some(7));
    // the caller's copy is untouched
    assert_eq!(arg.as_struct().unwrap().fields[0].as_i32(), Some(1));
}

#[test]
fn test_struct_array_element_store() {
    let point = point_class();
    let points = Param::new("points", Type::array(Type::Class(point.clone())));
    let x = Member::field(&point, "x").unwrap();
    let element = Expr::array_index(Expr::param(&points), Expr::int(1));
    let body = Expr::block(
        vec![],
        vec![
            Expr::assign(Expr::field(element.clone(), x.clone()), Expr::int(42)),
            Expr::field(element, x),
        ],
    );
    let f = compile(&body, &[points]);

    let origin = || Value::new_struct(point.clone(), vec![Value::I32(0), Value::I32(0)]);
    let array = Value::new_array(Type::Class(point.clone()), vec![origin(), origin()]);
    assert_eq!(f.invoke(&[array.clone()]).unwrap().as_i32(), Some(42));

    let stored = array.as_array().unwrap().get(1).unwrap();
    assert_eq!(stored.as_struct().unwrap().fields[0].as_i32(), Some(42));
}

#[test]
fn test_array_index_out_of_range() {
    let items = Param::new("items", Type::array(Type::I32));
    let f = compile(&Expr::array_index(Expr::param(&items), Expr::int(3)), &[items]);

    let array = Value::new_array(Type::I32, vec![Value::I32(1)]);
    let thrown = f.invoke(&[array]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::index_out_of_range()));
}

#[test]
fn test_null_receiver_throws_null_reference() {
    let point = crate::types::ClassDef::build("Node")
        .field("value", Type::I32)
        .finish();
    let node = Param::new("node", Type::Class(point.clone()));
    let value = Member::field(&point, "value").unwrap();
    let f = compile(&Expr::field(Expr::param(&node), value), &[node]);

    let thrown = f.invoke(&[Value::Null]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::null_reference()));
}

#[test]
fn test_backward_branch_loop() {
    // sum = 0; while n > 0 { sum += n; n -= 1 }; sum
    let mut b = CodeBuilder::new("sum", vec![Type::I32], Type::I32, None);
    let sum = b.declare_local(Type::I32);
    let top = b.define_label();
    let done = b.define_label();
    b.emit(Instr::Const(Value::I32(0)));
    b.emit(Instr::StoreLocal(sum));
    b.mark(top);
    b.emit(Instr::LoadArg(0));
    b.emit(Instr::Const(Value::I32(0)));
    b.emit(Instr::Cmp(CmpOp::Gt));
    b.branch(BranchKind::IfFalse, done);
    b.emit(Instr::LoadLocal(sum));
    b.emit(Instr::LoadArg(0));
    b.emit(Instr::Arith {
        op: ArithOp::Add,
        overflow: crate::value::Overflow::Wrap,
    });
    b.emit(Instr::StoreLocal(sum));
    b.emit(Instr::LoadArg(0));
    b.emit(Instr::Const(Value::I32(1)));
    b.emit(Instr::Arith {
        op: ArithOp::Sub,
        overflow: crate::value::Overflow::Wrap,
    });
    b.emit(Instr::StoreArg(0));
    b.branch(BranchKind::Always, top);
    b.mark(done);
    b.emit(Instr::LoadLocal(sum));
    b.emit(Instr::Ret);
    let unit = Arc::new(b.finish());

    assert!(unit.verify().is_ok());
    assert_eq!(invoke(&unit, None, &[Value::I32(4)]).unwrap().as_i32(), Some(10));
}

#[test]
fn test_missing_closure_is_rejected() {
    let x = Param::new("x", Type::I32);
    let k = Param::new("k", Type::I32);
    let inner = Expr::lambda(vec![x.clone()], Expr::add(Expr::param(&x), Expr::param(&k)));
    let outer = Expr::lambda(vec![k], inner);
    let f = vm_compiler().compile_lambda(&outer).unwrap();

    let closure = f.invoke(&[Value::I32(1)]).unwrap();
    let Value::Func(Callable::Code { unit, .. }) = closure else {
        panic!("expected a compiled callable");
    };
    let thrown = invoke(&unit, None, &[Value::I32(1)]).unwrap_err();
    assert!(thrown.is_instance_of(builtin::invalid_operation()));
}
