use super::*;
use crate::node::{Expr, NodeKind};
use crate::types::ClassDef;

fn listing(unit: &CodeUnit) -> Vec<String> {
    unit.instrs().iter().map(|i| format!("{i:?}")).collect()
}

fn emit_plain(body: &Expr, params: &[Param]) -> Result<CodeUnit, NotSupported> {
    emit_unit("test", body, params, body.ty(), &ClosureInfo::new(), None)
}

#[test]
fn test_add_loads_args_in_order() {
    let a = Param::new("a", Type::I32);
    let b = Param::new("b", Type::I32);
    let body = Expr::add(Expr::param(&a), Expr::param(&b));
    let unit = emit_plain(&body, &[a, b]).unwrap();

    assert_eq!(listing(&unit), ["ldarg 0", "ldarg 1", "Add Wrap", "ret"]);
    assert_eq!(unit.max_stack(), 2);
    assert!(unit.verify().is_ok());
}

#[test]
fn test_checked_unsigned_arith_selects_unsigned_overflow() {
    let a = Param::new("a", Type::U32);
    let body = Expr::arith_checked(ArithOp::Add, Expr::param(&a), Expr::param(&a));
    let unit = emit_plain(&body, &[a]).unwrap();
    assert_eq!(listing(&unit)[2], "Add Unsigned");
}

#[test]
fn test_closure_shifts_formal_args() {
    let x = Param::new("x", Type::I32);
    let k = Param::new("k", Type::I32);
    let mut info = ClosureInfo::new();
    info.add_param(&k);
    let layout = Arc::new(ClosureLayout::new(&info, 10));

    let body = Expr::add(Expr::param(&x), Expr::param(&k));
    let unit = emit_unit("inner", &body, &[x], &Type::I32, &info, Some(layout)).unwrap();

    assert!(unit.has_closure());
    assert_eq!(listing(&unit), ["ldarg 1", "ldclo.fld 0", "Add Wrap", "ret"]);
}

#[test]
fn test_indexed_closure_items_are_type_checked() {
    let x = Param::new("x", Type::I32);
    let k = Param::new("k", Type::I32);
    let mut info = ClosureInfo::new();
    info.add_param(&k);
    let layout = Arc::new(ClosureLayout::new(&info, 0));

    let body = Expr::add(Expr::param(&x), Expr::param(&k));
    let unit = emit_unit("inner", &body, &[x], &Type::I32, &info, Some(layout)).unwrap();

    assert_eq!(
        listing(&unit),
        ["ldarg 1", "ldclo.item 0", "unbox i32", "Add Wrap", "ret"]
    );
}

#[test]
fn test_unknown_parameter_is_invalid_capture() {
    let stray = Param::new("stray", Type::I32);
    let err = emit_plain(&Expr::param(&stray), &[]).unwrap_err();
    assert_eq!(
        err,
        NotSupported::InvalidCapture {
            name: "stray".into()
        }
    );
}

#[test]
fn test_void_body_returns_null() {
    let cell = crate::types::StaticDef::new("counter", Type::I32, Value::I32(0));
    let target = Expr::member(None, Member::Static(cell));
    let body = Expr::block_typed(vec![], vec![Expr::assign(target, Expr::int(1))], Type::Void);
    let unit = emit_plain(&body, &[]).unwrap();

    let code = listing(&unit);
    assert_eq!(code, ["const I32(1)", "stsfld counter", "const Null", "ret"]);
}

#[test]
fn test_assignment_shapes_differ_by_usage() {
    let v = Param::new("v", Type::I32);
    let discarded = Expr::block(
        vec![v.clone()],
        vec![Expr::assign(Expr::param(&v), Expr::int(5)), Expr::param(&v)],
    );
    let used = Expr::block(vec![v.clone()], vec![Expr::assign(Expr::param(&v), Expr::int(5))]);

    let discarded = listing(&emit_plain(&discarded, &[]).unwrap());
    let used = listing(&emit_plain(&used, &[]).unwrap());

    assert!(!discarded.contains(&"dup".to_string()));
    assert_eq!(used, ["default i32", "stloc 0", "const I32(5)", "dup", "stloc 0", "ret"]);
}

#[test]
fn test_struct_field_store_goes_through_address() {
    let point = ClassDef::build_struct("Point")
        .field("x", Type::I32)
        .field("y", Type::I32)
        .finish();
    let p = Param::new("p", Type::Class(point.clone()));
    let x = Member::field(&point, "x").unwrap();
    let body = Expr::block(
        vec![],
        vec![
            Expr::assign(Expr::field(Expr::param(&p), x.clone()), Expr::int(9)),
            Expr::field(Expr::param(&p), x),
        ],
    );
    let unit = emit_plain(&body, &[p]).unwrap();
    let code = listing(&unit);

    assert_eq!(&code[..3], ["ldarga 0", "const I32(9)", "stfld 0"]);
    assert_eq!(&code[3..5], ["ldarga 0", "ldfld 0"]);
}

#[test]
fn test_logical_paths_converge() {
    let a = Param::new("a", Type::Bool);
    let b = Param::new("b", Type::Bool);
    let body = Expr::and_also(Expr::param(&a), Expr::param(&b));
    let unit = emit_plain(&body, &[a, b]).unwrap();

    assert_eq!(
        listing(&unit),
        ["ldarg 0", "dup", "brfalse 5", "pop", "ldarg 1", "ret"]
    );
    assert!(unit.verify().is_ok());
}

#[test]
fn test_try_catch_finally_table() {
    let exception = crate::value::exception_class().clone();
    let e = Param::new("e", Type::Class(exception.clone()));
    let counter = crate::types::StaticDef::new("hits", Type::I32, Value::I32(0));
    let hits = Expr::member(None, Member::Static(counter));
    let body = Expr::try_catch_finally(
        Expr::int(1),
        vec![Expr::catch(Type::Class(exception), Some(e), Expr::int(2))],
        Some(Expr::assign(hits.clone(), Expr::add(hits, Expr::int(1)))),
    );
    let unit = emit_plain(&body, &[]).unwrap();

    assert!(unit.verify().is_ok());
    let handlers = unit.handlers();
    assert_eq!(handlers.len(), 2);
    assert!(matches!(handlers[0].kind, HandlerKind::Catch(_)));
    assert_eq!(handlers[1].kind, HandlerKind::Finally);
    assert_eq!(handlers[0].start, handlers[1].start);
    assert!(handlers[0].end < handlers[1].end);
    assert!(matches!(unit.instrs()[handlers[1].target - 1], Instr::EnterFinally));
}

#[test]
fn test_nested_try_entries_come_first() {
    let exception = Type::Class(crate::value::exception_class().clone());
    let inner = Expr::try_catch(
        Expr::throw_typed(Expr::string("x"), Type::I32),
        vec![Expr::catch(exception.clone(), None, Expr::int(1))],
    );
    let outer = Expr::try_catch(inner, vec![Expr::catch(exception, None, Expr::int(2))]);
    let unit = emit_plain(&outer, &[]).unwrap();

    let handlers = unit.handlers();
    assert_eq!(handlers.len(), 2);
    assert!(handlers[0].end <= handlers[1].end);
    assert!(handlers[1].start <= handlers[0].start);
    assert!(unit.verify().is_ok());
}

#[test]
fn test_catch_filter_declines() {
    let exception = Type::Class(crate::value::exception_class().clone());
    let body = Expr::try_catch(
        Expr::int(1),
        vec![Expr::catch_filtered(exception, None, Expr::bool(true), Expr::int(2))],
    );
    let err = emit_plain(&body, &[]).unwrap_err();
    assert!(matches!(err, NotSupported::UnsupportedConstruct(ref what) if what.contains("filter")));
}

#[test]
fn test_rethrow_outside_catch_declines() {
    let err = emit_plain(&Expr::rethrow(), &[]).unwrap_err();
    assert!(matches!(err, NotSupported::UnsupportedConstruct(_)));
}

#[test]
fn test_rethrow_loads_hidden_exception() {
    let exception = Type::Class(crate::value::exception_class().clone());
    let body = Expr::try_catch(
        Expr::block_typed(vec![], vec![Expr::throw(Expr::string("x"))], Type::Void),
        vec![Expr::catch(exception, None, Expr::rethrow())],
    );
    let unit = emit_plain(&body, &[]).unwrap();
    let code = listing(&unit);
    let throws: Vec<usize> = code
        .iter()
        .enumerate()
        .filter(|(_, i)| *i == "throw")
        .map(|(pc, _)| pc)
        .collect();

    assert_eq!(throws.len(), 2);
    assert_eq!(code[throws[1] - 1], "ldloc 0");
    assert!(unit.verify().is_ok());
}

#[test]
fn test_conditional_with_void_branch_in_value_position() {
    let flag = Param::new("flag", Type::Bool);
    let body = Expr::condition_typed(
        Expr::param(&flag),
        Expr::int(1),
        Expr::throw(Expr::string("no")),
        Type::I32,
    );
    let unit = emit_plain(&body, &[flag]).unwrap();
    assert!(unit.verify().is_ok());
    assert_eq!(body.kind(), NodeKind::Conditional);
}

#[test]
fn test_void_composites_as_arguments_decline() {
    let id = crate::types::MethodDef::new_static("id", vec![Type::I32], Type::I32, |args| {
        Ok(args[0].clone())
    });
    let v = Param::new("v", Type::I32);
    let flag = Param::new("flag", Type::Bool);
    let exception = Type::Class(crate::value::exception_class().clone());
    let set_v = || Expr::assign(Expr::param(&v), Expr::int(1));

    let void_block = Expr::block_typed(vec![v.clone()], vec![set_v()], Type::Void);
    let void_condition = Expr::condition_typed(
        Expr::param(&flag),
        Expr::block_typed(vec![v.clone()], vec![set_v()], Type::Void),
        Expr::default(Type::Void),
        Type::Void,
    );
    let void_try = Expr::try_catch(
        Expr::block_typed(vec![v.clone()], vec![set_v()], Type::Void),
        vec![Expr::catch(exception, None, Expr::default(Type::Void))],
    );

    for arg in [void_block, void_condition, void_try] {
        let body = Expr::call_static(id.clone(), vec![arg]);
        let err = emit_plain(&body, std::slice::from_ref(&flag)).unwrap_err();
        assert!(
            matches!(err, NotSupported::UnsupportedConstruct(ref what) if what.contains("void")),
            "{err:?}"
        );
    }
}

#[test]
fn test_missing_operator_declines() {
    let shape = ClassDef::build("Shape").finish();
    let a = Param::new("a", Type::Class(shape));
    let body = Expr::lt(Expr::param(&a), Expr::param(&a));
    assert!(emit_plain(&body, &[a]).is_err());
}

#[test]
fn test_reference_equality_falls_back_to_generic_eq() {
    let shape = ClassDef::build("Shape").finish();
    let a = Param::new("a", Type::Class(shape));
    let body = Expr::ne(Expr::param(&a), Expr::param(&a));
    let unit = emit_plain(&body, &[a]).unwrap();
    assert_eq!(listing(&unit), ["ldarg 0", "ldarg 0", "eq.generic", "not", "ret"]);
}

#[test]
#[should_panic(expected = "different stack depths")]
fn test_builder_rejects_diverging_depths() {
    let mut b = CodeBuilder::new("bad", vec![], Type::I32, None);
    let end = b.define_label();
    b.emit(Instr::Const(Value::Bool(true)));
    b.branch(BranchKind::IfTrue, end);
    b.emit(Instr::Const(Value::I32(1)));
    b.mark(end);
}

#[test]
#[should_panic(expected = "unmarked labels")]
fn test_builder_rejects_dangling_branch() {
    let mut b = CodeBuilder::new("bad", vec![], Type::I32, None);
    let nowhere = b.define_label();
    b.branch(BranchKind::Always, nowhere);
    b.finish();
}
