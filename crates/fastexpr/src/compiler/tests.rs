use super::*;
use crate::closure::ClosureStrategy;
use crate::node::{Expr, FlatTree};
use crate::test_utils::{assert_same_outcome, reference, vm_compiler};
use crate::types::ClassDef;

fn object_block(count: usize) -> Expr {
    let class = ClassDef::build("Item").finish();
    let items = (0..count)
        .map(|_| {
            Expr::constant(
                Value::new_object(class.clone(), vec![]),
                Type::Class(class.clone()),
            )
        })
        .collect();
    Expr::block(vec![], items)
}

#[test]
fn test_bare_artifact() {
    let a = Param::new("a", Type::I32);
    let artifact = vm_compiler()
        .compile(&Expr::add(Expr::param(&a), Expr::int(1)), &[a], &Requested::Unconstrained)
        .unwrap();

    assert!(matches!(artifact, CompiledArtifact::Bare(_)));
    assert!(artifact.closure_strategy().is_none());
    assert_eq!(artifact.invoke(&[Value::I32(41)]).unwrap().as_i32(), Some(42));
}

#[test]
fn test_bound_artifact_carries_constants() {
    let artifact = vm_compiler()
        .compile(&object_block(2), &[], &Requested::Unconstrained)
        .unwrap();

    assert!(matches!(artifact, CompiledArtifact::Bound { .. }));
    assert_eq!(artifact.closure().map(|c| c.len()), Some(2));
    let result = artifact.invoke(&[]).unwrap();
    assert_eq!(result.as_object().map(|o| o.class().name().to_string()), Some("Item".into()));
}

#[test]
fn test_fixed_field_limit_boundary() {
    let compiler = vm_compiler();
    let limit = compiler.config().closure.fixed_field_limit;

    let at_limit = compiler
        .compile(&object_block(limit), &[], &Requested::Unconstrained)
        .unwrap();
    assert_eq!(at_limit.closure_strategy(), Some(ClosureStrategy::Fixed));
    assert!(at_limit.invoke(&[]).unwrap().as_object().is_some());

    let above = compiler
        .compile(&object_block(limit + 1), &[], &Requested::Unconstrained)
        .unwrap();
    assert_eq!(above.closure_strategy(), Some(ClosureStrategy::Indexed));
    assert!(above.invoke(&[]).unwrap().as_object().is_some());
}

#[test]
fn test_configured_field_limit() {
    let compiler = Compiler::new(CompilerConfig::default().with_fixed_field_limit(2));
    let artifact = compiler
        .compile(&object_block(3), &[], &Requested::Unconstrained)
        .unwrap();
    assert_eq!(artifact.closure_strategy(), Some(ClosureStrategy::Indexed));
    assert_eq!(artifact.closure().map(|c| c.len()), Some(3));
    let last = artifact.invoke(&[]).unwrap();
    assert_eq!(last.as_object().map(|o| o.class().name().to_string()), Some("Item".into()));
}

#[test]
fn test_undeclared_root_parameter() {
    let k = Param::new("k", Type::I32);
    let result = vm_compiler().compile(&Expr::param(&k), &[], &Requested::Unconstrained);
    assert_eq!(
        result.unwrap_err(),
        NotSupported::InvalidCapture { name: "k".into() }
    );
}

#[test]
fn test_requested_signature() {
    let a = Param::new("a", Type::I32);
    let body = Expr::add(Expr::param(&a), Expr::int(1));
    let compiler = vm_compiler();
    let params = std::slice::from_ref(&a);

    let exact = Requested::Signature(FuncSig::new(vec![Type::I32], Type::I32));
    assert!(compiler.compile(&body, params, &exact).is_ok());

    let wrong_param = Requested::Signature(FuncSig::new(vec![Type::I64], Type::I32));
    assert!(matches!(
        compiler.compile(&body, params, &wrong_param),
        Err(NotSupported::UnsupportedConstruct(_))
    ));

    let wrong_arity = Requested::Signature(FuncSig::new(vec![], Type::I32));
    assert!(compiler.compile(&body, params, &wrong_arity).is_err());

    let wrong_return = Requested::Signature(FuncSig::new(vec![Type::I32], Type::Str));
    assert!(compiler.compile(&body, params, &wrong_return).is_err());
}

#[test]
fn test_compile_lambda_rejects_other_nodes() {
    assert!(matches!(
        vm_compiler().compile_lambda(&Expr::int(1)),
        Err(NotSupported::UnsupportedConstruct(_))
    ));
}

#[test]
fn test_nested_lambda_curries() {
    // k => a => a + k
    let a = Param::new("a", Type::I32);
    let k = Param::new("k", Type::I32);
    let inner = Expr::lambda(vec![a.clone()], Expr::add(Expr::param(&a), Expr::param(&k)));
    let outer = Expr::lambda(vec![k], inner);

    let artifact = vm_compiler().compile_lambda(&outer).unwrap();
    assert_eq!(artifact.closure_strategy(), Some(ClosureStrategy::Fixed));

    let add_ten = artifact.invoke(&[Value::I32(10)]).unwrap();
    let add_one = artifact.invoke(&[Value::I32(1)]).unwrap();
    let add_ten = add_ten.as_callable().unwrap();
    let add_one = add_one.as_callable().unwrap();
    assert_eq!(add_ten.call(&[Value::I32(5)]).unwrap().as_i32(), Some(15));
    assert_eq!(add_one.call(&[Value::I32(5)]).unwrap().as_i32(), Some(6));
}

#[test]
fn test_fallback_to_interpreter() {
    let exception = Type::Class(crate::value::exception_class().clone());
    let body = Expr::try_catch(
        Expr::call_static(crate::test_utils::failing(Type::I32), vec![]),
        vec![Expr::catch_filtered(exception, None, Expr::bool(true), Expr::int(3))],
    );
    let lambda = Expr::lambda(vec![], body);

    assert!(vm_compiler().compile_lambda(&lambda).is_err());

    let function = vm_compiler().compile_or_fallback(&lambda).unwrap();
    assert!(!function.is_compiled());
    assert_eq!(function.invoke(&[]).unwrap().as_i32(), Some(3));

    let strict = Compiler::new(CompilerConfig::default().with_fallback(false));
    assert!(strict.compile_or_fallback(&lambda).is_err());
}

#[test]
fn test_void_argument_falls_back_without_panicking() {
    let is_null = crate::types::MethodDef::new_static("is_null", vec![Type::I32], Type::Bool, |args| {
        Ok(Value::Bool(args[0].is_null()))
    });
    let v = Param::new("v", Type::I32);
    let void_block = Expr::block_typed(
        vec![v.clone()],
        vec![Expr::assign(Expr::param(&v), Expr::int(1))],
        Type::Void,
    );
    let lambda = Expr::lambda(vec![], Expr::call_static(is_null, vec![void_block]));

    assert!(matches!(
        vm_compiler().compile_lambda(&lambda),
        Err(NotSupported::UnsupportedConstruct(_))
    ));
    let function = vm_compiler().compile_or_fallback(&lambda).unwrap();
    assert!(!function.is_compiled());
    assert_eq!(function.invoke(&[]).unwrap().as_bool(), Some(true));
}

#[test]
fn test_compile_or_fallback_prefers_compiled() {
    let a = Param::new("a", Type::I32);
    let lambda = Expr::lambda(vec![a.clone()], Expr::mul(Expr::param(&a), Expr::int(2)));
    let function = vm_compiler().compile_or_fallback(&lambda).unwrap();

    assert!(function.is_compiled());
    assert!(function.artifact().is_some());
    let callable = function.to_callable().unwrap();
    assert_eq!(callable.call(&[Value::I32(4)]).unwrap().as_i32(), Some(8));
}

#[test]
fn test_flat_tree_input() {
    let a = Param::new("a", Type::I32);
    let b = Param::new("b", Type::I32);
    let body = Expr::condition(
        Expr::gt(Expr::param(&a), Expr::param(&b)),
        Expr::sub(Expr::param(&a), Expr::param(&b)),
        Expr::sub(Expr::param(&b), Expr::param(&a)),
    );
    let tree = FlatTree::from_expr(&body);
    let params = [a, b];

    let artifact = vm_compiler()
        .compile(&tree.root(), &params, &Requested::Unconstrained)
        .unwrap();
    for args in [[Value::I32(9), Value::I32(4)], [Value::I32(-2), Value::I32(6)]] {
        assert_same_outcome(&artifact.invoke(&args), &reference(&body, &params, &args));
    }
}

#[test]
fn test_analyze_reports_captures() {
    let x = Param::new("x", Type::I32);
    let k = Param::new("k", Type::I32);
    let body = Expr::add(Expr::param(&x), Expr::param(&k));
    let info = Compiler::default().analyze(&body, std::slice::from_ref(&x)).unwrap();
    assert_eq!(info.params(), [k]);
}

#[test]
fn test_assert_modes_verify_and_compile() {
    use fastexpr_config::EnvironmentMode;

    let x = Param::new("x", Type::I32);
    let y = Param::new("y", Type::I32);
    let inner = Expr::lambda(vec![y.clone()], Expr::add(Expr::param(&x), Expr::param(&y)));
    let outer = Expr::lambda(vec![x], inner);

    for mode in [EnvironmentMode::FastAssert, EnvironmentMode::FullAssert] {
        let compiler = Compiler::new(CompilerConfig::default().with_environment_mode(mode));
        let f = compiler.compile_lambda(&outer).unwrap();
        let add_two = f.invoke(&[Value::I32(2)]).unwrap();
        let result = add_two.as_callable().unwrap().call(&[Value::I32(3)]).unwrap();
        assert_eq!(result.as_i32(), Some(5));
    }
}
