//! End-to-end compilation scenarios checked against the reference evaluator.

use std::sync::Arc;

use fastexpr::{
    evaluate, exception_class, interpret_lambda, ClassDef, ClassRef, ClosureStrategy,
    CompiledArtifact, Compiler, CompilerConfig, Expr, FlatTree, Member, MethodDef, NotSupported,
    Param, Requested, StaticDef, Thrown, Type, Value,
};

fn compile(body: &Expr, params: &[Param]) -> CompiledArtifact {
    fastexpr::init_console();
    Compiler::default()
        .compile(body, params, &Requested::Unconstrained)
        .unwrap()
}

fn counter(name: &str) -> (Expr, Arc<StaticDef>) {
    let cell = StaticDef::new(name, Type::I32, Value::I32(0));
    (Expr::member(None, Member::Static(cell.clone())), cell)
}

fn increment(target: &Expr) -> Expr {
    Expr::assign(target.clone(), Expr::add(target.clone(), Expr::int(1)))
}

fn boxed_int(class: &ClassRef, value: i32) -> Expr {
    Expr::constant(
        Value::new_object(class.clone(), vec![Value::I32(value)]),
        Type::Class(class.clone()),
    )
}

fn box_class() -> ClassRef {
    ClassDef::build("Box").field("value", Type::I32).finish()
}

/// `c1.value + ... + cN.value`, one boxed constant per term.
fn boxed_terms(class: &ClassRef, count: i32) -> Vec<Expr> {
    let value = Member::field(class, "value").unwrap();
    (1..=count)
        .map(|n| Expr::field(boxed_int(class, n), value.clone()))
        .collect()
}

/// Feeds one argument per stage to a curried function value.
fn call_chain(first: Result<Value, Thrown>, rest: &[i32]) -> Result<Value, Thrown> {
    rest.iter().try_fold(first?, |f, &n| {
        let stage = f.as_callable().expect("curried stage is a function");
        stage.call(&[Value::I32(n)])
    })
}

fn same_outcome(compiled: &Result<Value, Thrown>, expected: &Result<Value, Thrown>) {
    match (compiled, expected) {
        (Ok(a), Ok(b)) => assert!(a.generic_eq(b), "compiled {a:?}, expected {b:?}"),
        (Err(a), Err(b)) => {
            assert_eq!(a.class_name(), b.class_name());
            assert_eq!(a.message(), b.message());
        }
        (a, b) => panic!("compiled {a:?}, expected {b:?}"),
    }
}

#[test]
fn test_two_parameter_add() {
    let a = Param::new("a", Type::I32);
    let b = Param::new("b", Type::I32);
    let f = compile(&Expr::add(Expr::param(&a), Expr::param(&b)), &[a, b]);

    assert!(matches!(f, CompiledArtifact::Bare(_)));
    assert_eq!(f.invoke(&[Value::I32(3), Value::I32(4)]).unwrap().as_i32(), Some(7));
    assert_eq!(
        f.invoke(&[Value::I32(i32::MAX), Value::I32(1)]).unwrap().as_i32(),
        Some(i32::MIN)
    );
}

#[test]
fn test_independent_compilations_keep_their_captures() {
    let class = box_class();
    let value = Member::field(&class, "value").unwrap();
    let x = Param::new("x", Type::I32);
    let tree = |k: i32| {
        Expr::add(
            Expr::param(&x),
            Expr::field(boxed_int(&class, k), value.clone()),
        )
    };

    let plus_ten = compile(&tree(10), std::slice::from_ref(&x));
    let plus_twenty = compile(&tree(20), std::slice::from_ref(&x));

    assert_eq!(plus_ten.invoke(&[Value::I32(5)]).unwrap().as_i32(), Some(15));
    assert_eq!(plus_twenty.invoke(&[Value::I32(5)]).unwrap().as_i32(), Some(25));
    assert_eq!(plus_ten.invoke(&[Value::I32(5)]).unwrap().as_i32(), Some(15));
}

#[test]
fn test_nested_lambda_closes_over_outer_parameter() {
    // x => y => x + y
    let x = Param::new("x", Type::I32);
    let y = Param::new("y", Type::I32);
    let inner = Expr::lambda(vec![y.clone()], Expr::add(Expr::param(&x), Expr::param(&y)));
    let outer = Expr::lambda(vec![x], inner);

    let f = Compiler::default().compile_lambda(&outer).unwrap();
    let add_three = f.invoke(&[Value::I32(3)]).unwrap();
    let add_four = f.invoke(&[Value::I32(4)]).unwrap();

    let add_three = add_three.as_callable().unwrap();
    let add_four = add_four.as_callable().unwrap();
    assert_eq!(add_three.call(&[Value::I32(4)]).unwrap().as_i32(), Some(7));
    assert_eq!(add_four.call(&[Value::I32(4)]).unwrap().as_i32(), Some(8));
    assert_eq!(add_three.call(&[Value::I32(10)]).unwrap().as_i32(), Some(13));

    let add_hundred = f.invoke(&[Value::I32(100)]).unwrap();
    let result = add_hundred.as_callable().unwrap().call(&[Value::I32(7)]).unwrap();
    assert_eq!(result.as_i32(), Some(107));
}

#[test]
fn test_coalesce_skips_fallback_side_effects() {
    let (calls, cell) = counter("fallback_calls");
    let s = Param::new("s", Type::Str);
    let fallback = Expr::block(vec![], vec![increment(&calls), Expr::string("default")]);
    let body = Expr::coalesce(Expr::param(&s), fallback);
    let f = compile(&body, std::slice::from_ref(&s));

    let result = f.invoke(&[Value::str("given")]).unwrap();
    assert_eq!(result.as_str(), Some("given"));
    assert_eq!(cell.load().as_i32(), Some(0));

    let result = f.invoke(&[Value::Null]).unwrap();
    assert_eq!(result.as_str(), Some("default"));
    assert_eq!(cell.load().as_i32(), Some(1));
}

#[test]
fn test_try_catch_finally_counter() {
    let (finally_runs, cell) = counter("finally_runs");
    let input = Param::new("input", Type::I32);
    let e = Param::new("e", Type::Class(exception_class().clone()));
    let message = Member::field(exception_class(), "message").unwrap();
    let check = MethodDef::new_static("check", vec![Type::I32], Type::Str, |args| {
        match args[0].as_i32() {
            Some(n) if n >= 0 => Ok(Value::str("ok")),
            _ => Err(Thrown::invalid_operation("negative input")),
        }
    });
    let body = Expr::try_catch_finally(
        Expr::call_static(check, vec![Expr::param(&input)]),
        vec![Expr::catch(
            Type::Class(exception_class().clone()),
            Some(e.clone()),
            Expr::add(Expr::string("error: "), Expr::field(Expr::param(&e), message)),
        )],
        Some(increment(&finally_runs)),
    );
    let f = compile(&body, std::slice::from_ref(&input));

    assert_eq!(f.invoke(&[Value::I32(4)]).unwrap().as_str(), Some("ok"));
    assert_eq!(cell.load().as_i32(), Some(1));
    let result = f.invoke(&[Value::I32(-1)]).unwrap();
    assert_eq!(result.as_str(), Some("error: negative input"));
    assert_eq!(cell.load().as_i32(), Some(2));
}

#[test]
fn test_twelve_constants_use_indexed_closure() {
    let class = box_class();
    let value = Member::field(&class, "value").unwrap();
    let body = (1..=12)
        .map(|n| Expr::field(boxed_int(&class, n), value.clone()))
        .reduce(Expr::add)
        .unwrap();

    let f = compile(&body, &[]);
    assert_eq!(f.closure_strategy(), Some(ClosureStrategy::Indexed));
    assert_eq!(f.closure().map(|c| c.len()), Some(12));
    assert_eq!(f.invoke(&[]).unwrap().as_i32(), Some(78));
}

#[test]
fn test_strategy_threshold_at_limit() {
    let class = box_class();
    let value = Member::field(&class, "value").unwrap();
    let sum = |count: i32| {
        (1..=count)
            .map(|n| Expr::field(boxed_int(&class, n), value.clone()))
            .reduce(Expr::add)
            .unwrap()
    };

    let limit = CompilerConfig::default().closure.fixed_field_limit as i32;
    let at_limit = compile(&sum(limit), &[]);
    let above = compile(&sum(limit + 1), &[]);

    assert_eq!(at_limit.closure_strategy(), Some(ClosureStrategy::Fixed));
    assert_eq!(above.closure_strategy(), Some(ClosureStrategy::Indexed));
    assert_eq!(at_limit.invoke(&[]).unwrap().as_i32(), Some(limit * (limit + 1) / 2));
    assert_eq!(
        above.invoke(&[]).unwrap().as_i32(),
        Some((limit + 1) * (limit + 2) / 2)
    );
}

#[test]
fn test_catch_filter_falls_back_to_interpreter() {
    let e = Param::new("e", Type::Class(exception_class().clone()));
    let fail = MethodDef::new_static("fail", vec![], Type::I32, |_| {
        Err(Thrown::invalid_operation("boom"))
    });
    let message = Member::field(exception_class(), "message").unwrap();
    let body = Expr::try_catch(
        Expr::call_static(fail, vec![]),
        vec![Expr::catch_filtered(
            Type::Class(exception_class().clone()),
            Some(e.clone()),
            Expr::eq(Expr::field(Expr::param(&e), message), Expr::string("boom")),
            Expr::int(1),
        )],
    );
    let lambda = Expr::lambda(vec![], body);

    assert!(matches!(
        Compiler::default().compile_lambda(&lambda),
        Err(NotSupported::UnsupportedConstruct(_))
    ));
    let f = Compiler::default().compile_or_fallback(&lambda).unwrap();
    assert!(!f.is_compiled());
    assert_eq!(f.invoke(&[]).unwrap().as_i32(), Some(1));
}

#[test]
fn test_matches_evaluator() {
    let a = Param::new("a", Type::I32);
    let b = Param::new("b", Type::I32);
    let t = Param::new("t", Type::I32);
    let exception = Type::Class(exception_class().clone());
    // t = a / b; t > 2 ? t * t : t - a, with division errors caught
    let body = Expr::try_catch(
        Expr::block(
            vec![t.clone()],
            vec![
                Expr::assign(Expr::param(&t), Expr::div(Expr::param(&a), Expr::param(&b))),
                Expr::condition(
                    Expr::gt(Expr::param(&t), Expr::int(2)),
                    Expr::mul(Expr::param(&t), Expr::param(&t)),
                    Expr::sub(Expr::param(&t), Expr::param(&a)),
                ),
            ],
        ),
        vec![Expr::catch(exception, None, Expr::int(i32::MIN))],
    );
    let params = [a, b];
    let f = compile(&body, &params);

    for (x, y) in [(10, 2), (9, 4), (-7, 3), (5, 0), (i32::MIN, -1), (0, 1)] {
        let args = [Value::I32(x), Value::I32(y)];
        same_outcome(&f.invoke(&args), &evaluate(&body, &params, &args));
    }
}

#[test]
fn test_flat_tree_matches_owned_tree() {
    let a = Param::new("a", Type::I64);
    let body = Expr::condition(
        Expr::lt(Expr::param(&a), Expr::long(0)),
        Expr::negate(Expr::param(&a)),
        Expr::param(&a),
    );
    let tree = FlatTree::from_expr(&body);
    let params = [a];

    let owned = compile(&body, &params);
    let flat = Compiler::default()
        .compile(&tree.root(), &params, &Requested::Unconstrained)
        .unwrap();

    for n in [-5, 0, 12] {
        let args = [Value::I64(n)];
        same_outcome(&flat.invoke(&args), &owned.invoke(&args));
    }
    assert_eq!(flat.is_native(), owned.is_native());
}

#[test]
fn test_three_level_nesting_with_indexed_closures() {
    // x => y => z => c1.value + ... + c11.value + x + y + z
    let class = box_class();
    let x = Param::new("x", Type::I32);
    let y = Param::new("y", Type::I32);
    let z = Param::new("z", Type::I32);
    let body = boxed_terms(&class, 11)
        .into_iter()
        .chain([Expr::param(&x), Expr::param(&y), Expr::param(&z)])
        .reduce(Expr::add)
        .unwrap();
    let middle = Expr::lambda(vec![y.clone()], Expr::lambda(vec![z], body));
    let outer = Expr::lambda(vec![x.clone()], middle.clone());

    let compiler = Compiler::default();
    let info = compiler.analyze(&middle, std::slice::from_ref(&x)).unwrap();
    assert_eq!(info.nested().len(), 2);
    for nested in info.nested() {
        assert_eq!(nested.artifact.closure_strategy(), Some(ClosureStrategy::Indexed));
    }

    let f = compiler.compile_lambda(&outer).unwrap();
    assert_eq!(f.closure_strategy(), Some(ClosureStrategy::Indexed));
    let interpreted = interpret_lambda(&outer).unwrap();
    for (a, b, c) in [(10, 20, 27), (0, 0, 0), (-66, 5, 1)] {
        let compiled = call_chain(f.invoke(&[Value::I32(a)]), &[b, c]);
        let expected = call_chain(interpreted.call(&[Value::I32(a)]), &[b, c]);
        same_outcome(&compiled, &expected);
        assert_eq!(compiled.unwrap().as_i32(), Some(66 + a + b + c));
    }
}

#[test]
fn test_nested_closure_strategy_threshold() {
    // x => z => c1.value + ... + cN.value + x + z, the inner unit holding N + 1 items
    let class = box_class();
    let limit = CompilerConfig::default().closure.fixed_field_limit as i32;
    let compiler = Compiler::default();

    for (constants, strategy) in [
        (limit - 1, ClosureStrategy::Fixed),
        (limit, ClosureStrategy::Indexed),
    ] {
        let x = Param::new("x", Type::I32);
        let z = Param::new("z", Type::I32);
        let body = boxed_terms(&class, constants)
            .into_iter()
            .chain([Expr::param(&x), Expr::param(&z)])
            .reduce(Expr::add)
            .unwrap();
        let inner = Expr::lambda(vec![z], body);
        let outer = Expr::lambda(vec![x.clone()], inner.clone());

        let info = compiler.analyze(&inner, std::slice::from_ref(&x)).unwrap();
        let nested = &info.nested()[0];
        assert_eq!(nested.info.as_ref().map(|i| i.len()), Some(constants as usize + 1));
        assert_eq!(nested.artifact.closure_strategy(), Some(strategy));

        let f = compiler.compile_lambda(&outer).unwrap();
        let compiled = call_chain(f.invoke(&[Value::I32(100)]), &[7]);
        let expected = call_chain(interpret_lambda(&outer).unwrap().call(&[Value::I32(100)]), &[7]);
        same_outcome(&compiled, &expected);
        assert_eq!(
            compiled.unwrap().as_i32(),
            Some(constants * (constants + 1) / 2 + 107)
        );
    }
}
