//! Compiled artifacts and compilers shared across threads.

use rayon::prelude::*;

use fastexpr::{
    ClassDef, Compiler, CompilerConfig, Expr, Member, Param, Requested, StaticDef, Type, Value,
};

#[test]
fn test_parallel_invocation() {
    let a = Param::new("a", Type::I64);
    let body = Expr::condition(
        Expr::gt(Expr::param(&a), Expr::long(500)),
        Expr::mul(Expr::param(&a), Expr::long(2)),
        Expr::sub(Expr::param(&a), Expr::long(1)),
    );
    let params = [a];

    for config in [CompilerConfig::default(), CompilerConfig::default().with_native(false)] {
        let f = Compiler::new(config)
            .compile(&body, &params, &Requested::Unconstrained)
            .unwrap();

        let results: Vec<i64> = (0..1000i64)
            .into_par_iter()
            .map(|n| f.invoke(&[Value::I64(n)]).unwrap().as_i64().unwrap())
            .collect();

        for (n, result) in results.into_iter().enumerate() {
            let n = n as i64;
            let expected = if n > 500 { n * 2 } else { n - 1 };
            assert_eq!(result, expected);
        }
    }
}

#[test]
fn test_parallel_compilation_isolates_closures() {
    let class = ClassDef::build("Offset").field("value", Type::I32).finish();
    let value = Member::field(&class, "value").unwrap();
    let x = Param::new("x", Type::I32);
    let compiler = Compiler::default();

    let results: Vec<(i32, i32)> = (0..64)
        .into_par_iter()
        .map(|k| {
            let offset = Expr::constant(
                Value::new_object(class.clone(), vec![Value::I32(k)]),
                Type::Class(class.clone()),
            );
            let body = Expr::add(Expr::param(&x), Expr::field(offset, value.clone()));
            let f = compiler
                .compile(&body, std::slice::from_ref(&x), &Requested::Unconstrained)
                .unwrap();
            (k, f.invoke(&[Value::I32(1000)]).unwrap().as_i32().unwrap())
        })
        .collect();

    for (k, result) in results {
        assert_eq!(result, 1000 + k);
    }
}

#[test]
fn test_static_cell_shared_across_threads() {
    let cell = StaticDef::new("hits", Type::I32, Value::I32(0));
    let hits = Expr::member(None, Member::Static(cell.clone()));
    let body = Expr::assign(hits.clone(), Expr::add(hits, Expr::int(1)));
    let f = Compiler::default()
        .compile(&body, &[], &Requested::Unconstrained)
        .unwrap();

    (0..8).into_par_iter().for_each(|_| {
        f.invoke(&[]).unwrap();
    });
    let total = cell.load().as_i32().unwrap();
    assert!((1..=8).contains(&total));
}

#[test]
fn test_curried_callables_cross_threads() {
    // k => x => x * k
    let k = Param::new("k", Type::I32);
    let x = Param::new("x", Type::I32);
    let inner = Expr::lambda(vec![x.clone()], Expr::mul(Expr::param(&x), Expr::param(&k)));
    let outer = Expr::lambda(vec![k], inner);
    let f = Compiler::default().compile_lambda(&outer).unwrap();

    let scalers: Vec<Value> = (1..=4).map(|k| f.invoke(&[Value::I32(k)]).unwrap()).collect();

    let products: Vec<i32> = scalers
        .par_iter()
        .map(|scaler| {
            let callable = scaler.as_callable().unwrap();
            callable.call(&[Value::I32(10)]).unwrap().as_i32().unwrap()
        })
        .collect();
    assert_eq!(products, vec![10, 20, 30, 40]);
}
