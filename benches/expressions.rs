use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use symjit::prelude::*;

fn var(name: &str) -> Expression {
    Expression::from_variable(name).unwrap()
}

fn benchmark_expression() -> Expression {
    // sin(x)*y + x²·y - exp(x/3)
    sin(var("x")) * var("y") + var("x") * var("x") * var("y")
        - exp(var("x") / Expression::from_number(3.0))
}

fn bench_tree_evaluation(c: &mut Criterion) {
    let e = benchmark_expression();
    let mut env = HashMap::new();
    env.insert("x".to_string(), 1.3);
    env.insert("y".to_string(), -0.7);

    c.bench_function("tree_evaluate", |b| {
        b.iter(|| e.evaluate(black_box(&env)).unwrap())
    });
}

fn bench_jit_evaluation(c: &mut Criterion) {
    let e = benchmark_expression();
    let mut cg = CodeGen::new("bench", OptLevel::O3).unwrap();
    cg.add_expression("f", &e, 0).unwrap();
    cg.compile().unwrap();
    let f = cg.fetch("f").unwrap();
    let args = [1.3, -0.7];

    c.bench_function("jit_evaluate", |b| {
        b.iter(|| unsafe { f(black_box(args.as_ptr())) })
    });
}

fn bench_gradient(c: &mut Criterion) {
    let e = benchmark_expression();
    let conns = connections(&e);
    let mut env = HashMap::new();
    env.insert("x".to_string(), 1.3);
    env.insert("y".to_string(), -0.7);

    c.bench_function("reverse_gradient", |b| {
        b.iter(|| gradient(black_box(&e), black_box(&env), black_box(&conns)).unwrap())
    });
}

fn bench_taylor_step(c: &mut Criterion) {
    let x = var("x");
    let y = var("y");
    let sys = vec![
        y.clone(),
        (Expression::from_number(1.0) - x.clone() * x.clone()) * y - x,
    ];
    let mut cg = CodeGen::new("bench taylor", OptLevel::O3).unwrap();
    cg.add_taylor("step", sys, 20).unwrap();
    cg.compile().unwrap();
    let step = cg.fetch_taylor("step").unwrap();

    c.bench_function("taylor_step_order_15", |b| {
        b.iter(|| {
            let mut state = [1.0, 2.0];
            unsafe { step(black_box(state.as_mut_ptr()), 0.05, 15) };
            state
        })
    });
}

criterion_group!(
    benches,
    bench_tree_evaluation,
    bench_jit_evaluation,
    bench_gradient,
    bench_taylor_step
);
criterion_main!(benches);
