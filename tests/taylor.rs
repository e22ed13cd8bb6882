//! Integration tests of the Taylor stepper against closed-form
//! solutions.

use approx::assert_relative_eq;
use symjit::prelude::*;

fn var(name: &str) -> Expression {
    Expression::from_variable(name).unwrap()
}

fn num(value: f64) -> Expression {
    Expression::from_number(value)
}

fn build_stepper(sys: Vec<Expression>, max_order: u32) -> (CodeGen, TaylorFn) {
    let mut cg = CodeGen::new("taylor tests", OptLevel::O3).unwrap();
    cg.add_taylor("step", sys, max_order).unwrap();
    cg.compile().unwrap();
    let step = cg.fetch_taylor("step").unwrap();
    (cg, step)
}

#[test]
fn van_der_pol_euler_step() {
    // ẋ = y, ẏ = (1 - x²)·y - x with state [1, 2], h = 1.2, order 1:
    // a plain Euler step.
    let x = var("x");
    let y = var("y");
    let sys = vec![
        y.clone(),
        (num(1.0) - x.clone() * x.clone()) * y.clone() - x.clone(),
    ];
    let (_cg, step) = build_stepper(sys, 20);

    let mut state = [1.0, 2.0];
    unsafe { step(state.as_mut_ptr(), 1.2, 1) };
    assert_relative_eq!(state[0], 3.4, max_relative = 1e-14);
    assert_relative_eq!(state[1], 0.8, max_relative = 1e-14);
}

#[test]
fn exponential_growth_converges() {
    // ẋ = x integrates to x₀·e^t.
    let sys = vec![var("x")];
    let (_cg, step) = build_stepper(sys, 25);

    let mut state = [1.0];
    unsafe { step(state.as_mut_ptr(), 0.1, 20) };
    assert_relative_eq!(state[0], 0.1_f64.exp(), max_relative = 1e-13);
}

#[test]
fn exponential_growth_order_controls_accuracy() {
    let sys = vec![var("x")];
    let (_cg, step) = build_stepper(sys, 10);

    // Order 1 is Euler; order 2 adds the h²/2 term.
    let mut state = [1.0];
    unsafe { step(state.as_mut_ptr(), 0.5, 1) };
    assert_relative_eq!(state[0], 1.5, max_relative = 1e-14);

    let mut state = [1.0];
    unsafe { step(state.as_mut_ptr(), 0.5, 2) };
    assert_relative_eq!(state[0], 1.625, max_relative = 1e-14);
}

#[test]
fn harmonic_oscillator_single_step() {
    // ẋ = y, ẏ = -x from [1, 0] integrates to [cos t, -sin t].
    let sys = vec![var("y"), num(-1.0) * var("x")];
    let (_cg, step) = build_stepper(sys, 30);

    let h = 0.5;
    let mut state = [1.0, 0.0];
    unsafe { step(state.as_mut_ptr(), h, 25) };
    assert_relative_eq!(state[0], h.cos(), max_relative = 1e-12);
    assert_relative_eq!(state[1], -h.sin(), epsilon = 1e-12);
}

#[test]
fn harmonic_oscillator_many_steps() {
    let sys = vec![var("y"), num(-1.0) * var("x")];
    let (_cg, step) = build_stepper(sys, 20);

    let h = 0.1;
    let mut state = [1.0, 0.0];
    for _ in 0..100 {
        unsafe { step(state.as_mut_ptr(), h, 15) };
    }
    // After t = 10.
    assert_relative_eq!(state[0], 10.0_f64.cos(), max_relative = 1e-9);
    assert_relative_eq!(state[1], -(10.0_f64.sin()), max_relative = 1e-9);
}

#[test]
fn division_recurrence() {
    // ẋ = 1/x from x₀ = 1 integrates to √(1 + 2t).
    let sys = vec![num(1.0) / var("x")];
    let (_cg, step) = build_stepper(sys, 30);

    let h = 0.1;
    let mut state = [1.0];
    unsafe { step(state.as_mut_ptr(), h, 25) };
    assert_relative_eq!(state[0], (1.0 + 2.0 * h).sqrt(), max_relative = 1e-12);
}

#[test]
fn sine_recurrence() {
    // ẋ = sin(x) has the closed form x(t) = 2·atan(e^t · tan(x₀/2)).
    let sys = vec![sin(var("x"))];
    let (_cg, step) = build_stepper(sys, 30);

    let x0 = std::f64::consts::FRAC_PI_2;
    let h = 0.1;
    let mut state = [x0];
    unsafe { step(state.as_mut_ptr(), h, 25) };

    let expected = 2.0 * (h.exp() * (x0 / 2.0).tan()).atan();
    assert_relative_eq!(state[0], expected, max_relative = 1e-12);
}

#[test]
fn cosine_recurrence() {
    // ẋ = cos(x) has the closed form x(t) = 2·atan(tanh(t/2 + atanh(tan(x₀/2)))).
    // Integrate from 0, where it reduces to x(t) = 2·atan(tanh(t/2)).
    let sys = vec![cos(var("x"))];
    let (_cg, step) = build_stepper(sys, 30);

    let h = 0.1;
    let mut state = [0.0];
    unsafe { step(state.as_mut_ptr(), h, 25) };

    let expected = 2.0 * (h / 2.0).tanh().atan();
    assert_relative_eq!(state[0], expected, max_relative = 1e-12);
}

#[test]
fn exp_recurrence() {
    // ẋ = exp(x) from x₀ = 0 integrates to -ln(1 - t).
    let sys = vec![exp(var("x"))];
    let (_cg, step) = build_stepper(sys, 30);

    let h = 0.1;
    let mut state = [0.0];
    unsafe { step(state.as_mut_ptr(), h, 25) };
    assert_relative_eq!(state[0], -(1.0 - h).ln(), max_relative = 1e-12);
}

#[test]
fn constant_derivative_state_variable() {
    // ẋ = y + (x - x), ẏ = 3 is uniformly accelerated motion:
    // x(t) = x₀ + y₀·t + 3t²/2, y(t) = y₀ + 3t. The vanishing term
    // keeps x a state variable of the system.
    let sys = vec![var("y") + (var("x") - var("x")), num(3.0)];
    let (_cg, step) = build_stepper(sys, 10);

    let h = 0.5;
    let mut state = [1.0, 2.0];
    unsafe { step(state.as_mut_ptr(), h, 3) };
    assert_relative_eq!(state[0], 1.0 + 2.0 * h + 1.5 * h * h, max_relative = 1e-14);
    assert_relative_eq!(state[1], 2.0 + 3.0 * h, max_relative = 1e-14);
}

#[test]
fn decomposition_layout_is_exposed() {
    // The decomposition is a public surface of its own.
    let x = var("x");
    let y = var("y");
    let sys = vec![
        y.clone(),
        (num(1.0) - x.clone() * x.clone()) * y.clone() - x,
    ];
    let dc = taylor_decompose(sys).unwrap();
    assert_eq!(dc.len(), 8);
    assert_eq!(format!("{}", dc[2]), "(u_0 * u_0)");
    assert_eq!(format!("{}", dc[7]), "u_5");
}

#[test]
fn zero_max_order_is_rejected() {
    let mut cg = CodeGen::new("bad order", OptLevel::O0).unwrap();
    assert!(matches!(
        cg.add_taylor("step", vec![var("x")], 0),
        Err(CodegenError::InvalidMaxOrder)
    ));
}

#[test]
fn system_arity_mismatch_is_rejected() {
    let mut cg = CodeGen::new("bad system", OptLevel::O0).unwrap();
    let err = cg
        .add_taylor("step", vec![var("x") * var("y")], 20)
        .unwrap_err();
    assert!(matches!(err, CodegenError::SystemArityMismatch { .. }));
}

#[test]
fn unsupported_function_in_system_is_rejected() {
    let mut cg = CodeGen::new("bad func", OptLevel::O0).unwrap();
    let err = cg.add_taylor("step", vec![tan(var("x"))], 20).unwrap_err();
    assert!(matches!(err, CodegenError::LowerUnsupported(_)));
}

#[test]
fn taylor_symbols_are_not_expression_symbols() {
    let mut cg = CodeGen::new("mixed", OptLevel::O0).unwrap();
    cg.add_taylor("step", vec![var("x")], 5).unwrap();
    cg.add_expression("f", &var("x"), 0).unwrap();
    cg.compile().unwrap();

    assert!(cg.fetch_taylor("step").is_ok());
    assert!(cg.fetch("step").is_err());
    assert!(cg.fetch_taylor("f").is_err());
    assert!(cg.fetch("f").is_ok());
}
