//! End-to-end tests of the JIT pipeline: tree evaluation against the
//! three compiled entry shapes, the IR lift, and the failure modes of
//! the module state machine.

use std::collections::HashMap;

use approx::assert_relative_eq;
use symjit::prelude::*;

fn var(name: &str) -> Expression {
    Expression::from_variable(name).unwrap()
}

fn num(value: f64) -> Expression {
    Expression::from_number(value)
}

fn env(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

#[test]
fn compile_and_fetch_packed() {
    // f(x) = x + x - x*x, evaluated at 3.45.
    let x = var("x");
    let e = x.clone() + x.clone() - x.clone() * x;

    let mut cg = CodeGen::new("packed", OptLevel::O3).unwrap();
    cg.add_expression("f", &e, 10).unwrap();
    cg.compile().unwrap();

    let f = cg.fetch("f").unwrap();
    let args = [3.45];
    let value = unsafe { f(args.as_ptr()) };
    assert_relative_eq!(value, 3.45 + 3.45 - 3.45 * 3.45, max_relative = 1e-14);
    assert_relative_eq!(value, -5.0025, max_relative = 1e-12);
}

#[test]
fn entry_shapes_agree() {
    let e = var("x") * var("y") + sin(var("x")) - num(0.5) * var("y");

    let mut cg = CodeGen::new("shapes", OptLevel::O2).unwrap();
    cg.add_expression("f", &e, 4).unwrap();
    cg.compile().unwrap();

    let packed = cg.fetch("f").unwrap();
    let varargs: unsafe extern "C" fn(f64, f64) -> f64 = cg.fetch_vararg("f").unwrap();
    let batch = cg.fetch_batch("f").unwrap();

    let points = [[0.3, 1.7], [-2.0, 0.25], [4.5, -3.5], [0.0, 0.0]];

    // Batched form: four rows of packed (x, y) pairs.
    let flat: Vec<f64> = points.iter().flatten().copied().collect();
    let mut batched = vec![0.0; points.len()];
    unsafe { batch(batched.as_mut_ptr(), flat.as_ptr()) };

    for (i, point) in points.iter().enumerate() {
        let from_packed = unsafe { packed(point.as_ptr()) };
        let from_varargs = unsafe { varargs(point[0], point[1]) };
        let from_tree = e.evaluate(&env(&[("x", point[0]), ("y", point[1])])).unwrap();

        assert_relative_eq!(from_packed, from_varargs, max_relative = 1e-14);
        assert_relative_eq!(from_packed, batched[i], max_relative = 1e-14);
        assert_relative_eq!(from_packed, from_tree, max_relative = 1e-12);
    }
}

#[test]
fn evaluate_matches_compiled_at_all_opt_levels() {
    let e = sin(var("x")) * cos(var("y")) + exp(var("x") * var("y")) / num(3.0);
    let point = env(&[("x", 0.65), ("y", -1.2)]);
    let expected = e.evaluate(&point).unwrap();

    for level in [OptLevel::O0, OptLevel::O1, OptLevel::O2, OptLevel::O3] {
        let mut cg = CodeGen::new("levels", level).unwrap();
        cg.add_expression("f", &e, 0).unwrap();
        cg.compile().unwrap();

        let f = cg.fetch("f").unwrap();
        let args = [0.65, -1.2];
        let value = unsafe { f(args.as_ptr()) };
        assert_relative_eq!(value, expected, max_relative = 1e-12);
    }
}

#[test]
fn external_and_intrinsic_calls() {
    // tan is an external host call, sqrt and abs lower to native
    // instructions, pow goes through the runtime symbol.
    let e = tan(var("x")) + sqrt(abs(var("x"))) + pow(var("x"), num(2.0));

    let mut cg = CodeGen::new("calls", OptLevel::O3).unwrap();
    cg.add_expression("f", &e, 0).unwrap();
    cg.compile().unwrap();

    let f = cg.fetch("f").unwrap();
    let x = 1.3_f64;
    let args = [x];
    let value = unsafe { f(args.as_ptr()) };
    assert_relative_eq!(
        value,
        x.tan() + x.abs().sqrt() + x.powi(2),
        max_relative = 1e-12
    );
}

#[test]
fn constant_expression_has_no_arguments() {
    let e = num(2.0) * num(3.0) + num(1.0);
    let mut cg = CodeGen::new("constants", OptLevel::O1).unwrap();
    cg.add_expression("c", &e, 0).unwrap();
    cg.compile().unwrap();

    let f = cg.fetch("c").unwrap();
    let value = unsafe { f(std::ptr::null()) };
    assert_relative_eq!(value, 7.0);
}

#[test]
fn fetch_vararg_checks_arity() {
    let e = var("x") + var("y");
    let mut cg = CodeGen::new("arity", OptLevel::O0).unwrap();
    cg.add_expression("f", &e, 0).unwrap();
    cg.compile().unwrap();

    let wrong: Result<unsafe extern "C" fn(f64) -> f64, _> = cg.fetch_vararg("f");
    assert!(matches!(
        wrong,
        Err(CodegenError::Expr(ExprError::ArityMismatch { .. }))
    ));

    let right: unsafe extern "C" fn(f64, f64) -> f64 = cg.fetch_vararg("f").unwrap();
    assert_relative_eq!(unsafe { right(2.0, 3.0) }, 5.0);
}

#[test]
fn name_collision_is_rejected() {
    let mut cg = CodeGen::new("collision", OptLevel::O0).unwrap();
    cg.add_expression("f", &var("x"), 0).unwrap();
    let err = cg.add_expression("f", &var("y"), 0).unwrap_err();
    assert!(matches!(err, CodegenError::NameCollision(name) if name == "f"));
}

#[test]
fn dotted_symbol_names_are_rejected() {
    let mut cg = CodeGen::new("dots", OptLevel::O0).unwrap();
    let err = cg.add_expression("a.b", &var("x"), 0).unwrap_err();
    assert!(matches!(
        err,
        CodegenError::Expr(ExprError::InvalidSymbolName(_))
    ));
}

#[test]
fn module_is_sealed_after_compile() {
    let mut cg = CodeGen::new("sealed", OptLevel::O0).unwrap();
    cg.add_expression("f", &var("x"), 0).unwrap();
    cg.compile().unwrap();

    assert!(matches!(
        cg.add_expression("g", &var("x"), 0),
        Err(CodegenError::ModuleCompiled)
    ));
    assert!(matches!(cg.compile(), Err(CodegenError::ModuleCompiled)));
}

#[test]
fn fetch_before_compile_fails() {
    let mut cg = CodeGen::new("early", OptLevel::O0).unwrap();
    cg.add_expression("f", &var("x"), 0).unwrap();
    assert!(cg.fetch("f").is_err());
}

#[test]
fn fetch_unknown_symbol_fails() {
    let mut cg = CodeGen::new("unknown", OptLevel::O0).unwrap();
    cg.add_expression("f", &var("x"), 0).unwrap();
    cg.compile().unwrap();
    assert!(matches!(
        cg.fetch("g"),
        Err(CodegenError::UnknownFunction(name)) if name == "g"
    ));
}

#[test]
fn dump_renders_all_entry_points() {
    let mut cg = CodeGen::new("dump", OptLevel::O0).unwrap();
    cg.add_expression("f", &(var("x") + num(1.0)), 0).unwrap();

    let full = cg.dump();
    assert!(full.contains("function"));

    // Each entry point can be dumped individually.
    assert!(cg.dump_function("f").is_ok());
    assert!(cg.dump_function("f.vecargs").is_ok());
    assert!(cg.dump_function("f.batch").is_ok());
    assert!(matches!(
        cg.dump_function("nope"),
        Err(CodegenError::UnknownFunction(_))
    ));
}

#[test]
fn to_expression_round_trips_arithmetic() {
    let x = var("x");
    let e = x.clone() + x.clone() - x.clone() * x;

    let mut cg = CodeGen::new("lift", OptLevel::O0).unwrap();
    cg.add_expression("f", &e, 0).unwrap();

    let lifted = cg.to_expression("f").unwrap();
    assert_eq!(lifted, e);
}

#[test]
fn to_expression_lifts_intrinsics() {
    let e = sin(var("x")) + sqrt(var("x"));
    let mut cg = CodeGen::new("lift2", OptLevel::O0).unwrap();
    cg.add_expression("f", &e, 0).unwrap();

    let lifted = cg.to_expression("f").unwrap();
    assert_eq!(lifted, e);

    // The lifted tree evaluates like the original.
    let point = env(&[("x", 0.81)]);
    assert_relative_eq!(
        lifted.evaluate(&point).unwrap(),
        e.evaluate(&point).unwrap()
    );
}

#[test]
fn to_expression_rejects_multi_block_functions() {
    let mut cg = CodeGen::new("lift3", OptLevel::O0).unwrap();
    cg.add_expression("f", &(var("x") + num(1.0)), 0).unwrap();

    // The batched entry has a loop and cannot be lifted.
    assert!(matches!(
        cg.to_expression("f.batch"),
        Err(CodegenError::LiftUnsupported(_))
    ));
}

#[test]
fn lifted_user_calls_stay_differentiable() {
    // Define sq(x) = x*x inside the module, call it from h, then lift h
    // back into a tree and differentiate it.
    let mut cg = CodeGen::new("userfn", OptLevel::O0).unwrap();
    cg.add_expression("sq", &(var("x") * var("x")), 0).unwrap();

    let h = symjit::math::user("sq", vec![var("y")]).unwrap() + var("y");
    cg.add_expression("h", &h, 0).unwrap();

    let lifted = cg.to_expression("h").unwrap();
    let point = env(&[("y", 3.0)]);
    assert_relative_eq!(lifted.evaluate(&point).unwrap(), 12.0);

    // d/dy (y^2 + y) = 2y + 1 = 7 at y = 3.
    let derivative = lifted.diff("y").unwrap();
    assert_relative_eq!(derivative.evaluate(&point).unwrap(), 7.0);
}

#[test]
fn user_calls_compile_and_run() {
    let mut cg = CodeGen::new("usercall", OptLevel::O2).unwrap();
    cg.add_expression("sq", &(var("x") * var("x")), 0).unwrap();

    let h = symjit::math::user("sq", vec![var("y")]).unwrap() + num(1.0);
    cg.add_expression("h", &h, 0).unwrap();
    cg.compile().unwrap();

    let f = cg.fetch("h").unwrap();
    let args = [4.0];
    assert_relative_eq!(unsafe { f(args.as_ptr()) }, 17.0);
}

#[test]
fn unknown_user_function_is_rejected() {
    let mut cg = CodeGen::new("nouser", OptLevel::O0).unwrap();
    let e = symjit::math::user("ghost", vec![var("x")]).unwrap();
    assert!(matches!(
        cg.add_expression("f", &e, 0),
        Err(CodegenError::UnknownFunction(name)) if name == "ghost"
    ));
}

#[test]
fn batch_entry_runs_batch_size_iterations() {
    let e = var("x") * num(2.0);
    let mut cg = CodeGen::new("batch", OptLevel::O1).unwrap();
    cg.add_expression("f", &e, 3).unwrap();
    cg.compile().unwrap();

    let batch = cg.fetch_batch("f").unwrap();
    let input = [1.0, 2.0, 3.0];
    // Guard value past the batch length must stay untouched.
    let mut output = [0.0, 0.0, 0.0, -1.0];
    unsafe { batch(output.as_mut_ptr(), input.as_ptr()) };
    assert_eq!(&output[..3], &[2.0, 4.0, 6.0]);
    assert_eq!(output[3], -1.0);
}
