//! Library of elementary functions and the function-call node.
//!
//! The vocabulary of callable functions is a closed enumeration,
//! [`Func`]. Each kind carries, through a per-kind dispatch, everything
//! the rest of the crate needs:
//!
//! - the canonical symbol the code generator resolves (`"sin"`, `"fabs"`,
//!   `"pow"`, ...);
//! - a display name for human output;
//! - a linkage [`CallKind`] and optimisation attribute set;
//! - numerical evaluation (`eval_num`) and partial derivatives
//!   (`eval_num_partial`) for the reverse-mode engine;
//! - the symbolic chain rule (`diff`), where one is implemented.
//!
//! Derivative rules are registered for `sin`, `cos`, `tan` and `sqrt`;
//! differentiating through any other kind reports
//! [`ExprError::NonDifferentiable`].
//!
//! Calls to functions that were *defined inside the JIT module* go
//! through the separate [`Func::User`] channel. A user call produced by
//! the IR lift carries the callee's lifted body, which keeps it
//! evaluable and differentiable outside the module.
//!
//! Factory functions ([`sin`], [`cos`], [`pow`], ...) are the public way
//! to build call expressions.

use std::collections::HashMap;
use std::fmt;

use crate::errors::ExprError;
use crate::expr::{check_symbol_name, Expression};

/// How the code generator resolves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Resolved against the fixed builtin set; unknown names fail.
    Intrinsic,
    /// Declared as an external `f64(f64, ...)` import on first use.
    External,
    /// Looked up as a non-empty definition local to the module.
    User,
}

/// Optimisation hints attached to external declarations.
///
/// The Cranelift backend cannot attach these to a declaration the way
/// LLVM does; they are kept as metadata and expressed as memory flags
/// where the IR allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnAttr {
    NoUnwind,
    Speculatable,
    ReadNone,
    WillReturn,
}

const EXTERNAL_ATTRS: &[FnAttr] = &[
    FnAttr::NoUnwind,
    FnAttr::Speculatable,
    FnAttr::ReadNone,
    FnAttr::WillReturn,
];

/// A call to a function defined inside the JIT module.
///
/// `params` and `body` are populated when the call was produced by the
/// IR-to-expression lift; they make the call evaluable and
/// differentiable without re-entering the module.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFunc {
    name: String,
    params: Vec<String>,
    body: Option<Box<Expression>>,
}

impl UserFunc {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn body(&self) -> Option<&Expression> {
        self.body.as_deref()
    }
}

/// The closed vocabulary of elementary functions, plus the user channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Pow,
    Exp,
    Exp2,
    Log,
    Log2,
    Log10,
    Sqrt,
    Abs,
    User(UserFunc),
}

impl Func {
    /// Canonical symbol used by the code generator.
    pub fn name(&self) -> &str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Asin => "asin",
            Func::Acos => "acos",
            Func::Atan => "atan",
            Func::Atan2 => "atan2",
            Func::Pow => "pow",
            Func::Exp => "exp",
            Func::Exp2 => "exp2",
            Func::Log => "log",
            Func::Log2 => "log2",
            Func::Log10 => "log10",
            Func::Sqrt => "sqrt",
            Func::Abs => "fabs",
            Func::User(u) => u.name(),
        }
    }

    /// Name used for human-readable output.
    pub fn display_name(&self) -> &str {
        match self {
            Func::Abs => "abs",
            _ => self.name(),
        }
    }

    /// Linkage kind consumed by the code generator.
    pub fn kind(&self) -> CallKind {
        match self {
            Func::Tan | Func::Asin | Func::Acos | Func::Atan | Func::Atan2 => CallKind::External,
            Func::User(_) => CallKind::User,
            _ => CallKind::Intrinsic,
        }
    }

    /// Attribute set attached on first creation of an external
    /// declaration.
    pub fn attrs(&self) -> &'static [FnAttr] {
        match self.kind() {
            CallKind::External | CallKind::User => EXTERNAL_ATTRS,
            CallKind::Intrinsic => &[],
        }
    }

    /// Number of arguments the function expects, when fixed by the kind.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Func::Atan2 | Func::Pow => Some(2),
            Func::User(u) => {
                if u.body.is_some() {
                    Some(u.params.len())
                } else {
                    // Checked against the module's definition at
                    // lowering time instead.
                    None
                }
            }
            _ => Some(1),
        }
    }

    /// Whether IR verification is skipped for functions containing this
    /// call. The two-argument `pow` intrinsic trips the verifier on some
    /// backends.
    pub fn disable_verify(&self) -> bool {
        matches!(self, Func::Pow)
    }
}

/// A named elementary function applied to an ordered sequence of
/// argument expressions.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    func: Func,
    args: Vec<Expression>,
}

/// Structural equality compares the canonical name and the argument
/// sequences pointwise.
impl PartialEq for FunctionCall {
    fn eq(&self, other: &Self) -> bool {
        self.func.name() == other.func.name() && self.args == other.args
    }
}

impl FunctionCall {
    pub fn new(func: Func, args: Vec<Expression>) -> Self {
        Self { func, args }
    }

    pub fn func(&self) -> &Func {
        &self.func
    }

    pub fn name(&self) -> &str {
        self.func.name()
    }

    pub fn display_name(&self) -> &str {
        self.func.display_name()
    }

    pub fn kind(&self) -> CallKind {
        self.func.kind()
    }

    pub fn attrs(&self) -> &'static [FnAttr] {
        self.func.attrs()
    }

    pub fn args(&self) -> &[Expression] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Expression> {
        &mut self.args
    }

    pub fn set_args(&mut self, args: Vec<Expression>) {
        self.args = args;
    }

    /// Clones the call with a different argument sequence.
    pub fn with_args(&self, args: Vec<Expression>) -> Self {
        Self {
            func: self.func.clone(),
            args,
        }
    }

    /// Consumes the call, returning its kind and argument sequence.
    pub fn into_parts(self) -> (Func, Vec<Expression>) {
        (self.func, self.args)
    }

    /// Verifies the argument count against the arity the kind expects.
    pub fn check_arity(&self) -> Result<(), ExprError> {
        if let Some(expected) = self.func.arity() {
            if self.args.len() != expected {
                return Err(ExprError::ArityMismatch {
                    name: self.display_name().to_string(),
                    expected,
                    got: self.args.len(),
                });
            }
        }
        Ok(())
    }

    /// Stateless numerical evaluation on already-computed argument
    /// values.
    pub fn eval_num(&self, vals: &[f64]) -> Result<f64, ExprError> {
        self.check_arity()?;
        if vals.len() != self.args.len() {
            return Err(ExprError::ArityMismatch {
                name: self.display_name().to_string(),
                expected: self.args.len(),
                got: vals.len(),
            });
        }
        match &self.func {
            Func::Sin => Ok(vals[0].sin()),
            Func::Cos => Ok(vals[0].cos()),
            Func::Tan => Ok(vals[0].tan()),
            Func::Asin => Ok(vals[0].asin()),
            Func::Acos => Ok(vals[0].acos()),
            Func::Atan => Ok(vals[0].atan()),
            Func::Atan2 => Ok(vals[0].atan2(vals[1])),
            Func::Pow => Ok(vals[0].powf(vals[1])),
            Func::Exp => Ok(vals[0].exp()),
            Func::Exp2 => Ok(vals[0].exp2()),
            Func::Log => Ok(vals[0].ln()),
            Func::Log2 => Ok(vals[0].log2()),
            Func::Log10 => Ok(vals[0].log10()),
            Func::Sqrt => Ok(vals[0].sqrt()),
            Func::Abs => Ok(vals[0].abs()),
            Func::User(u) => {
                let body = u
                    .body
                    .as_deref()
                    .ok_or_else(|| ExprError::OpaqueFunction(u.name.clone()))?;
                let env: HashMap<String, f64> = u
                    .params
                    .iter()
                    .cloned()
                    .zip(vals.iter().copied())
                    .collect();
                body.evaluate(&env)
            }
        }
    }

    /// Partial derivative `∂f/∂arg_i` at already-computed argument
    /// values.
    ///
    /// Registered for the same kinds that carry a symbolic rule.
    pub fn eval_num_partial(&self, vals: &[f64], i: usize) -> Result<f64, ExprError> {
        self.check_arity()?;
        if vals.len() != self.args.len() {
            return Err(ExprError::ArityMismatch {
                name: self.display_name().to_string(),
                expected: self.args.len(),
                got: vals.len(),
            });
        }
        if i >= self.args.len() {
            return Err(ExprError::ArityMismatch {
                name: self.display_name().to_string(),
                expected: self.args.len(),
                got: i + 1,
            });
        }
        match &self.func {
            Func::Sin => Ok(vals[0].cos()),
            Func::Cos => Ok(-vals[0].sin()),
            Func::Tan => {
                let c = vals[0].cos();
                Ok(1.0 / (c * c))
            }
            Func::Sqrt => Ok(0.5 / vals[0].sqrt()),
            Func::User(u) => {
                let body = u
                    .body
                    .as_deref()
                    .ok_or_else(|| ExprError::OpaqueFunction(u.name.clone()))?;
                let env: HashMap<String, f64> = u
                    .params
                    .iter()
                    .cloned()
                    .zip(vals.iter().copied())
                    .collect();
                body.diff(&u.params[i])?.evaluate(&env)
            }
            _ => Err(ExprError::NonDifferentiable(
                self.display_name().to_string(),
            )),
        }
    }

    /// Symbolic chain rule, delegating to the per-kind derivative.
    pub fn diff(&self, name: &str) -> Result<Expression, ExprError> {
        self.check_arity()?;
        match &self.func {
            Func::Sin => Ok(cos(self.args[0].clone()) * self.args[0].diff(name)?),
            Func::Cos => Ok(-sin(self.args[0].clone()) * self.args[0].diff(name)?),
            Func::Tan => {
                let c = cos(self.args[0].clone());
                Ok(Expression::from_number(1.0) / (c.clone() * c) * self.args[0].diff(name)?)
            }
            Func::Sqrt => Ok(Expression::from_number(0.5) / sqrt(self.args[0].clone())
                * self.args[0].diff(name)?),
            Func::User(u) => {
                let body = u
                    .body
                    .as_deref()
                    .ok_or_else(|| ExprError::NonDifferentiable(u.name.clone()))?;
                let bindings: HashMap<String, Expression> = u
                    .params
                    .iter()
                    .cloned()
                    .zip(self.args.iter().cloned())
                    .collect();
                let mut total = Expression::from_number(0.0);
                for (param, arg) in u.params.iter().zip(self.args.iter()) {
                    let partial = body.diff(param)?.substitute(&bindings);
                    total += partial * arg.diff(name)?;
                }
                Ok(total)
            }
            _ => Err(ExprError::NonDifferentiable(
                self.display_name().to_string(),
            )),
        }
    }

    /// Element-wise evaluation over columns; `out` is already sized.
    pub fn eval_batch(
        &self,
        env: &HashMap<String, Vec<f64>>,
        out: &mut [f64],
    ) -> Result<(), ExprError> {
        self.check_arity()?;
        if self.args.is_empty() {
            let value = self.eval_num(&[])?;
            out.fill(value);
            return Ok(());
        }
        // The first argument is computed straight into the output buffer
        // and the remaining ones into scratch columns.
        self.args[0].eval_batch_into(env, out)?;
        let mut rest: Vec<Vec<f64>> = Vec::with_capacity(self.args.len().saturating_sub(1));
        for arg in &self.args[1..] {
            let mut column = vec![0.0; out.len()];
            arg.eval_batch_into(env, &mut column)?;
            rest.push(column);
        }

        let mut row = vec![0.0; self.args.len()];
        for i in 0..out.len() {
            row[0] = out[i];
            for (k, column) in rest.iter().enumerate() {
                row[k + 1] = column[i];
            }
            out[i] = self.eval_num(&row)?;
        }
        Ok(())
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.display_name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

fn unary(func: Func, e: Expression) -> Expression {
    Expression::from_function(FunctionCall::new(func, vec![e]))
}

/// Sine (argument in radians).
pub fn sin(e: Expression) -> Expression {
    unary(Func::Sin, e)
}

/// Cosine (argument in radians).
pub fn cos(e: Expression) -> Expression {
    unary(Func::Cos, e)
}

/// Tangent, linked as an external host call.
pub fn tan(e: Expression) -> Expression {
    unary(Func::Tan, e)
}

/// Inverse sine, linked as an external host call.
pub fn asin(e: Expression) -> Expression {
    unary(Func::Asin, e)
}

/// Inverse cosine, linked as an external host call.
pub fn acos(e: Expression) -> Expression {
    unary(Func::Acos, e)
}

/// Inverse tangent, linked as an external host call.
pub fn atan(e: Expression) -> Expression {
    unary(Func::Atan, e)
}

/// Two-argument inverse tangent, linked as an external host call.
pub fn atan2(e1: Expression, e2: Expression) -> Expression {
    Expression::from_function(FunctionCall::new(Func::Atan2, vec![e1, e2]))
}

/// General power `e1 ^ e2`.
pub fn pow(e1: Expression, e2: Expression) -> Expression {
    Expression::from_function(FunctionCall::new(Func::Pow, vec![e1, e2]))
}

/// Natural exponential.
pub fn exp(e: Expression) -> Expression {
    unary(Func::Exp, e)
}

/// Base-2 exponential.
pub fn exp2(e: Expression) -> Expression {
    unary(Func::Exp2, e)
}

/// Natural logarithm.
pub fn log(e: Expression) -> Expression {
    unary(Func::Log, e)
}

/// Base-2 logarithm.
pub fn log2(e: Expression) -> Expression {
    unary(Func::Log2, e)
}

/// Base-10 logarithm.
pub fn log10(e: Expression) -> Expression {
    unary(Func::Log10, e)
}

/// Square root.
pub fn sqrt(e: Expression) -> Expression {
    unary(Func::Sqrt, e)
}

/// Absolute value.
pub fn abs(e: Expression) -> Expression {
    unary(Func::Abs, e)
}

/// A call to a function defined inside the JIT module.
///
/// The call is opaque outside the module: it can be lowered, but not
/// evaluated or differentiated, until a lift attaches the callee's body.
pub fn user(name: impl Into<String>, args: Vec<Expression>) -> Result<Expression, ExprError> {
    let name = name.into();
    check_symbol_name(&name)?;
    Ok(Expression::from_function(FunctionCall::new(
        Func::User(UserFunc {
            name,
            params: Vec::new(),
            body: None,
        }),
        args,
    )))
}

/// Builds a user call carrying the callee's parameter names and lifted
/// body, as produced by the IR-to-expression lift.
pub(crate) fn user_with_body(
    name: String,
    params: Vec<String>,
    body: Expression,
    args: Vec<Expression>,
) -> FunctionCall {
    FunctionCall::new(
        Func::User(UserFunc {
            name,
            params,
            body: Some(Box::new(body)),
        }),
        args,
    )
}

/// Host shims registered with the JIT so external and intrinsic calls
/// resolve to the platform math library.
pub(crate) mod host {
    pub extern "C" fn sin(x: f64) -> f64 {
        x.sin()
    }
    pub extern "C" fn cos(x: f64) -> f64 {
        x.cos()
    }
    pub extern "C" fn tan(x: f64) -> f64 {
        x.tan()
    }
    pub extern "C" fn asin(x: f64) -> f64 {
        x.asin()
    }
    pub extern "C" fn acos(x: f64) -> f64 {
        x.acos()
    }
    pub extern "C" fn atan(x: f64) -> f64 {
        x.atan()
    }
    pub extern "C" fn atan2(x: f64, y: f64) -> f64 {
        x.atan2(y)
    }
    pub extern "C" fn pow(x: f64, y: f64) -> f64 {
        x.powf(y)
    }
    pub extern "C" fn exp(x: f64) -> f64 {
        x.exp()
    }
    pub extern "C" fn exp2(x: f64) -> f64 {
        x.exp2()
    }
    pub extern "C" fn log(x: f64) -> f64 {
        x.ln()
    }
    pub extern "C" fn log2(x: f64) -> f64 {
        x.log2()
    }
    pub extern "C" fn log10(x: f64) -> f64 {
        x.log10()
    }
}

/// Symbols registered on the JIT builder at module creation.
pub(crate) fn host_symbols() -> Vec<(&'static str, *const u8)> {
    vec![
        ("sin", host::sin as *const u8),
        ("cos", host::cos as *const u8),
        ("tan", host::tan as *const u8),
        ("asin", host::asin as *const u8),
        ("acos", host::acos as *const u8),
        ("atan", host::atan as *const u8),
        ("atan2", host::atan2 as *const u8),
        ("pow", host::pow as *const u8),
        ("exp", host::exp as *const u8),
        ("exp2", host::exp2 as *const u8),
        ("log", host::log as *const u8),
        ("log2", host::log2 as *const u8),
        ("log10", host::log10 as *const u8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn var(name: &str) -> Expression {
        Expression::from_variable(name).unwrap()
    }

    #[test]
    fn test_eval_num() {
        let call = FunctionCall::new(Func::Sin, vec![var("x")]);
        assert_relative_eq!(call.eval_num(&[0.5]).unwrap(), 0.5f64.sin());

        let call = FunctionCall::new(Func::Pow, vec![var("x"), var("y")]);
        assert_relative_eq!(call.eval_num(&[2.0, 10.0]).unwrap(), 1024.0);

        let call = FunctionCall::new(Func::Log, vec![var("x")]);
        assert_relative_eq!(call.eval_num(&[1.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_eval_num_arity_mismatch() {
        let call = FunctionCall::new(Func::Sin, vec![var("x"), var("y")]);
        assert!(matches!(
            call.eval_num(&[1.0, 2.0]),
            Err(ExprError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn test_partials() {
        let call = FunctionCall::new(Func::Sin, vec![var("x")]);
        assert_relative_eq!(call.eval_num_partial(&[0.3], 0).unwrap(), 0.3f64.cos());

        let call = FunctionCall::new(Func::Cos, vec![var("x")]);
        assert_relative_eq!(call.eval_num_partial(&[0.3], 0).unwrap(), -(0.3f64.sin()));

        let call = FunctionCall::new(Func::Sqrt, vec![var("x")]);
        assert_relative_eq!(call.eval_num_partial(&[4.0], 0).unwrap(), 0.25);
    }

    #[test]
    fn test_diff_sin() {
        // d/dx sin(x) = cos(x)
        let d = sin(var("x")).diff("x").unwrap();
        assert_eq!(d, cos(var("x")));
    }

    #[test]
    fn test_diff_chain_rule() {
        // d/dx sin(x*y) = cos(x*y) * y
        let d = sin(var("x") * var("y")).diff("x").unwrap();
        assert_eq!(d, cos(var("x") * var("y")) * var("y"));
    }

    #[test]
    fn test_non_differentiable() {
        let err = atan(var("x")).diff("x").unwrap_err();
        assert!(matches!(err, ExprError::NonDifferentiable(_)));

        let err = pow(var("x"), var("y")).diff("x").unwrap_err();
        assert!(matches!(err, ExprError::NonDifferentiable(_)));
    }

    #[test]
    fn test_eval_batch_multi_arg() {
        let ex = atan2(var("y"), var("x"));
        let mut env = HashMap::new();
        env.insert("y".to_string(), vec![1.0, 0.0]);
        env.insert("x".to_string(), vec![1.0, 1.0]);

        let mut out = Vec::new();
        ex.evaluate_batch(&env, &mut out).unwrap();
        assert_relative_eq!(out[0], 1.0f64.atan2(1.0));
        assert_relative_eq!(out[1], 0.0);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(format!("{}", abs(var("x"))), "abs(x)");
        assert_eq!(
            format!("{}", pow(var("x"), Expression::from_number(2.0))),
            "pow(x,2)"
        );
    }

    #[test]
    fn test_structural_equality_by_name_and_args() {
        assert_eq!(sin(var("x")), sin(var("x")));
        assert_ne!(sin(var("x")), cos(var("x")));
        assert_ne!(sin(var("x")), sin(var("y")));
    }

    #[test]
    fn test_opaque_user_call() {
        let call = user("f", vec![var("x")]).unwrap();
        let c = call.as_call().unwrap();
        assert!(matches!(
            c.eval_num(&[1.0]),
            Err(ExprError::OpaqueFunction(_))
        ));
    }
}
