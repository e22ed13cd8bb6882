//! Expression trees for representing mathematical expressions.
//!
//! This module defines the core expression types used to represent
//! real-valued algebraic expressions in a form that supports JIT
//! compilation, symbolic differentiation and numerical evaluation. The
//! main types are:
//!
//! - [`Expression`]: a tagged variant over the four node kinds
//! - [`Number`]: an immutable double-precision constant
//! - [`Variable`]: a named reference by string identifier
//! - [`BinaryOperator`]: one of `+ - * /` over two child expressions
//!
//! Function-call nodes live in [`crate::math`] together with the library
//! of elementary functions.
//!
//! Expressions own their subtrees exclusively: cloning deep-copies, there
//! is no sharing and cycles are impossible by construction.
//!
//! # Simplification
//!
//! The arithmetic operator overloads apply a fixed set of peephole rules
//! on construction. They fire only when one or both operands are numbers:
//!
//! - constant folding of arithmetic on two numbers
//! - `n + 0 → n`, `0 + n → n`
//! - `n - 0 → n`, `0 - n → -n`
//! - `n * 0 → 0`, `0 * n → 0`, `n * 1 → n`, `1 * n → n`
//! - `n / 1 → n`, `n / -1 → -n`
//! - `n / k → n * (1/k)` for a non-zero, non-`±1` number `k`
//!
//! No deeper algebraic identities are recognised.
//!
//! # Symbolic differentiation
//!
//! [`Expression::diff`] applies the usual sum, difference, product and
//! quotient rules; function calls delegate to their per-kind chain rule.
//! Since every derivative is rebuilt through the simplifying operators,
//! constants fold automatically.

use std::collections::HashMap;
use std::fmt;
use std::ops;

use crate::errors::ExprError;
use crate::math::FunctionCall;

/// Checks that a user-chosen identifier is usable as a variable or symbol
/// name: non-empty and free of the reserved `.` character.
pub(crate) fn check_symbol_name(name: &str) -> Result<(), ExprError> {
    if name.is_empty() || name.contains('.') {
        return Err(ExprError::InvalidSymbolName(name.to_string()));
    }
    Ok(())
}

/// An immutable double-precision constant leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Number {
    value: f64,
}

impl Number {
    pub fn new(value: f64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A named variable leaf.
///
/// Two variables are equal iff their names match exactly. Names must be
/// non-empty identifiers without a `.` character; the rule is re-checked
/// by every mutator.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
}

impl Variable {
    /// Creates a variable, validating the identifier rule.
    pub fn new(name: impl Into<String>) -> Result<Self, ExprError> {
        let name = name.into();
        check_symbol_name(&name)?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the variable, re-validating the identifier rule.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), ExprError> {
        let name = name.into();
        check_symbol_name(&name)?;
        self.name = name;
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The four arithmetic operators a binary node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// The operator's source character.
    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }

    /// Applies the operator to two scalars.
    pub(crate) fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
        }
    }
}

impl TryFrom<char> for BinaryOp {
    type Error = ExprError;

    fn try_from(op: char) -> Result<Self, ExprError> {
        match op {
            '+' => Ok(BinaryOp::Add),
            '-' => Ok(BinaryOp::Sub),
            '*' => Ok(BinaryOp::Mul),
            '/' => Ok(BinaryOp::Div),
            _ => Err(ExprError::InvalidOperator(op)),
        }
    }
}

/// An inner node applying one of `+ - * /` to two child expressions.
///
/// The node exclusively owns its children. Constructing one directly does
/// not simplify; the operator overloads on [`Expression`] do.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOperator {
    op: BinaryOp,
    lhs: Box<Expression>,
    rhs: Box<Expression>,
}

impl BinaryOperator {
    /// Creates a binary node from its source character, failing on any
    /// operator outside `{+, -, *, /}`.
    pub fn new(op: char, lhs: Expression, rhs: Expression) -> Result<Self, ExprError> {
        Ok(Self::with_op(BinaryOp::try_from(op)?, lhs, rhs))
    }

    /// Creates a binary node from an already-typed operator.
    pub fn with_op(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Self {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn op(&self) -> BinaryOp {
        self.op
    }

    pub fn lhs(&self) -> &Expression {
        &self.lhs
    }

    pub fn rhs(&self) -> &Expression {
        &self.rhs
    }

    pub fn lhs_mut(&mut self) -> &mut Expression {
        &mut self.lhs
    }

    pub fn rhs_mut(&mut self) -> &mut Expression {
        &mut self.rhs
    }

    pub fn set_lhs(&mut self, e: Expression) {
        *self.lhs = e;
    }

    pub fn set_rhs(&mut self, e: Expression) {
        *self.rhs = e;
    }

    /// Consumes the node, returning the operator and both children.
    pub fn into_parts(self) -> (BinaryOp, Expression, Expression) {
        (self.op, *self.lhs, *self.rhs)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.lhs, self.op.symbol(), self.rhs)
    }
}

/// Linear operation produced by flattening an expression tree.
///
/// The code generator consumes this instead of walking the tree
/// recursively: a post-order pass turns the tree into a stack program,
/// which is then replayed against an SSA value stack.
#[derive(Debug)]
pub(crate) enum LinearOp<'a> {
    /// Push a constant.
    Const(f64),
    /// Push the value bound to a variable name.
    Load(&'a str),
    /// Pop two values, push the result of the operator.
    Binary(BinaryOp),
    /// Pop the call's arguments, push the call result.
    Call(&'a FunctionCall),
}

/// An owning algebraic expression tree.
///
/// Exactly one of the four node kinds. Value semantics: cloning
/// deep-copies the whole tree, moving transfers ownership. An expression
/// is always non-empty after construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Number(Number),
    Variable(Variable),
    Binary(BinaryOperator),
    Call(FunctionCall),
}

impl Expression {
    /// Creates a constant expression.
    pub fn from_number(value: f64) -> Self {
        Expression::Number(Number::new(value))
    }

    /// Creates a variable expression, validating the identifier rule.
    pub fn from_variable(name: impl Into<String>) -> Result<Self, ExprError> {
        Ok(Expression::Variable(Variable::new(name)?))
    }

    /// Wraps a function call into an expression.
    pub fn from_function(call: FunctionCall) -> Self {
        Expression::Call(call)
    }

    /// Typed peek into a constant node.
    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Expression::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Typed peek into a variable node.
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Expression::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Typed peek into a binary-operator node.
    pub fn as_binary(&self) -> Option<&BinaryOperator> {
        match self {
            Expression::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Typed peek into a function-call node.
    pub fn as_call(&self) -> Option<&FunctionCall> {
        match self {
            Expression::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_number_mut(&mut self) -> Option<&mut Number> {
        match self {
            Expression::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut Variable> {
        match self {
            Expression::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary_mut(&mut self) -> Option<&mut BinaryOperator> {
        match self {
            Expression::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_call_mut(&mut self) -> Option<&mut FunctionCall> {
        match self {
            Expression::Call(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the nodes of the tree in post-order (children before
    /// parents, left to right), using an explicit work stack so deep
    /// trees cannot overflow the call stack.
    pub(crate) fn post_order(&self) -> Vec<&Expression> {
        let mut work = vec![self];
        let mut out = Vec::new();
        while let Some(node) = work.pop() {
            out.push(node);
            match node {
                Expression::Binary(b) => {
                    work.push(b.lhs());
                    work.push(b.rhs());
                }
                Expression::Call(c) => {
                    for arg in c.args() {
                        work.push(arg);
                    }
                }
                Expression::Number(_) | Expression::Variable(_) => {}
            }
        }
        out.reverse();
        out
    }

    /// Flattens the tree into a linear stack program for the code
    /// generator.
    pub(crate) fn flatten(&self) -> Vec<LinearOp<'_>> {
        self.post_order()
            .into_iter()
            .map(|node| match node {
                Expression::Number(n) => LinearOp::Const(n.value()),
                Expression::Variable(v) => LinearOp::Load(v.name()),
                Expression::Binary(b) => LinearOp::Binary(b.op()),
                Expression::Call(c) => LinearOp::Call(c),
            })
            .collect()
    }

    /// Evaluates the tree against an environment mapping variable names
    /// to values.
    ///
    /// Fails with [`ExprError::UndefinedVariable`] when a variable read
    /// finds no binding; binary and function nodes delegate to their
    /// children without pre-validation.
    pub fn evaluate(&self, env: &HashMap<String, f64>) -> Result<f64, ExprError> {
        let mut values: Vec<f64> = Vec::new();
        for node in self.post_order() {
            match node {
                Expression::Number(n) => values.push(n.value()),
                Expression::Variable(v) => match env.get(v.name()) {
                    Some(&x) => values.push(x),
                    None => return Err(ExprError::UndefinedVariable(v.name().to_string())),
                },
                Expression::Binary(b) => {
                    let rhs = values.pop().unwrap();
                    let lhs = values.pop().unwrap();
                    values.push(b.op().apply(lhs, rhs));
                }
                Expression::Call(c) => {
                    let split = values.len() - c.args().len();
                    let args = values.split_off(split);
                    values.push(c.eval_num(&args)?);
                }
            }
        }
        Ok(values.pop().unwrap())
    }

    /// Evaluates the tree element-wise over columns of inputs.
    ///
    /// `out[i]` receives the value of the tree at row `i`. A variable
    /// absent from `env` yields a column of zeros; `out` is resized to
    /// the common column length. Columns of unequal length fail with
    /// [`ExprError::BatchShapeMismatch`].
    pub fn evaluate_batch(
        &self,
        env: &HashMap<String, Vec<f64>>,
        out: &mut Vec<f64>,
    ) -> Result<(), ExprError> {
        let len = env.values().next().map(Vec::len).unwrap_or(0);
        for column in env.values() {
            if column.len() != len {
                return Err(ExprError::BatchShapeMismatch {
                    expected: len,
                    got: column.len(),
                });
            }
        }
        out.clear();
        out.resize(len, 0.0);
        self.eval_batch_into(env, out)
    }

    /// Inner batched evaluator; `out` is already sized.
    pub(crate) fn eval_batch_into(
        &self,
        env: &HashMap<String, Vec<f64>>,
        out: &mut [f64],
    ) -> Result<(), ExprError> {
        match self {
            Expression::Number(n) => {
                out.fill(n.value());
                Ok(())
            }
            Expression::Variable(v) => {
                match env.get(v.name()) {
                    Some(column) => out.copy_from_slice(column),
                    // Missing variables read as a zero column in the
                    // batched form.
                    None => out.fill(0.0),
                }
                Ok(())
            }
            Expression::Binary(b) => {
                let mut tmp = vec![0.0; out.len()];
                b.lhs().eval_batch_into(env, out)?;
                b.rhs().eval_batch_into(env, &mut tmp)?;
                let op = b.op();
                for (o, t) in out.iter_mut().zip(tmp.iter()) {
                    *o = op.apply(*o, *t);
                }
                Ok(())
            }
            Expression::Call(c) => c.eval_batch(env, out),
        }
    }

    /// Symbolic derivative with respect to the named variable.
    ///
    /// Applies the differentiation rules node by node:
    ///
    /// - `d/dx c = 0`, `d/dx x = 1`, `d/dx y = 0`
    /// - `(a + b)' = a' + b'` and `(a - b)' = a' - b'`
    /// - `(a * b)' = a'*b + a*b'`
    /// - `(a / b)' = (a'*b - a*b') / (b*b)`
    /// - function calls delegate to their chain rule, failing with
    ///   [`ExprError::NonDifferentiable`] when none is registered
    pub fn diff(&self, name: &str) -> Result<Expression, ExprError> {
        match self {
            Expression::Number(_) => Ok(Expression::from_number(0.0)),
            Expression::Variable(v) => Ok(Expression::from_number(if v.name() == name {
                1.0
            } else {
                0.0
            })),
            Expression::Binary(b) => {
                let lhs = b.lhs();
                let rhs = b.rhs();
                match b.op() {
                    BinaryOp::Add => Ok(lhs.diff(name)? + rhs.diff(name)?),
                    BinaryOp::Sub => Ok(lhs.diff(name)? - rhs.diff(name)?),
                    BinaryOp::Mul => {
                        Ok(lhs.diff(name)? * rhs.clone() + lhs.clone() * rhs.diff(name)?)
                    }
                    BinaryOp::Div => Ok((lhs.diff(name)? * rhs.clone()
                        - lhs.clone() * rhs.diff(name)?)
                        / (rhs.clone() * rhs.clone())),
                }
            }
            Expression::Call(c) => c.diff(name),
        }
    }

    /// Free variables referenced anywhere in the tree, sorted and
    /// deduplicated.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .post_order()
            .into_iter()
            .filter_map(|node| match node {
                Expression::Variable(v) => Some(v.name().to_string()),
                _ => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Reverse-mode numerical gradient at the given point, computed over
    /// the tree in a single forward/backward sweep.
    ///
    /// Convenience wrapper over [`crate::autodiff`].
    pub fn gradient(&self, env: &HashMap<String, f64>) -> Result<HashMap<String, f64>, ExprError> {
        let connections = crate::autodiff::connections(self);
        crate::autodiff::gradient(self, env, &connections)
    }

    /// Rebuilds the tree with every variable in `map` replaced by its
    /// mapped expression. Variables outside the map are kept.
    pub fn substitute(&self, map: &HashMap<String, Expression>) -> Expression {
        match self {
            Expression::Number(_) => self.clone(),
            Expression::Variable(v) => match map.get(v.name()) {
                Some(replacement) => replacement.clone(),
                None => self.clone(),
            },
            Expression::Binary(b) => Expression::Binary(BinaryOperator::with_op(
                b.op(),
                b.lhs().substitute(map),
                b.rhs().substitute(map),
            )),
            Expression::Call(c) => Expression::Call(c.with_args(
                c.args().iter().map(|arg| arg.substitute(map)).collect(),
            )),
        }
    }
}

impl From<Number> for Expression {
    fn from(n: Number) -> Self {
        Expression::Number(n)
    }
}

impl From<Variable> for Expression {
    fn from(v: Variable) -> Self {
        Expression::Variable(v)
    }
}

impl From<BinaryOperator> for Expression {
    fn from(b: BinaryOperator) -> Self {
        Expression::Binary(b)
    }
}

impl From<FunctionCall> for Expression {
    fn from(c: FunctionCall) -> Self {
        Expression::Call(c)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Number(n) => n.fmt(f),
            Expression::Variable(v) => v.fmt(f),
            Expression::Binary(b) => b.fmt(f),
            Expression::Call(c) => c.fmt(f),
        }
    }
}

fn number_value(e: &Expression) -> Option<f64> {
    e.as_number().map(Number::value)
}

impl ops::Add for Expression {
    type Output = Expression;

    fn add(self, rhs: Expression) -> Expression {
        match (number_value(&self), number_value(&rhs)) {
            (Some(a), Some(b)) => Expression::from_number(a + b),
            (_, Some(b)) if b == 0.0 => self,
            (Some(a), _) if a == 0.0 => rhs,
            _ => Expression::Binary(BinaryOperator::with_op(BinaryOp::Add, self, rhs)),
        }
    }
}

impl ops::Sub for Expression {
    type Output = Expression;

    fn sub(self, rhs: Expression) -> Expression {
        match (number_value(&self), number_value(&rhs)) {
            (Some(a), Some(b)) => Expression::from_number(a - b),
            (_, Some(b)) if b == 0.0 => self,
            (Some(a), _) if a == 0.0 => -rhs,
            _ => Expression::Binary(BinaryOperator::with_op(BinaryOp::Sub, self, rhs)),
        }
    }
}

impl ops::Mul for Expression {
    type Output = Expression;

    fn mul(self, rhs: Expression) -> Expression {
        match (number_value(&self), number_value(&rhs)) {
            (Some(a), Some(b)) => Expression::from_number(a * b),
            (Some(a), _) if a == 0.0 => Expression::from_number(0.0),
            (_, Some(b)) if b == 0.0 => Expression::from_number(0.0),
            (Some(a), _) if a == 1.0 => rhs,
            (_, Some(b)) if b == 1.0 => self,
            _ => Expression::Binary(BinaryOperator::with_op(BinaryOp::Mul, self, rhs)),
        }
    }
}

impl ops::Div for Expression {
    type Output = Expression;

    fn div(self, rhs: Expression) -> Expression {
        match (number_value(&self), number_value(&rhs)) {
            (Some(a), Some(b)) => Expression::from_number(a / b),
            (_, Some(b)) if b == 1.0 => self,
            (_, Some(b)) if b == -1.0 => -self,
            // Division by a constant becomes multiplication by its
            // reciprocal.
            (_, Some(b)) if b != 0.0 => self * Expression::from_number(1.0 / b),
            _ => Expression::Binary(BinaryOperator::with_op(BinaryOp::Div, self, rhs)),
        }
    }
}

impl ops::Neg for Expression {
    type Output = Expression;

    fn neg(self) -> Expression {
        Expression::from_number(-1.0) * self
    }
}

impl ops::AddAssign for Expression {
    fn add_assign(&mut self, rhs: Expression) {
        let lhs = std::mem::replace(self, Expression::from_number(0.0));
        *self = lhs + rhs;
    }
}

impl ops::SubAssign for Expression {
    fn sub_assign(&mut self, rhs: Expression) {
        let lhs = std::mem::replace(self, Expression::from_number(0.0));
        *self = lhs - rhs;
    }
}

impl ops::MulAssign for Expression {
    fn mul_assign(&mut self, rhs: Expression) {
        let lhs = std::mem::replace(self, Expression::from_number(0.0));
        *self = lhs * rhs;
    }
}

impl ops::DivAssign for Expression {
    fn div_assign(&mut self, rhs: Expression) {
        let lhs = std::mem::replace(self, Expression::from_number(0.0));
        *self = lhs / rhs;
    }
}
