//! Error types for the symjit crate.
//!
//! Two layers mirror the two halves of the crate:
//!
//! - [`ExprError`]: failures while building, evaluating or differentiating
//!   expression trees.
//! - [`CodegenError`]: failures while lowering expressions into the JIT
//!   module, including Taylor-system emission. Wraps `ExprError` and the
//!   Cranelift module errors it can run into.
//!
//! Every error aborts the enclosing operation; there is no retry or
//! recovery, callers re-issue the operation with corrected input.

use cranelift_module::ModuleError;
use thiserror::Error;

/// Errors produced by the expression algebra.
#[derive(Error, Debug)]
pub enum ExprError {
    /// A binary node was constructed with an operator outside `{+, -, *, /}`.
    #[error("invalid binary operator: '{0}'")]
    InvalidOperator(char),
    /// A variable or symbol name is empty or contains a forbidden character.
    #[error("invalid symbol name '{0}' (the name must be non-empty and cannot contain the '.' character)")]
    InvalidSymbolName(String),
    /// Scalar evaluation reached a variable absent from the environment.
    #[error("undefined variable: '{0}'")]
    UndefinedVariable(String),
    /// Differentiation reached a function with no derivative rule.
    #[error("the derivative has not been implemented for the function '{0}'")]
    NonDifferentiable(String),
    /// A function call carries the wrong number of arguments.
    #[error("incorrect number of arguments in a call to '{name}': {expected} expected, but {got} were provided")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    /// Batched evaluation received input columns of unequal length.
    #[error("batched input columns have inconsistent lengths: expected {expected}, got {got}")]
    BatchShapeMismatch { expected: usize, got: usize },
    /// A user-function call without an attached body was evaluated or
    /// differentiated outside the JIT.
    #[error("the user function '{0}' has no body available outside the JIT module")]
    OpaqueFunction(String),
}

/// Errors produced by the JIT code generator and the Taylor subsystem.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// Error bubbled up from the expression algebra.
    #[error(transparent)]
    Expr(#[from] ExprError),
    /// Error from the Cranelift module (declaration, definition, linkage).
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
    /// The host machine is not supported by the Cranelift backend.
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// A definition with this name already exists in the module.
    #[error("the name '{0}' already exists in the module")]
    NameCollision(String),
    /// An intrinsic name could not be resolved to a known builtin.
    #[error("cannot fetch the ID of the intrinsic '{0}'")]
    UnknownIntrinsic(String),
    /// A referenced function is absent from the module, or empty.
    #[error("unknown function referenced: '{0}'")]
    UnknownFunction(String),
    /// IR verification rejected an emitted function.
    #[error("function verification failed. The full error message:\n{0}")]
    VerifyFailed(String),
    /// The free-variable count exceeds 32-bit addressing.
    #[error("the number of variables in an expression, {0}, is too large")]
    TooManyVariables(usize),
    /// `n_uvars * max_order` does not fit in 32 bits.
    #[error("an overflow condition was detected in the number of Taylor variables")]
    OrderOverflow,
    /// `add_taylor` was invoked with a zero maximum order.
    #[error("the maximum Taylor order cannot be zero")]
    InvalidMaxOrder,
    /// The Taylor system's variable count differs from its equation count.
    #[error("the number of variables in a Taylor system, {n_vars}, differs from the number of equations, {n_eqs}")]
    SystemArityMismatch { n_vars: usize, n_eqs: usize },
    /// Taylor lowering met an operand shape it cannot emit.
    #[error("unsupported expression in Taylor lowering: {0}")]
    LowerUnsupported(String),
    /// A mutating operation was attempted after `compile()`.
    #[error("the module has already been compiled")]
    ModuleCompiled,
    /// IR-to-expression lifting met an instruction it cannot translate.
    #[error("unable to convert IR to an expression: {0}")]
    LiftUnsupported(String),
}
