//! Symbolic-expression JIT and Taylor-integration kernel.
//!
//! This crate builds algebraic expression trees over named variables,
//! numeric literals, binary arithmetic operators and a fixed vocabulary
//! of elementary functions, and compiles them to native machine code
//! using [Cranelift](https://cranelift.dev). From one expression tree it
//! provides:
//!
//! - native entry points in three shapes (one `f64` per variable, packed
//!   pointer, batched pointer pair);
//! - a symbolic derivative with respect to any named variable;
//! - a reverse-mode numerical gradient in a single forward/backward
//!   sweep;
//! - a Taylor-series integrator that, given a system of first-order ODEs
//!   `ẋᵢ = fᵢ(x)`, emits native code advancing the state by one step of
//!   arbitrary chosen order.
//!
//! # Example
//!
//! ```no_run
//! use symjit::prelude::*;
//!
//! # fn main() -> Result<(), symjit::CodegenError> {
//! let x = Expression::from_variable("x")?;
//! let y = Expression::from_variable("y")?;
//! let e = x.clone() * x + Expression::from_number(2.0) * y;
//!
//! let mut cg = CodeGen::new("my module", OptLevel::O3)?;
//! cg.add_expression("f", &e, 0)?;
//! cg.compile()?;
//!
//! let f = cg.fetch("f")?;
//! let args = [3.0, 1.0];
//! let value = unsafe { f(args.as_ptr()) }; // 3*3 + 2*1 = 11
//! # let _ = value;
//! # Ok(())
//! # }
//! ```
//!
//! # Safety
//!
//! Compiled entry points are raw `extern "C"` function pointers; calling
//! one is `unsafe` and requires the argument arrays to be large enough
//! and to stay valid for the duration of the call.

pub use codegen::{CodeGen, OptLevel};
pub use errors::{CodegenError, ExprError};
pub use expr::{BinaryOp, BinaryOperator, Expression, Number, Variable};
pub use math::{Func, FunctionCall};
pub use taylor::taylor_decompose;

pub mod prelude {
    pub use crate::autodiff::{connections, gradient, node_values};
    pub use crate::codegen::{CodeGen, OptLevel};
    pub use crate::errors::{CodegenError, ExprError};
    pub use crate::expr::{BinaryOp, BinaryOperator, Expression, Number, Variable};
    pub use crate::math::{
        abs, acos, asin, atan, atan2, cos, exp, exp2, log, log10, log2, pow, sin, sqrt, tan,
    };
    pub use crate::taylor::taylor_decompose;
    pub use crate::types::{BatchFn, PackedFn, TaylorFn, VarargFn};
}

/// Reverse-mode automatic differentiation over expression trees
pub mod autodiff;
/// Lowering of expressions into the JIT module and symbol resolution
pub mod codegen;
/// Error types for tree construction, evaluation and code generation
pub mod errors;
/// Expression tree representation, simplification and evaluation
pub mod expr;
/// The library of elementary functions and the function-call node
pub mod math;
/// Taylor decomposition of ODE systems and stepper emission
pub mod taylor;
/// Function-pointer types at the JIT boundary
pub mod types;
