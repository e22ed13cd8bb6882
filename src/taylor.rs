//! Taylor-series integration of ODE systems.
//!
//! Given a system `ẋᵢ = fᵢ(x)` of first-order ODEs as expression trees,
//! this module emits a native stepper advancing the state by one step of
//! chosen order. Two phases:
//!
//! 1. **Decomposition** ([`taylor_decompose`]): the right-hand sides are
//!    rewritten into a straight-line sequence of elementary assignments
//!    `u_k = op(u_i, u_j)` over fresh *u-variables*. The result has the
//!    layout `[state vars, auxiliary definitions, rhs references]`.
//! 2. **Emission** ([`CodeGen::add_taylor`]): one helper function per
//!    u-variable computes its order-`k` *normalised* derivative (the
//!    `k`-th time derivative divided by `k!`) from the previous rows of
//!    a flat derivatives array; the exported step function fills the
//!    array row by row and accumulates the Taylor polynomial into the
//!    state.
//!
//! Supported elementary operations inside a decomposed system are the
//! four arithmetic operators over variable/number operands, `exp`, and
//! the `sin`/`cos` pair (the decomposer appends the partner series so
//! both recurrences have their inputs). Anything else fails with
//! [`CodegenError::LowerUnsupported`].

use std::collections::HashMap;

use cranelift::prelude::{
    types, AbiParam, FunctionBuilder, FunctionBuilderContext, InstBuilder, IntCC, MemFlags,
    StackSlotData, StackSlotKind, Value,
};
use cranelift_codegen::ir::{immediates::Offset32, Signature, Type};
use cranelift_module::{FuncId, Linkage, Module};

use crate::codegen::{CodeGen, SymbolInfo};
use crate::errors::CodegenError;
use crate::expr::{check_symbol_name, BinaryOp, BinaryOperator, Expression};
use crate::math::{Func, FunctionCall};

/// Parses the index out of a `u_<n>` variable name.
fn uname_to_index(name: &str) -> Result<u32, CodegenError> {
    name.strip_prefix("u_")
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| {
            CodegenError::LowerUnsupported(format!(
                "invalid variable name '{name}' (the name must be in the form 'u_n', \
                 where n is a non-negative integer)"
            ))
        })
}

fn u_var(idx: usize) -> Result<Expression, CodegenError> {
    Ok(Expression::from_variable(format!("u_{idx}"))?)
}

/// Rewrites a system of ODE right-hand sides into elementary
/// assignments.
///
/// The free variables of the system are collected, sorted and renamed to
/// `u_0 … u_{n-1}`; every compound subexpression is then replaced
/// post-order by a fresh u-variable whose definition is appended. The
/// returned vector has layout
/// `[state₀…state_{n-1}, aux_n…aux_{M-1}, rhs₀…rhs_{n-1}]`, where each
/// rhs entry is a variable or a number.
///
/// Fails with [`CodegenError::SystemArityMismatch`] when the variable
/// count differs from the equation count.
pub fn taylor_decompose(sys: Vec<Expression>) -> Result<Vec<Expression>, CodegenError> {
    let n_eq = sys.len();

    let mut vars: Vec<String> = sys.iter().flat_map(|e| e.variables()).collect();
    vars.sort();
    vars.dedup();
    if vars.len() != n_eq {
        return Err(CodegenError::SystemArityMismatch {
            n_vars: vars.len(),
            n_eqs: n_eq,
        });
    }

    // Rename the state variables to u_0 … u_{n-1} in sorted order.
    let mut renames: HashMap<String, Expression> = HashMap::new();
    for (i, name) in vars.iter().enumerate() {
        renames.insert(name.clone(), u_var(i)?);
    }

    let mut u: Vec<Expression> = Vec::with_capacity(2 * n_eq);
    for i in 0..n_eq {
        u.push(u_var(i)?);
    }

    let mut rhs = Vec::with_capacity(n_eq);
    for eq in &sys {
        let renamed = eq.substitute(&renames);
        rhs.push(decompose_node(renamed, &mut u)?);
    }
    u.extend(rhs);
    Ok(u)
}

/// Post-order decomposition of one node: leaves pass through, compound
/// nodes are appended to `u` and replaced by a fresh u-variable.
fn decompose_node(e: Expression, u: &mut Vec<Expression>) -> Result<Expression, CodegenError> {
    match e {
        Expression::Number(_) | Expression::Variable(_) => Ok(e),
        Expression::Binary(b) => {
            let (op, lhs, rhs) = b.into_parts();
            let lhs = decompose_node(lhs, u)?;
            let rhs = decompose_node(rhs, u)?;
            u.push(Expression::Binary(BinaryOperator::with_op(op, lhs, rhs)));
            u_var(u.len() - 1)
        }
        Expression::Call(c) => {
            let (func, args) = c.into_parts();
            let args: Vec<Expression> = args
                .into_iter()
                .map(|arg| decompose_node(arg, u))
                .collect::<Result<_, _>>()?;
            match func {
                // The sine and cosine recurrences consume each other's
                // rows, so the partner series is decomposed alongside.
                Func::Sin => {
                    let idx = u.len();
                    u.push(Expression::from_function(FunctionCall::new(
                        Func::Sin,
                        args.clone(),
                    )));
                    u.push(Expression::from_function(FunctionCall::new(Func::Cos, args)));
                    u_var(idx)
                }
                Func::Cos => {
                    let idx = u.len();
                    u.push(Expression::from_function(FunctionCall::new(
                        Func::Cos,
                        args.clone(),
                    )));
                    u.push(Expression::from_function(FunctionCall::new(Func::Sin, args)));
                    u_var(idx)
                }
                other => {
                    u.push(Expression::from_function(FunctionCall::new(other, args)));
                    u_var(u.len() - 1)
                }
            }
        }
    }
}

/// Operand of an elementary Taylor assignment: a literal number or the
/// index of a u-variable.
#[derive(Debug, Clone, Copy)]
enum Operand {
    Num(f64),
    Var(u32),
}

fn classify(e: &Expression) -> Result<Operand, CodegenError> {
    match e {
        Expression::Number(n) => Ok(Operand::Num(n.value())),
        Expression::Variable(v) => Ok(Operand::Var(uname_to_index(v.name())?)),
        other => Err(CodegenError::LowerUnsupported(format!(
            "the expression '{other}' is not a legal Taylor operand \
             (it must be either a variable or a number)"
        ))),
    }
}

/// Searches the auxiliary range of a decomposition for a structurally
/// equal entry.
fn find_aux(dc: &[Expression], range: std::ops::Range<usize>, target: &Expression) -> Option<u32> {
    dc[range.clone()]
        .iter()
        .position(|e| e == target)
        .map(|offset| (range.start + offset) as u32)
}

/// Emission state shared by the derivative helpers of one stepper.
struct TaylorEmitter<'a> {
    cg: &'a mut CodeGen,
    n_uvars: u32,
    ptr_type: Type,
}

impl TaylorEmitter<'_> {
    fn helper_signature(&mut self) -> Signature {
        let mut sig = self.cg.module.make_signature();
        sig.params.push(AbiParam::new(self.ptr_type));
        sig.params.push(AbiParam::new(types::I32));
        sig.returns.push(AbiParam::new(types::F64));
        sig
    }

    /// Loads `diff[row * n_uvars + col]`.
    fn load_diff(
        &self,
        builder: &mut FunctionBuilder,
        diff_ptr: Value,
        row: Value,
        col: u32,
    ) -> Value {
        let base = builder.ins().imul_imm(row, self.n_uvars as i64);
        let lin = builder.ins().iadd_imm(base, col as i64);
        self.load_diff_lin(builder, diff_ptr, lin)
    }

    /// Loads `diff[lin]` for an already-linearised i32 index.
    fn load_diff_lin(&self, builder: &mut FunctionBuilder, diff_ptr: Value, lin: Value) -> Value {
        let wide = builder.ins().uextend(self.ptr_type, lin);
        let offset = builder.ins().imul_imm(wide, 8);
        let addr = builder.ins().iadd(diff_ptr, offset);
        builder
            .ins()
            .load(types::F64, MemFlags::trusted(), addr, Offset32::new(0))
    }

    /// Emits a counted accumulation loop over `j` in `[start, order]`,
    /// threading an `f64` accumulator through a block parameter.
    fn emit_sum_loop(
        &self,
        builder: &mut FunctionBuilder,
        start: i64,
        order: Value,
        mut body: impl FnMut(&mut FunctionBuilder, Value, Value) -> Value,
    ) -> Value {
        let header = builder.create_block();
        builder.append_block_param(header, types::I32);
        builder.append_block_param(header, types::F64);
        let loop_body = builder.create_block();
        let after = builder.create_block();

        let j0 = builder.ins().iconst(types::I32, start);
        let acc0 = builder.ins().f64const(0.0);
        builder.ins().jump(header, &[j0, acc0]);

        builder.switch_to_block(header);
        let j = builder.block_params(header)[0];
        let acc = builder.block_params(header)[1];
        let cond = builder
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, j, order);
        builder.ins().brif(cond, loop_body, &[], after, &[]);

        builder.switch_to_block(loop_body);
        let acc_next = body(builder, j, acc);
        let j_next = builder.ins().iadd_imm(j, 1);
        builder.ins().jump(header, &[j_next, acc_next]);

        builder.switch_to_block(after);
        acc
    }

    /// Declares, builds and defines one derivative helper. The body
    /// callback receives `(builder, diff_ptr, order)` and returns the
    /// helper's return value.
    fn emit_helper(
        &mut self,
        fname: &str,
        build: impl FnOnce(&mut Self, &mut FunctionBuilder, Value, Value) -> Value,
    ) -> Result<FuncId, CodegenError> {
        let sig = self.helper_signature();
        let id = self.cg.declare_local(fname, &sig, Linkage::Local)?;

        let mut ctx = self.cg.module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let diff_ptr = builder.block_params(entry)[0];
        let order = builder.block_params(entry)[1];

        let ret = build(self, &mut builder, diff_ptr, order);
        builder.ins().return_(&[ret]);
        builder.seal_all_blocks();
        builder.finalize();

        self.cg.define(fname, Vec::new(), id, ctx, false)?;
        Ok(id)
    }

    /// Normalised derivative of a state variable whose first derivative
    /// is the u-variable `u_idx`:
    /// `d_k(x) = diff[k-1, u_idx] / k`.
    fn sv_diff_var(&mut self, fname: &str, u_idx: u32) -> Result<FuncId, CodegenError> {
        self.emit_helper(fname, |em, builder, diff_ptr, order| {
            let row = builder.ins().iadd_imm(order, -1);
            let value = em.load_diff(builder, diff_ptr, row, u_idx);
            let order_f = builder.ins().fcvt_from_uint(types::F64, order);
            builder.ins().fdiv(value, order_f)
        })
    }

    /// Normalised derivative of a state variable whose first derivative
    /// is the literal number `c`: `c` at order 1, zero above.
    fn sv_diff_num(&mut self, fname: &str, c: f64) -> Result<FuncId, CodegenError> {
        self.emit_helper(fname, |_, builder, _diff_ptr, order| {
            let is_first = builder.ins().icmp_imm(IntCC::Equal, order, 1);
            let constant = builder.ins().f64const(c);
            let zero = builder.ins().f64const(0.0);
            builder.ins().select(is_first, constant, zero)
        })
    }

    /// Derivative helper for one auxiliary assignment `dc[slot]`.
    fn aux_diff(
        &mut self,
        fname: &str,
        dc: &[Expression],
        n_eq: usize,
        slot: usize,
    ) -> Result<FuncId, CodegenError> {
        match &dc[slot] {
            Expression::Binary(b) => {
                let lhs = classify(b.lhs())?;
                let rhs = classify(b.rhs())?;
                if matches!((lhs, rhs), (Operand::Num(_), Operand::Num(_))) {
                    return Err(CodegenError::LowerUnsupported(
                        "cannot compute the Taylor derivative in a binary operator \
                         if both operands are numbers"
                            .to_string(),
                    ));
                }
                match b.op() {
                    BinaryOp::Add => self.addsub_diff(fname, lhs, rhs, true),
                    BinaryOp::Sub => self.addsub_diff(fname, lhs, rhs, false),
                    BinaryOp::Mul => self.mul_diff(fname, lhs, rhs),
                    BinaryOp::Div => self.div_diff(fname, lhs, rhs, slot as u32),
                }
            }
            Expression::Call(c) => {
                match c.func() {
                    Func::Exp => {
                        let arg = classify(&c.args()[0])?;
                        self.exp_diff(fname, arg, slot as u32)
                    }
                    Func::Sin | Func::Cos => {
                        let arg = classify(&c.args()[0])?;
                        let is_sin = matches!(c.func(), Func::Sin);
                        let partner_kind = if is_sin { Func::Cos } else { Func::Sin };
                        let partner_expr = Expression::from_function(FunctionCall::new(
                            partner_kind,
                            c.args().to_vec(),
                        ));
                        let partner = find_aux(dc, n_eq..dc.len(), &partner_expr).ok_or_else(
                            || {
                                CodegenError::LowerUnsupported(format!(
                                    "no partner series found for '{}'",
                                    dc[slot]
                                ))
                            },
                        )?;
                        self.sincos_diff(fname, arg, partner, is_sin)
                    }
                    _ => Err(CodegenError::LowerUnsupported(format!(
                        "the function '{}' has no Taylor recurrence",
                        c.display_name()
                    ))),
                }
            }
            other => Err(CodegenError::LowerUnsupported(format!(
                "unexpected decomposition entry '{other}'"
            ))),
        }
    }

    /// `d_k(a ± b)`: direct add/subtract of the operands' rows. A number
    /// operand contributes nothing at order `k ≥ 1`.
    fn addsub_diff(
        &mut self,
        fname: &str,
        lhs: Operand,
        rhs: Operand,
        is_add: bool,
    ) -> Result<FuncId, CodegenError> {
        self.emit_helper(fname, |em, builder, diff_ptr, order| match (lhs, rhs) {
            (Operand::Num(_), Operand::Var(idx)) => {
                let value = em.load_diff(builder, diff_ptr, order, idx);
                if is_add {
                    value
                } else {
                    builder.ins().fneg(value)
                }
            }
            (Operand::Var(idx), Operand::Num(_)) => em.load_diff(builder, diff_ptr, order, idx),
            (Operand::Var(idx0), Operand::Var(idx1)) => {
                let v0 = em.load_diff(builder, diff_ptr, order, idx0);
                let v1 = em.load_diff(builder, diff_ptr, order, idx1);
                if is_add {
                    builder.ins().fadd(v0, v1)
                } else {
                    builder.ins().fsub(v0, v1)
                }
            }
            // Ruled out before emission.
            (Operand::Num(_), Operand::Num(_)) => builder.ins().f64const(0.0),
        })
    }

    /// `d_k(a · b)`: the Cauchy product
    /// `Σ_{j=0..k} d_{k-j}(a) · d_j(b)`, or a rescaled row when one
    /// operand is a number.
    fn mul_diff(
        &mut self,
        fname: &str,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<FuncId, CodegenError> {
        match (lhs, rhs) {
            (Operand::Num(c), Operand::Var(idx)) | (Operand::Var(idx), Operand::Num(c)) => self
                .emit_helper(fname, |em, builder, diff_ptr, order| {
                    let value = em.load_diff(builder, diff_ptr, order, idx);
                    let constant = builder.ins().f64const(c);
                    builder.ins().fmul(constant, value)
                }),
            (Operand::Var(idx0), Operand::Var(idx1)) => {
                self.emit_helper(fname, |em, builder, diff_ptr, order| {
                    em.emit_sum_loop(builder, 0, order, |builder, j, acc| {
                        let row0 = builder.ins().isub(order, j);
                        let v0 = em.load_diff(builder, diff_ptr, row0, idx0);
                        let v1 = em.load_diff(builder, diff_ptr, j, idx1);
                        let term = builder.ins().fmul(v0, v1);
                        builder.ins().fadd(acc, term)
                    })
                })
            }
            (Operand::Num(_), Operand::Num(_)) => unreachable!("rejected before emission"),
        }
    }

    /// `d_k(a / b)` with the standard division recurrence
    /// `(1/b₀) · (d_k(a) − Σ_{j=1..k} d_j(b) · d_{k-j}(a/b))`, where the
    /// quotient's own earlier rows live at `self_idx`.
    fn div_diff(
        &mut self,
        fname: &str,
        lhs: Operand,
        rhs: Operand,
        self_idx: u32,
    ) -> Result<FuncId, CodegenError> {
        match (lhs, rhs) {
            // Dividing a series by a constant rescales its rows.
            (Operand::Var(idx), Operand::Num(c)) => {
                self.emit_helper(fname, |em, builder, diff_ptr, order| {
                    let value = em.load_diff(builder, diff_ptr, order, idx);
                    let constant = builder.ins().f64const(c);
                    builder.ins().fdiv(value, constant)
                })
            }
            (lhs @ (Operand::Num(_) | Operand::Var(_)), Operand::Var(den)) => {
                self.emit_helper(fname, |em, builder, diff_ptr, order| {
                    let zero_row = builder.ins().iconst(types::I32, 0);
                    let b0 = em.load_diff(builder, diff_ptr, zero_row, den);
                    let numerator_k = match lhs {
                        // d_k of a literal numerator vanishes for k ≥ 1.
                        Operand::Num(_) => builder.ins().f64const(0.0),
                        Operand::Var(num) => em.load_diff(builder, diff_ptr, order, num),
                    };
                    let sum = em.emit_sum_loop(builder, 1, order, |builder, j, acc| {
                        let bj = em.load_diff(builder, diff_ptr, j, den);
                        let row = builder.ins().isub(order, j);
                        let qkj = em.load_diff(builder, diff_ptr, row, self_idx);
                        let term = builder.ins().fmul(bj, qkj);
                        builder.ins().fadd(acc, term)
                    });
                    let diff = builder.ins().fsub(numerator_k, sum);
                    builder.ins().fdiv(diff, b0)
                })
            }
            (_, Operand::Num(_)) => unreachable!("rejected before emission"),
        }
    }

    /// `d_k(exp(a)) = (1/k) · Σ_{j=1..k} j·d_j(a) · d_{k-j}(exp(a))`.
    fn exp_diff(&mut self, fname: &str, arg: Operand, self_idx: u32) -> Result<FuncId, CodegenError> {
        match arg {
            // exp of a constant has vanishing higher derivatives.
            Operand::Num(_) => self.emit_helper(fname, |_, builder, _, _| builder.ins().f64const(0.0)),
            Operand::Var(a) => self.emit_helper(fname, |em, builder, diff_ptr, order| {
                let sum = em.emit_sum_loop(builder, 1, order, |builder, j, acc| {
                    let aj = em.load_diff(builder, diff_ptr, j, a);
                    let j_f = builder.ins().fcvt_from_uint(types::F64, j);
                    let weighted = builder.ins().fmul(j_f, aj);
                    let row = builder.ins().isub(order, j);
                    let ekj = em.load_diff(builder, diff_ptr, row, self_idx);
                    let term = builder.ins().fmul(weighted, ekj);
                    builder.ins().fadd(acc, term)
                });
                let order_f = builder.ins().fcvt_from_uint(types::F64, order);
                builder.ins().fdiv(sum, order_f)
            }),
        }
    }

    /// `d_k(sin a) = (1/k) Σ_{j=1..k} j·d_j(a) · d_{k-j}(cos a)` and the
    /// sign-flipped mirror for the cosine.
    fn sincos_diff(
        &mut self,
        fname: &str,
        arg: Operand,
        partner: u32,
        is_sin: bool,
    ) -> Result<FuncId, CodegenError> {
        match arg {
            Operand::Num(_) => self.emit_helper(fname, |_, builder, _, _| builder.ins().f64const(0.0)),
            Operand::Var(a) => self.emit_helper(fname, |em, builder, diff_ptr, order| {
                let sum = em.emit_sum_loop(builder, 1, order, |builder, j, acc| {
                    let aj = em.load_diff(builder, diff_ptr, j, a);
                    let j_f = builder.ins().fcvt_from_uint(types::F64, j);
                    let weighted = builder.ins().fmul(j_f, aj);
                    let row = builder.ins().isub(order, j);
                    let pkj = em.load_diff(builder, diff_ptr, row, partner);
                    let term = builder.ins().fmul(weighted, pkj);
                    builder.ins().fadd(acc, term)
                });
                let order_f = builder.ins().fcvt_from_uint(types::F64, order);
                let ratio = builder.ins().fdiv(sum, order_f);
                if is_sin {
                    ratio
                } else {
                    builder.ins().fneg(ratio)
                }
            }),
        }
    }
}

impl CodeGen {
    /// Adds a Taylor stepper for the ODE system `sys` under `name`.
    ///
    /// The emitted function has the shape
    /// `step(in_out: *mut f64, h: f64, order: u32)`: on entry the
    /// pointer holds the current state vector (one entry per equation,
    /// in sorted variable order); on return it holds the state advanced
    /// by one Taylor step of timestep `h` and the given order. `order`
    /// must lie in `[1, max_order]`; the pointer must not be captured.
    ///
    /// # Errors
    ///
    /// Fails on invalid names or collisions, a zero `max_order`, a
    /// variable/equation count mismatch, 32-bit overflow of
    /// `n_uvars · max_order`, or operations without a Taylor recurrence.
    pub fn add_taylor(
        &mut self,
        name: &str,
        sys: Vec<Expression>,
        max_order: u32,
    ) -> Result<(), CodegenError> {
        self.ensure_building()?;
        check_symbol_name(name)?;
        self.check_collision(name)?;
        if max_order == 0 {
            return Err(CodegenError::InvalidMaxOrder);
        }

        let n_eq = sys.len();
        let dc = taylor_decompose(sys)?;
        let n_uvars = dc.len() - n_eq;

        // All indexing below runs on 32-bit arithmetic; make sure the
        // whole derivatives array is addressable that way.
        let n_uvars_u32: u32 = n_uvars
            .try_into()
            .map_err(|_| CodegenError::OrderOverflow)?;
        let array_bytes = n_uvars_u32
            .checked_mul(max_order)
            .and_then(|cells| cells.checked_mul(8))
            .ok_or(CodegenError::OrderOverflow)?;

        let ptr_type = self.module.target_config().pointer_type();
        let mut emitter = TaylorEmitter {
            cg: self,
            n_uvars: n_uvars_u32,
            ptr_type,
        };

        // Derivative helpers for the state variables, keyed on the rhs
        // entries at the tail of the decomposition.
        let mut sv_funcs = Vec::with_capacity(n_eq);
        for i in 0..n_eq {
            let fname = format!("{name}.sv_diff.{i}");
            let id = match &dc[n_uvars + i] {
                Expression::Variable(v) => {
                    let u_idx = uname_to_index(v.name())?;
                    emitter.sv_diff_var(&fname, u_idx)?
                }
                Expression::Number(n) => emitter.sv_diff_num(&fname, n.value())?,
                other => {
                    return Err(CodegenError::LowerUnsupported(format!(
                        "unexpected right-hand side entry '{other}'"
                    )))
                }
            };
            sv_funcs.push(id);
        }

        // Recurrence helpers for the auxiliary assignments.
        let mut aux_funcs = Vec::with_capacity(n_uvars - n_eq);
        for slot in n_eq..n_uvars {
            let fname = format!("{name}.t_diff.{slot}");
            aux_funcs.push(emitter.aux_diff(&fname, &dc, n_eq, slot)?);
        }

        let step = self.taylor_add_step(
            name,
            &dc,
            n_eq,
            n_uvars_u32,
            array_bytes,
            &sv_funcs,
            &aux_funcs,
        )?;
        self.symbols.insert(name.to_string(), SymbolInfo::Taylor { step });
        Ok(())
    }

    /// Order-0 initialisation of an auxiliary assignment: variable
    /// operands read from row 0 of the derivatives array.
    fn taylor_init(
        &mut self,
        builder: &mut FunctionBuilder,
        e: &Expression,
        diff_ptr: Value,
        ptr_type: Type,
    ) -> Result<Value, CodegenError> {
        let load_operand =
            |builder: &mut FunctionBuilder, e: &Expression| -> Result<Value, CodegenError> {
                match classify(e)? {
                    Operand::Num(c) => Ok(builder.ins().f64const(c)),
                    Operand::Var(idx) => {
                        let offset = builder.ins().iconst(ptr_type, (idx as i64) * 8);
                        let addr = builder.ins().iadd(diff_ptr, offset);
                        Ok(builder.ins().load(
                            types::F64,
                            MemFlags::trusted(),
                            addr,
                            Offset32::new(0),
                        ))
                    }
                }
            };

        match e {
            Expression::Binary(b) => {
                let lhs = load_operand(builder, b.lhs())?;
                let rhs = load_operand(builder, b.rhs())?;
                Ok(match b.op() {
                    BinaryOp::Add => builder.ins().fadd(lhs, rhs),
                    BinaryOp::Sub => builder.ins().fsub(lhs, rhs),
                    BinaryOp::Mul => builder.ins().fmul(lhs, rhs),
                    BinaryOp::Div => builder.ins().fdiv(lhs, rhs),
                })
            }
            Expression::Call(c) => {
                let mut args = Vec::with_capacity(c.args().len());
                for arg in c.args() {
                    args.push(load_operand(builder, arg)?);
                }
                // Only the kinds with a Taylor recurrence appear here;
                // helper emission has already rejected the rest.
                self.lower_call(builder, c, &args)
            }
            other => Err(CodegenError::LowerUnsupported(format!(
                "the expression '{other}' cannot be initialised in a Taylor stepper"
            ))),
        }
    }

    /// The exported step driver.
    #[allow(clippy::too_many_arguments)]
    fn taylor_add_step(
        &mut self,
        name: &str,
        dc: &[Expression],
        n_eq: usize,
        n_uvars: u32,
        array_bytes: u32,
        sv_funcs: &[FuncId],
        aux_funcs: &[FuncId],
    ) -> Result<FuncId, CodegenError> {
        let ptr_type = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(ptr_type)); // in_out
        sig.params.push(AbiParam::new(types::F64)); // h
        sig.params.push(AbiParam::new(types::I32)); // order
        let id = self.declare_local(name, &sig, Linkage::Export)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let in_out = builder.block_params(entry)[0];
        let h = builder.block_params(entry)[1];
        let order = builder.block_params(entry)[2];

        // Flat array holding the normalised derivatives:
        // diff[k * n_uvars + j] is the order-k derivative of u_j.
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            array_bytes,
            3,
        ));
        let diff_ptr = builder.ins().stack_addr(ptr_type, slot, 0);

        let flags = MemFlags::trusted();
        let store_row0 = |builder: &mut FunctionBuilder, value: Value, col: usize| {
            let addr = builder.ins().iadd_imm(diff_ptr, (col as i64) * 8);
            builder.ins().store(flags, value, addr, Offset32::new(0));
        };

        // Order-0 row: the state entries come straight from in_out and
        // seed the per-variable accumulators.
        let mut acc0 = Vec::with_capacity(n_eq);
        for i in 0..n_eq {
            let addr = builder.ins().iadd_imm(in_out, (i as i64) * 8);
            let value = builder
                .ins()
                .load(types::F64, flags, addr, Offset32::new(0));
            store_row0(&mut builder, value, i);
            acc0.push(value);
        }
        // The auxiliary entries are computed from their definitions.
        for slot_idx in n_eq..(n_uvars as usize) {
            let value = self.taylor_init(&mut builder, &dc[slot_idx], diff_ptr, ptr_type)?;
            store_row0(&mut builder, value, slot_idx);
        }

        // The derivative rows for k = 1 … order-1. Loop state: the row
        // counter, the running power of h, and one accumulator per
        // state variable.
        let header = builder.create_block();
        builder.append_block_param(header, types::I32);
        builder.append_block_param(header, types::F64);
        for _ in 0..n_eq {
            builder.append_block_param(header, types::F64);
        }
        let body = builder.create_block();
        let fini = builder.create_block();

        let one = builder.ins().iconst(types::I32, 1);
        let mut first_args = vec![one, h];
        first_args.extend(acc0.iter().copied());
        builder.ins().jump(header, &first_args);

        builder.switch_to_block(header);
        let k = builder.block_params(header)[0];
        let h_acc = builder.block_params(header)[1];
        let accs: Vec<Value> = builder.block_params(header)[2..].to_vec();
        let in_range = builder.ins().icmp(IntCC::UnsignedLessThan, k, order);
        builder.ins().brif(in_range, body, &[], fini, &[]);

        builder.switch_to_block(body);
        let mut callee_cache: HashMap<FuncId, cranelift_codegen::ir::FuncRef> = HashMap::new();
        let store_row_k = |builder: &mut FunctionBuilder, value: Value, k: Value, col: usize| {
            let base = builder.ins().imul_imm(k, n_uvars as i64);
            let lin = builder.ins().iadd_imm(base, col as i64);
            let wide = builder.ins().uextend(ptr_type, lin);
            let offset = builder.ins().imul_imm(wide, 8);
            let addr = builder.ins().iadd(diff_ptr, offset);
            builder.ins().store(flags, value, addr, Offset32::new(0));
        };
        // State rows first: the auxiliary recurrences at row k read them.
        let mut next_accs = Vec::with_capacity(n_eq);
        for (i, &func) in sv_funcs.iter().enumerate() {
            let callee = *callee_cache
                .entry(func)
                .or_insert_with(|| self.module.declare_func_in_func(func, builder.func));
            let call = builder.ins().call(callee, &[diff_ptr, k]);
            let d = builder.inst_results(call)[0];
            store_row_k(&mut builder, d, k, i);
            let contribution = builder.ins().fmul(h_acc, d);
            next_accs.push(builder.ins().fadd(accs[i], contribution));
        }
        for (offset, &func) in aux_funcs.iter().enumerate() {
            let callee = *callee_cache
                .entry(func)
                .or_insert_with(|| self.module.declare_func_in_func(func, builder.func));
            let call = builder.ins().call(callee, &[diff_ptr, k]);
            let d = builder.inst_results(call)[0];
            store_row_k(&mut builder, d, k, n_eq + offset);
        }
        let h_acc_next = builder.ins().fmul(h_acc, h);
        let k_next = builder.ins().iadd_imm(k, 1);
        let mut back_args = vec![k_next, h_acc_next];
        back_args.extend(next_accs);
        builder.ins().jump(header, &back_args);

        // Finalisation: one last normalised derivative at the requested
        // order closes the Taylor polynomial, and the state is written
        // back.
        builder.switch_to_block(fini);
        for (i, &func) in sv_funcs.iter().enumerate() {
            let callee = *callee_cache
                .entry(func)
                .or_insert_with(|| self.module.declare_func_in_func(func, builder.func));
            let call = builder.ins().call(callee, &[diff_ptr, order]);
            let d = builder.inst_results(call)[0];
            let contribution = builder.ins().fmul(h_acc, d);
            let final_value = builder.ins().fadd(accs[i], contribution);
            let addr = builder.ins().iadd_imm(in_out, (i as i64) * 8);
            builder
                .ins()
                .store(flags, final_value, addr, Offset32::new(0));
        }
        builder.ins().return_(&[]);
        builder.seal_all_blocks();
        builder.finalize();

        self.define(name, Vec::new(), id, ctx, false)?;
        Ok(id)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{cos, exp, sin};

    fn var(name: &str) -> Expression {
        Expression::from_variable(name).unwrap()
    }

    fn num(value: f64) -> Expression {
        Expression::from_number(value)
    }

    fn uv(idx: usize) -> Expression {
        u_var(idx).unwrap()
    }

    #[test]
    fn test_uname_to_index() {
        assert_eq!(uname_to_index("u_0").unwrap(), 0);
        assert_eq!(uname_to_index("u_42").unwrap(), 42);
        assert!(uname_to_index("x").is_err());
        assert!(uname_to_index("u_").is_err());
    }

    #[test]
    fn test_decompose_van_der_pol() {
        // ẋ = y, ẏ = (1 - x²)·y - x
        let x = var("x");
        let y = var("y");
        let sys = vec![
            y.clone(),
            (num(1.0) - x.clone() * x.clone()) * y.clone() - x.clone(),
        ];
        let dc = taylor_decompose(sys).unwrap();

        assert_eq!(dc.len(), 8);
        // State variables first.
        assert_eq!(dc[0], uv(0));
        assert_eq!(dc[1], uv(1));
        // Auxiliary assignments in post-order.
        assert_eq!(dc[2], uv(0) * uv(0));
        assert_eq!(
            dc[3],
            Expression::Binary(BinaryOperator::with_op(BinaryOp::Sub, num(1.0), uv(2)))
        );
        assert_eq!(dc[4], uv(3) * uv(1));
        assert_eq!(
            dc[5],
            Expression::Binary(BinaryOperator::with_op(BinaryOp::Sub, uv(4), uv(0)))
        );
        // The right-hand sides resolve to u-variables.
        assert_eq!(dc[6], uv(1));
        assert_eq!(dc[7], uv(5));
    }

    #[test]
    fn test_decompose_arity_mismatch() {
        // One equation over two variables.
        let sys = vec![var("x") * var("y")];
        assert!(matches!(
            taylor_decompose(sys),
            Err(CodegenError::SystemArityMismatch { n_vars: 2, n_eqs: 1 })
        ));
    }

    #[test]
    fn test_decompose_constant_rhs() {
        // ẏ = 3 keeps its literal rhs entry; the x - x term keeps x a
        // state variable of the system.
        let sys = vec![var("y") + (var("x") - var("x")), num(3.0)];
        let dc = taylor_decompose(sys).unwrap();
        assert_eq!(dc.len(), 6);
        // eq0 decomposes into u_2 = u_0 - u_0 and u_3 = u_1 + u_2.
        assert_eq!(
            dc[2],
            Expression::Binary(BinaryOperator::with_op(BinaryOp::Sub, uv(0), uv(0)))
        );
        assert_eq!(dc[4], uv(3));
        // eq1's rhs stays a number.
        assert_eq!(dc[5], num(3.0));
    }

    #[test]
    fn test_decompose_sin_appends_partner() {
        // ẋ = sin(x) decomposes into the sine and its cosine partner.
        let sys = vec![sin(var("x"))];
        let dc = taylor_decompose(sys).unwrap();
        assert_eq!(dc.len(), 4);
        assert_eq!(dc[0], uv(0));
        assert_eq!(dc[1], sin(uv(0)));
        assert_eq!(dc[2], cos(uv(0)));
        assert_eq!(dc[3], uv(1));
    }

    #[test]
    fn test_decompose_exp() {
        let sys = vec![exp(var("x"))];
        let dc = taylor_decompose(sys).unwrap();
        assert_eq!(dc.len(), 3);
        assert_eq!(dc[1], exp(uv(0)));
        assert_eq!(dc[2], uv(1));
    }

    #[test]
    fn test_classify_rejects_compound() {
        let compound = uv(0) * uv(1);
        assert!(matches!(
            classify(&compound),
            Err(CodegenError::LowerUnsupported(_))
        ));
    }
}
