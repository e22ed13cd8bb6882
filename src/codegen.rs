//! JIT compilation of expressions to native machine code.
//!
//! [`CodeGen`] owns a Cranelift JIT module and lowers expressions into
//! it. Each symbol added through [`CodeGen::add_expression`] produces
//! three entry points:
//!
//! - `name`: the varargs entry, one `f64` parameter per free variable in
//!   sorted order;
//! - `name.vecargs`: the packed entry, loading the variables from a
//!   read-only pointer and tail-delegating to the varargs entry;
//! - `name.batch`: the batched entry, looping the packed entry over
//!   `batch_size` packed rows.
//!
//! Taylor steppers are added through
//! [`CodeGen::add_taylor`](crate::taylor) and share the module.
//!
//! The module follows a one-way `Building → Compiled` state machine:
//! after [`CodeGen::compile`] transfers it to the execution engine, any
//! mutating operation fails with [`CodegenError::ModuleCompiled`], and
//! the `fetch` family becomes available. Resolved entry points stay
//! valid for the lifetime of the `CodeGen`.
//!
//! Every generated function is verified before definition unless
//! verification is disabled, either globally ([`CodeGen::set_verify`])
//! or by a call kind that is known to trip the verifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use colored::Colorize;
use cranelift::prelude::{
    settings, types, AbiParam, Configurable, FunctionBuilder, FunctionBuilderContext, InstBuilder,
    IntCC, MemFlags, Value,
};
use cranelift_codegen::ir::{self, immediates::Offset32, InstructionData, Opcode};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::verifier;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use itertools::Itertools;
use target_lexicon::Triple;

use crate::errors::{CodegenError, ExprError};
use crate::expr::{check_symbol_name, BinaryOp, BinaryOperator, Expression, LinearOp};
use crate::math::{self, CallKind, Func, FunctionCall};
use crate::types::{BatchFn, PackedFn, TaylorFn, VarargFn};

/// Optimisation level of the generated code.
///
/// Level 0 disables the backend optimiser; every other level enables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    #[default]
    O3,
}

/// Host target triple, detected once per process.
fn host_triple() -> &'static Triple {
    static HOST_TRIPLE: OnceLock<Triple> = OnceLock::new();
    HOST_TRIPLE.get_or_init(Triple::host)
}

/// Creates an instruction-set target for the host machine.
///
/// Detects the host architecture and configures compilation flags for
/// it, mapping the requested optimisation level onto the backend's
/// `opt_level` setting.
fn create_isa(opt_level: OptLevel) -> Result<Arc<dyn TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();

    let is_x86 = matches!(
        host_triple().architecture,
        target_lexicon::Architecture::X86_64
    );
    if is_x86 {
        flag_builder.set("use_colocated_libcalls", "true").unwrap();
        flag_builder.set("is_pic", "true").unwrap();
    } else {
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
    }
    let level = match opt_level {
        OptLevel::O0 => "none",
        _ => "speed",
    };
    flag_builder.set("opt_level", level).unwrap();

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| CodegenError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CodegenError::HostMachineNotSupported(e.to_string()))
}

/// Definitions behind a user-visible symbol.
pub(crate) enum SymbolInfo {
    /// The entry-point triple of a compiled expression.
    Expression {
        varargs: FuncId,
        vecargs: FuncId,
        batch: FuncId,
        /// Free variables in sorted order; one varargs parameter each.
        vars: Vec<String>,
    },
    /// A Taylor stepper.
    Taylor { step: FuncId },
}

/// Pre-compilation snapshot of a generated function, kept for textual
/// dumps and the IR-to-expression lift.
pub(crate) struct Snapshot {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
    pub(crate) func: ir::Function,
}

/// JIT code generator and module owner.
pub struct CodeGen {
    pub(crate) isa: Arc<dyn TargetIsa>,
    pub(crate) module: JITModule,
    module_name: String,
    opt_level: OptLevel,
    /// User-visible symbols defined in the module.
    pub(crate) symbols: HashMap<String, SymbolInfo>,
    /// Imported runtime symbols: name → (id, arity).
    imports: HashMap<String, (FuncId, usize)>,
    /// Reverse map for resolving call targets when lifting IR.
    names_by_id: HashMap<FuncId, String>,
    /// IR snapshots in definition order.
    pub(crate) snapshots: Vec<Snapshot>,
    verify: bool,
    compiled: bool,
}

impl CodeGen {
    /// Creates a generator with a fresh module.
    ///
    /// `opt_level` selects the backend optimisation level; the module
    /// name is only used for diagnostics.
    pub fn new(module_name: &str, opt_level: OptLevel) -> Result<Self, CodegenError> {
        let isa = create_isa(opt_level)?;

        let mut builder =
            JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
        for (name, ptr) in math::host_symbols() {
            builder.symbol(name, ptr);
        }
        let module = JITModule::new(builder);

        Ok(Self {
            isa,
            module,
            module_name: module_name.to_string(),
            opt_level,
            symbols: HashMap::new(),
            imports: HashMap::new(),
            names_by_id: HashMap::new(),
            snapshots: Vec::new(),
            verify: true,
            compiled: false,
        })
    }

    /// The optimisation level the module was created with.
    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    /// Whether generated functions are verified before definition.
    pub fn verify(&self) -> bool {
        self.verify
    }

    /// Enables or disables IR verification of generated functions.
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub(crate) fn ensure_building(&self) -> Result<(), CodegenError> {
        if self.compiled {
            Err(CodegenError::ModuleCompiled)
        } else {
            Ok(())
        }
    }

    fn ensure_compiled(&self, name: &str) -> Result<&SymbolInfo, CodegenError> {
        if !self.compiled {
            // Symbols resolve only after the module has been handed to
            // the execution engine.
            return Err(CodegenError::UnknownFunction(name.to_string()));
        }
        self.symbols
            .get(name)
            .ok_or_else(|| CodegenError::UnknownFunction(name.to_string()))
    }

    /// Adds an expression under `name`, generating the varargs, packed
    /// and batched entry points.
    ///
    /// One `f64` argument is generated per free variable, in sorted
    /// order. `batch_size` fixes the loop count of the batched entry.
    ///
    /// # Errors
    ///
    /// Fails on names containing `.`, name collisions, unknown or
    /// misused callees inside the expression, verifier rejections, or a
    /// variable count outside the 32-bit range.
    pub fn add_expression(
        &mut self,
        name: &str,
        e: &Expression,
        batch_size: u32,
    ) -> Result<(), CodegenError> {
        self.ensure_building()?;
        check_symbol_name(name)?;
        self.check_collision(name)?;

        let vars = e.variables();
        if vars.len() > u32::MAX as usize {
            return Err(CodegenError::TooManyVariables(vars.len()));
        }

        let varargs = self.add_varargs_expression(name, e, &vars)?;
        let vecargs = self.add_vecargs_expression(name, varargs, &vars)?;
        let batch = self.add_batch_expression(name, vecargs, &vars, batch_size)?;

        self.symbols.insert(
            name.to_string(),
            SymbolInfo::Expression {
                varargs,
                vecargs,
                batch,
                vars,
            },
        );
        Ok(())
    }

    /// Transfers the module to the execution engine, making the `fetch`
    /// family available. The generator is immutable afterwards.
    pub fn compile(&mut self) -> Result<(), CodegenError> {
        self.ensure_building()?;
        self.module.finalize_definitions()?;
        self.compiled = true;
        Ok(())
    }

    /// Fetches the packed entry of a compiled expression.
    pub fn fetch(&self, name: &str) -> Result<PackedFn, CodegenError> {
        match self.ensure_compiled(name)? {
            SymbolInfo::Expression { vecargs, .. } => {
                let ptr = self.module.get_finalized_function(*vecargs);
                Ok(unsafe { std::mem::transmute::<*const u8, PackedFn>(ptr) })
            }
            SymbolInfo::Taylor { .. } => Err(CodegenError::UnknownFunction(name.to_string())),
        }
    }

    /// Fetches the varargs entry of a compiled expression with a known
    /// arity, checked against the recorded variable count.
    pub fn fetch_vararg<F: VarargFn>(&self, name: &str) -> Result<F, CodegenError> {
        match self.ensure_compiled(name)? {
            SymbolInfo::Expression { varargs, vars, .. } => {
                if vars.len() != F::ARITY {
                    return Err(CodegenError::Expr(ExprError::ArityMismatch {
                        name: name.to_string(),
                        expected: vars.len(),
                        got: F::ARITY,
                    }));
                }
                let ptr = self.module.get_finalized_function(*varargs);
                Ok(unsafe { F::from_raw(ptr) })
            }
            SymbolInfo::Taylor { .. } => Err(CodegenError::UnknownFunction(name.to_string())),
        }
    }

    /// Fetches the batched entry of a compiled expression.
    pub fn fetch_batch(&self, name: &str) -> Result<BatchFn, CodegenError> {
        match self.ensure_compiled(name)? {
            SymbolInfo::Expression { batch, .. } => {
                let ptr = self.module.get_finalized_function(*batch);
                Ok(unsafe { std::mem::transmute::<*const u8, BatchFn>(ptr) })
            }
            SymbolInfo::Taylor { .. } => Err(CodegenError::UnknownFunction(name.to_string())),
        }
    }

    /// Fetches a compiled Taylor stepper.
    pub fn fetch_taylor(&self, name: &str) -> Result<TaylorFn, CodegenError> {
        match self.ensure_compiled(name)? {
            SymbolInfo::Taylor { step, .. } => {
                let ptr = self.module.get_finalized_function(*step);
                Ok(unsafe { std::mem::transmute::<*const u8, TaylorFn>(ptr) })
            }
            SymbolInfo::Expression { .. } => Err(CodegenError::UnknownFunction(name.to_string())),
        }
    }

    /// Renders every generated function as textual IR.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for snapshot in &self.snapshots {
            out.push_str(&format!("{}\n", snapshot.func.display()));
        }
        out
    }

    /// Renders one generated function as textual IR.
    pub fn dump_function(&self, name: &str) -> Result<String, CodegenError> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CodegenError::UnknownFunction(name.to_string()))?;
        Ok(format!("{}", snapshot.func.display()))
    }

    pub(crate) fn check_collision(&self, name: &str) -> Result<(), CodegenError> {
        if self.symbols.contains_key(name) || self.imports.contains_key(name) {
            return Err(CodegenError::NameCollision(name.to_string()));
        }
        Ok(())
    }

    /// Declares (or reuses) an imported runtime symbol with an
    /// `f64 × arity → f64` signature.
    fn declare_runtime(&mut self, name: &str, arity: usize) -> Result<FuncId, CodegenError> {
        if let Some(&(id, declared_arity)) = self.imports.get(name) {
            if declared_arity != arity {
                return Err(CodegenError::Expr(ExprError::ArityMismatch {
                    name: name.to_string(),
                    expected: declared_arity,
                    got: arity,
                }));
            }
            return Ok(id);
        }

        let mut sig = self.module.make_signature();
        for _ in 0..arity {
            sig.params.push(AbiParam::new(types::F64));
        }
        sig.returns.push(AbiParam::new(types::F64));
        let id = self.module.declare_function(name, Linkage::Import, &sig)?;
        self.imports.insert(name.to_string(), (id, arity));
        self.names_by_id.insert(id, name.to_string());
        Ok(id)
    }

    pub(crate) fn declare_local(
        &mut self,
        name: &str,
        sig: &ir::Signature,
        linkage: Linkage,
    ) -> Result<FuncId, CodegenError> {
        let id = self.module.declare_function(name, linkage, sig)?;
        self.names_by_id.insert(id, name.to_string());
        Ok(id)
    }

    /// Verifies, snapshots and defines a finished function.
    pub(crate) fn define(
        &mut self,
        name: &str,
        params: Vec<String>,
        id: FuncId,
        mut ctx: Context,
        skip_verify: bool,
    ) -> Result<(), CodegenError> {
        if self.verify && !skip_verify {
            if let Err(errors) = verifier::verify_function(&ctx.func, self.isa.as_ref()) {
                // The function is dropped with its context; nothing of
                // it reaches the module.
                return Err(CodegenError::VerifyFailed(errors.to_string()));
            }
        }
        self.snapshots.push(Snapshot {
            name: name.to_string(),
            params,
            func: ctx.func.clone(),
        });
        self.module.define_function(id, &mut ctx)?;
        self.module.clear_context(&mut ctx);
        Ok(())
    }

    /// Generates the varargs entry: the expression body over one `f64`
    /// parameter per free variable.
    fn add_varargs_expression(
        &mut self,
        name: &str,
        e: &Expression,
        vars: &[String],
    ) -> Result<FuncId, CodegenError> {
        let mut sig = self.module.make_signature();
        for _ in vars {
            sig.params.push(AbiParam::new(types::F64));
        }
        sig.returns.push(AbiParam::new(types::F64));
        let id = self.declare_local(name, &sig, Linkage::Export)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);

        // Record the function arguments under their variable names.
        let bindings: HashMap<String, Value> = vars
            .iter()
            .cloned()
            .zip(builder.block_params(entry).iter().copied())
            .collect();

        let ret = self.lower_expression(&mut builder, e, &bindings)?;
        builder.ins().return_(&[ret]);
        builder.seal_all_blocks();
        builder.finalize();

        let skip_verify = expression_disables_verify(e);
        self.define(name, vars.to_vec(), id, ctx, skip_verify)?;
        Ok(id)
    }

    /// Generates the packed entry `name.vecargs`: loads each variable
    /// from the input array and delegates to the varargs entry.
    fn add_vecargs_expression(
        &mut self,
        name: &str,
        varargs: FuncId,
        vars: &[String],
    ) -> Result<FuncId, CodegenError> {
        let ptr_type = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(ptr_type));
        sig.returns.push(AbiParam::new(types::F64));
        let symbol = format!("{name}.vecargs");
        let id = self.declare_local(&symbol, &sig, Linkage::Export)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let vec_arg = builder.block_params(entry)[0];

        // The argument array is read-only and not captured; the loads
        // carry the matching memory flags.
        let flags = MemFlags::trusted().with_readonly();
        let mut args = Vec::with_capacity(vars.len());
        for i in 0..vars.len() {
            let addr = builder.ins().iadd_imm(vec_arg, (i as i64) * 8);
            args.push(builder.ins().load(types::F64, flags, addr, Offset32::new(0)));
        }

        let callee = self.module.declare_func_in_func(varargs, builder.func);
        let call = builder.ins().call(callee, &args);
        let ret = builder.inst_results(call)[0];
        builder.ins().return_(&[ret]);
        builder.seal_all_blocks();
        builder.finalize();

        self.define(&symbol, Vec::new(), id, ctx, false)?;
        Ok(id)
    }

    /// Generates the batched entry `name.batch`: a counted loop reading
    /// `n_vars` packed doubles per iteration and storing one result.
    fn add_batch_expression(
        &mut self,
        name: &str,
        vecargs: FuncId,
        vars: &[String],
        batch_size: u32,
    ) -> Result<FuncId, CodegenError> {
        let ptr_type = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(ptr_type)); // out
        sig.params.push(AbiParam::new(ptr_type)); // in
        let symbol = format!("{name}.batch");
        let id = self.declare_local(&symbol, &sig, Linkage::Export)?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let out_arg = builder.block_params(entry)[0];
        let in_arg = builder.block_params(entry)[1];

        let header = builder.create_block();
        builder.append_block_param(header, types::I64);
        let body = builder.create_block();
        let after = builder.create_block();

        let zero = builder.ins().iconst(types::I64, 0);
        builder.ins().jump(header, &[zero]);

        builder.switch_to_block(header);
        let i = builder.block_params(header)[0];
        let cond = builder
            .ins()
            .icmp_imm(IntCC::UnsignedLessThan, i, batch_size as i64);
        builder.ins().brif(cond, body, &[], after, &[]);

        builder.switch_to_block(body);
        // Each iteration reads n_vars packed doubles at in + i*n_vars
        // and stores the result at out + i.
        let in_offset = builder.ins().imul_imm(i, (vars.len() as i64) * 8);
        let in_ptr = builder.ins().iadd(in_arg, in_offset);
        let callee = self.module.declare_func_in_func(vecargs, builder.func);
        let call = builder.ins().call(callee, &[in_ptr]);
        let result = builder.inst_results(call)[0];
        let out_offset = builder.ins().imul_imm(i, 8);
        let out_ptr = builder.ins().iadd(out_arg, out_offset);
        builder
            .ins()
            .store(MemFlags::trusted(), result, out_ptr, Offset32::new(0));
        let next = builder.ins().iadd_imm(i, 1);
        builder.ins().jump(header, &[next]);

        builder.switch_to_block(after);
        builder.ins().return_(&[]);
        builder.seal_all_blocks();
        builder.finalize();

        self.define(&symbol, Vec::new(), id, ctx, false)?;
        Ok(id)
    }

    /// Lowers an expression into the current function, replaying its
    /// flattened stack program against an SSA value stack.
    pub(crate) fn lower_expression(
        &mut self,
        builder: &mut FunctionBuilder,
        e: &Expression,
        bindings: &HashMap<String, Value>,
    ) -> Result<Value, CodegenError> {
        let ops = e.flatten();
        let mut stack: Vec<Value> = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                LinearOp::Const(c) => stack.push(builder.ins().f64const(*c)),
                LinearOp::Load(var) => {
                    let value = bindings.get(*var).copied().ok_or_else(|| {
                        CodegenError::Expr(ExprError::UndefinedVariable(var.to_string()))
                    })?;
                    stack.push(value);
                }
                LinearOp::Binary(op) => {
                    let rhs = stack.pop().unwrap();
                    let lhs = stack.pop().unwrap();
                    stack.push(match op {
                        BinaryOp::Add => builder.ins().fadd(lhs, rhs),
                        BinaryOp::Sub => builder.ins().fsub(lhs, rhs),
                        BinaryOp::Mul => builder.ins().fmul(lhs, rhs),
                        BinaryOp::Div => builder.ins().fdiv(lhs, rhs),
                    });
                }
                LinearOp::Call(call) => {
                    let split = stack.len() - call.args().len();
                    let args = stack.split_off(split);
                    let value = self.lower_call(builder, call, &args)?;
                    stack.push(value);
                }
            }
        }
        Ok(stack.pop().unwrap())
    }

    /// Emits a single call, resolving the callee according to its kind.
    pub(crate) fn lower_call(
        &mut self,
        builder: &mut FunctionBuilder,
        call: &FunctionCall,
        args: &[Value],
    ) -> Result<Value, CodegenError> {
        call.check_arity()?;
        match call.kind() {
            CallKind::Intrinsic => {
                // A local definition shadowing an intrinsic name is a
                // hard error.
                if self.symbols.contains_key(call.name()) {
                    return Err(CodegenError::NameCollision(call.name().to_string()));
                }
                match call.func() {
                    // Two of the intrinsics are native instructions.
                    Func::Sqrt => Ok(builder.ins().sqrt(args[0])),
                    Func::Abs => Ok(builder.ins().fabs(args[0])),
                    _ => {
                        let id = self.declare_runtime(call.name(), args.len())?;
                        let callee = self.module.declare_func_in_func(id, builder.func);
                        let inst = builder.ins().call(callee, args);
                        Ok(builder.inst_results(inst)[0])
                    }
                }
            }
            CallKind::External => {
                if self.symbols.contains_key(call.name()) {
                    return Err(CodegenError::NameCollision(call.name().to_string()));
                }
                let id = self.declare_runtime(call.name(), args.len())?;
                let callee = self.module.declare_func_in_func(id, builder.func);
                let inst = builder.ins().call(callee, args);
                Ok(builder.inst_results(inst)[0])
            }
            CallKind::User => {
                let (id, expected) = match self.symbols.get(call.name()) {
                    Some(SymbolInfo::Expression { varargs, vars, .. }) => (*varargs, vars.len()),
                    _ => return Err(CodegenError::UnknownFunction(call.name().to_string())),
                };
                if expected != args.len() {
                    return Err(CodegenError::Expr(ExprError::ArityMismatch {
                        name: call.name().to_string(),
                        expected,
                        got: args.len(),
                    }));
                }
                let callee = self.module.declare_func_in_func(id, builder.func);
                let inst = builder.ins().call(callee, args);
                Ok(builder.inst_results(inst)[0])
            }
        }
    }

    /// Rebuilds an expression from a generated single-block function by
    /// walking its instructions.
    ///
    /// Supported opcodes are the float arithmetic group, `f64` constants,
    /// `sqrt`/`fabs`, returns and calls to the known intrinsic set or to
    /// non-empty module-local definitions. Lifted local calls carry the
    /// callee's lifted body, so they stay evaluable and differentiable.
    pub fn to_expression(&self, name: &str) -> Result<Expression, CodegenError> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CodegenError::UnknownFunction(name.to_string()))?;
        let func = &snapshot.func;

        let blocks: Vec<_> = func.layout.blocks().collect();
        if blocks.len() != 1 {
            return Err(CodegenError::LiftUnsupported(format!(
                "only single-block functions can be converted, but '{name}' has {} blocks",
                blocks.len()
            )));
        }
        let entry = blocks[0];

        // Map every SSA value to its expression as instructions are
        // visited; the block parameters seed it with the variables.
        let mut lifted: HashMap<Value, Expression> = HashMap::new();
        for (i, &param) in func.dfg.block_params(entry).iter().enumerate() {
            let var = snapshot.params.get(i).ok_or_else(|| {
                CodegenError::LiftUnsupported(format!(
                    "'{name}' has unnamed parameters and cannot be converted"
                ))
            })?;
            lifted.insert(param, Expression::from_variable(var.clone())?);
        }

        let lift = |lifted: &HashMap<Value, Expression>,
                    value: Value|
         -> Result<Expression, CodegenError> {
            lifted.get(&value).cloned().ok_or_else(|| {
                CodegenError::LiftUnsupported(format!("value {value} has no expression equivalent"))
            })
        };

        for inst in func.layout.block_insts(entry) {
            let data = func.dfg.insts[inst];
            let args = func.dfg.inst_args(inst);
            match data.opcode() {
                Opcode::F64const => {
                    if let InstructionData::UnaryIeee64 { imm, .. } = data {
                        let result = func.dfg.first_result(inst);
                        lifted.insert(result, Expression::from_number(f64::from_bits(imm.bits())));
                    }
                }
                Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
                    let op = match data.opcode() {
                        Opcode::Fadd => BinaryOp::Add,
                        Opcode::Fsub => BinaryOp::Sub,
                        Opcode::Fmul => BinaryOp::Mul,
                        _ => BinaryOp::Div,
                    };
                    let lhs = lift(&lifted, args[0])?;
                    let rhs = lift(&lifted, args[1])?;
                    let result = func.dfg.first_result(inst);
                    lifted.insert(
                        result,
                        Expression::Binary(BinaryOperator::with_op(op, lhs, rhs)),
                    );
                }
                Opcode::Fneg => {
                    let inner = lift(&lifted, args[0])?;
                    let result = func.dfg.first_result(inst);
                    lifted.insert(result, -inner);
                }
                Opcode::Sqrt => {
                    let inner = lift(&lifted, args[0])?;
                    let result = func.dfg.first_result(inst);
                    lifted.insert(result, math::sqrt(inner));
                }
                Opcode::Fabs => {
                    let inner = lift(&lifted, args[0])?;
                    let result = func.dfg.first_result(inst);
                    lifted.insert(result, math::abs(inner));
                }
                Opcode::Call => {
                    let callee = self.resolve_callee(func, data)?;
                    let mut call_args = Vec::with_capacity(args.len());
                    for &arg in args {
                        call_args.push(lift(&lifted, arg)?);
                    }
                    let expr = self.lift_call(&callee, call_args)?;
                    let result = func.dfg.first_result(inst);
                    lifted.insert(result, expr);
                }
                Opcode::Return => {
                    // Processing stops at the first return.
                    return lift(&lifted, args[0]);
                }
                other => {
                    return Err(CodegenError::LiftUnsupported(format!(
                        "unknown instruction '{other}'"
                    )));
                }
            }
        }

        Err(CodegenError::LiftUnsupported(format!(
            "the function '{name}' has no return statement"
        )))
    }

    /// Resolves the symbol name behind a call instruction.
    fn resolve_callee(
        &self,
        func: &ir::Function,
        data: InstructionData,
    ) -> Result<String, CodegenError> {
        let InstructionData::Call { func_ref, .. } = data else {
            return Err(CodegenError::LiftUnsupported(
                "indirect calls cannot be converted".to_string(),
            ));
        };
        let ext = &func.dfg.ext_funcs[func_ref];
        let ir::ExternalName::User(name_ref) = ext.name else {
            return Err(CodegenError::LiftUnsupported(
                "calls to non-user symbols cannot be converted".to_string(),
            ));
        };
        let user_name = &func.params.user_named_funcs()[name_ref];
        let id = FuncId::from_u32(user_name.index);
        self.names_by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| CodegenError::UnknownFunction(format!("func id {}", user_name.index)))
    }

    /// Turns a resolved call target into an expression node.
    fn lift_call(&self, callee: &str, args: Vec<Expression>) -> Result<Expression, CodegenError> {
        // The known intrinsic and external set first.
        if let Some(func) = func_from_name(callee) {
            return Ok(Expression::from_function(FunctionCall::new(func, args)));
        }

        // Otherwise the call must target a non-empty local definition;
        // its body is lifted recursively so the resulting node remains
        // differentiable.
        match self.symbols.get(callee) {
            Some(SymbolInfo::Expression { vars, .. }) => {
                if args.len() != vars.len() {
                    return Err(CodegenError::Expr(ExprError::ArityMismatch {
                        name: callee.to_string(),
                        expected: vars.len(),
                        got: args.len(),
                    }));
                }
                let body = self.to_expression(callee)?;
                let call = math::user_with_body(callee.to_string(), vars.clone(), body, args);
                Ok(Expression::from_function(call))
            }
            _ => Err(CodegenError::UnknownIntrinsic(callee.to_string())),
        }
    }
}

impl fmt::Debug for CodeGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Module".cyan(), self.module_name)?;
        writeln!(f, "    {}: {:?}", "Optimisation".cyan(), self.opt_level)?;
        writeln!(
            f,
            "    {}: {}",
            "State".cyan(),
            if self.compiled { "compiled" } else { "building" }
        )?;
        writeln!(
            f,
            "    {}: [{}]",
            "Symbols".cyan(),
            self.symbols.keys().sorted().join(", ")
        )?;
        write!(f, "}}")
    }
}

/// Whether any call in the expression opts out of IR verification.
fn expression_disables_verify(e: &Expression) -> bool {
    e.post_order().into_iter().any(|node| match node {
        Expression::Call(c) => c.func().disable_verify(),
        _ => false,
    })
}

/// Maps a canonical runtime symbol back to its function kind.
fn func_from_name(name: &str) -> Option<Func> {
    match name {
        "sin" => Some(Func::Sin),
        "cos" => Some(Func::Cos),
        "tan" => Some(Func::Tan),
        "asin" => Some(Func::Asin),
        "acos" => Some(Func::Acos),
        "atan" => Some(Func::Atan),
        "atan2" => Some(Func::Atan2),
        "pow" => Some(Func::Pow),
        "exp" => Some(Func::Exp),
        "exp2" => Some(Func::Exp2),
        "log" => Some(Func::Log),
        "log2" => Some(Func::Log2),
        "log10" => Some(Func::Log10),
        "sqrt" => Some(Func::Sqrt),
        "fabs" => Some(Func::Abs),
        _ => None,
    }
}
