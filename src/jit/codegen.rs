//! Trace-to-Cranelift code generation
//!
//! Every trace gets its own `JITModule`, so the code of a retired trace can be
//! released independently of the others. A trace lowers to one function:
//!
//! 1. load every control-point variable from `vars`
//! 2. emit the trace's ops as straight-line SSA
//! 3. branch each guard to a side-exit block that spills the active frames to
//!    `deopt` and returns `guard_id + 1`
//! 4. store the written control-point variables back and return `0`

use std::sync::atomic::{AtomicU64, Ordering};

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use tracing::debug;

use super::runtime::{metatrace_host_call, HOST_CALL_SYMBOL};
use super::{CompileError, CompiledTrace, TraceCompiler, TraceEntry};
use crate::config::IrStage;
use crate::diag::Diagnostics;
use crate::trace::{
    byte_mask, BinOpKind, GuardCheck, GuardId, Trace, TraceOp, TraceOperand, VarIdx,
};

const WORD_BYTES: i32 = 8;

/// Cranelift backend for closed traces.
#[derive(Debug, Default)]
pub struct CraneliftCompiler {
    /// Counter for generating unique function names
    counter: AtomicU64,
}

impl CraneliftCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_module() -> Result<JITModule, CompileError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CompileError::Backend(format!("Failed to set opt_level: {}", e)))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| CompileError::Backend(format!("Failed to create ISA builder: {}", e)))?;

        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CompileError::Backend(format!("Failed to create ISA: {}", e)))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol(HOST_CALL_SYMBOL, metatrace_host_call as *const u8);

        Ok(JITModule::new(builder))
    }
}

impl TraceCompiler for CraneliftCompiler {
    fn compile(&self, trace: &Trace, diag: &Diagnostics) -> Result<CompiledTrace, CompileError> {
        let mut module = Self::make_module()?;
        let ptr_ty = module.target_config().pointer_type();

        // __metatrace_host_call(host: *mut c_void, func: i64, args: *const Word, nargs: i64) -> Word
        let mut host_sig = module.make_signature();
        host_sig.params.push(AbiParam::new(ptr_ty));
        host_sig.params.push(AbiParam::new(types::I64));
        host_sig.params.push(AbiParam::new(ptr_ty));
        host_sig.params.push(AbiParam::new(types::I64));
        host_sig.returns.push(AbiParam::new(types::I64));
        let host_id = module
            .declare_function(HOST_CALL_SYMBOL, Linkage::Import, &host_sig)
            .map_err(|e| {
                CompileError::Backend(format!("Failed to declare {}: {}", HOST_CALL_SYMBOL, e))
            })?;

        let name = format!(
            "__metatrace_trace_{}",
            self.counter.fetch_add(1, Ordering::Relaxed)
        );

        // fn(vars: *mut Word, deopt: *mut Word, host: *mut c_void) -> u64
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(ptr_ty));
        sig.returns.push(AbiParam::new(types::I64));
        let func_id = module
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| CompileError::Backend(format!("Failed to declare function: {}", e)))?;

        let mut ctx = module.make_context();
        ctx.func.signature = sig;
        {
            let mut func_ctx = FunctionBuilderContext::new();
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut func_ctx);
            let host_call = module.declare_func_in_func(host_id, builder.func);

            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let params = builder.block_params(entry).to_vec();

            let mut lowering = TraceLowering {
                builder,
                vals: vec![None; trace.nvars as usize],
                host_call,
                ptr_ty,
                vars_ptr: params[0],
                deopt_ptr: params[1],
                host_ptr: params[2],
            };
            lowering.lower(trace)?;
            lowering.builder.finalize();
        }

        diag.dump_ir(IrStage::PreOptimization, &ctx.func.display().to_string());

        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::Backend(format!("Failed to define function: {}", e)))?;
        module.clear_context(&mut ctx);

        module.finalize_definitions().map_err(|e| {
            CompileError::Backend(format!("Failed to finalize definitions: {}", e))
        })?;

        let code_ptr = module.get_finalized_function(func_id);
        // SAFETY: the function was declared with exactly this signature.
        let entry: TraceEntry = unsafe { std::mem::transmute::<*const u8, TraceEntry>(code_ptr) };

        debug!(
            location = %trace.loc,
            function = %name,
            ops = trace.ops.len(),
            guards = trace.guards.len(),
            "compiled trace"
        );

        // SAFETY: `entry` lives in `module`, which the artifact keeps alive.
        Ok(unsafe { CompiledTrace::new(name, trace, entry, Box::new(JitMemory(Some(module)))) })
    }
}

/// Owns the code memory of one compiled trace.
struct JitMemory(Option<JITModule>);

// Safety: the module is only touched again when it is freed on drop, and the
// code it holds is immutable once finalized.
unsafe impl Send for JitMemory {}
unsafe impl Sync for JitMemory {}

impl Drop for JitMemory {
    fn drop(&mut self) {
        if let Some(module) = self.0.take() {
            // SAFETY: the only pointer into this module's code is the entry of
            // the `CompiledTrace` that owns us, and that is being dropped.
            unsafe { module.free_memory() };
        }
    }
}

struct TraceLowering<'a> {
    builder: FunctionBuilder<'a>,
    vals: Vec<Option<Value>>,
    host_call: codegen::ir::FuncRef,
    ptr_ty: Type,
    vars_ptr: Value,
    deopt_ptr: Value,
    host_ptr: Value,
}

impl TraceLowering<'_> {
    fn lower(&mut self, trace: &Trace) -> Result<(), CompileError> {
        for slot in 0..trace.entry.nslots {
            let v = self.builder.ins().load(
                types::I64,
                MemFlags::trusted(),
                self.vars_ptr,
                slot as i32 * WORD_BYTES,
            );
            self.vals[slot as usize] = Some(v);
        }

        for op in &trace.ops {
            self.lower_op(trace, op)?;
        }

        for &slot in &trace.live_out {
            let v = self.get(slot)?;
            self.builder
                .ins()
                .store(MemFlags::trusted(), v, self.vars_ptr, slot as i32 * WORD_BYTES);
        }
        let done = self.builder.ins().iconst(types::I64, 0);
        self.builder.ins().return_(&[done]);
        Ok(())
    }

    fn get(&self, var: VarIdx) -> Result<Value, CompileError> {
        self.vals
            .get(var as usize)
            .copied()
            .flatten()
            .ok_or(CompileError::UndefinedVar(var))
    }

    fn set(&mut self, var: VarIdx, v: Value) -> Result<(), CompileError> {
        let slot = self
            .vals
            .get_mut(var as usize)
            .ok_or(CompileError::UndefinedVar(var))?;
        *slot = Some(v);
        Ok(())
    }

    fn lower_op(&mut self, trace: &Trace, op: &TraceOp) -> Result<(), CompileError> {
        match op {
            TraceOp::Const { dst, value } => {
                let v = self.builder.ins().iconst(types::I64, *value);
                self.set(*dst, v)
            }
            TraceOp::Copy { dst, src } => {
                let v = self.get(*src)?;
                self.set(*dst, v)
            }
            TraceOp::BinOp { kind, dst, lhs, rhs } => {
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let v = self.binop(*kind, a, b);
                self.set(*dst, v)
            }
            TraceOp::CopyBytes { dst, src, len } => {
                let (d, s) = (self.get(*dst)?, self.get(*src)?);
                let mask = byte_mask(*len);
                let kept = self.builder.ins().band_imm(d, !mask);
                let copied = self.builder.ins().band_imm(s, mask);
                let v = self.builder.ins().bor(kept, copied);
                self.set(*dst, v)
            }
            TraceOp::HostCall { func, args, dst } => {
                let args_ptr = if args.is_empty() {
                    self.builder.ins().iconst(self.ptr_ty, 0)
                } else {
                    let args_slot = self.builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        args.len() as u32 * WORD_BYTES as u32,
                        3,
                    ));
                    for (i, arg) in args.iter().enumerate() {
                        let v = match *arg {
                            TraceOperand::Var(var) => self.get(var)?,
                            TraceOperand::Const(c) => self.builder.ins().iconst(types::I64, c),
                        };
                        self.builder
                            .ins()
                            .stack_store(v, args_slot, i as i32 * WORD_BYTES);
                    }
                    self.builder.ins().stack_addr(self.ptr_ty, args_slot, 0)
                };
                let func_val = self.builder.ins().iconst(types::I64, *func as i64);
                let nargs = self.builder.ins().iconst(types::I64, args.len() as i64);
                let call = self.builder.ins().call(
                    self.host_call,
                    &[self.host_ptr, func_val, args_ptr, nargs],
                );
                let result = self.builder.inst_results(call)[0];
                match dst {
                    Some(dst) => self.set(*dst, result),
                    None => Ok(()),
                }
            }
            TraceOp::Guard { id, var, check } => {
                let v = self.get(*var)?;
                self.guard(trace, *id, v, check)
            }
            // Frames are bookkeeping for side exits; their locals are ordinary
            // trace variables.
            TraceOp::EnterFrame { .. } | TraceOp::LeaveFrame => Ok(()),
        }
    }

    fn binop(&mut self, kind: BinOpKind, a: Value, b: Value) -> Value {
        let cc = match kind {
            BinOpKind::Add => return self.builder.ins().iadd(a, b),
            BinOpKind::Sub => return self.builder.ins().isub(a, b),
            BinOpKind::Mul => return self.builder.ins().imul(a, b),
            BinOpKind::And => return self.builder.ins().band(a, b),
            BinOpKind::Or => return self.builder.ins().bor(a, b),
            BinOpKind::Xor => return self.builder.ins().bxor(a, b),
            BinOpKind::Eq => IntCC::Equal,
            BinOpKind::Ne => IntCC::NotEqual,
            BinOpKind::Lt => IntCC::SignedLessThan,
            BinOpKind::Le => IntCC::SignedLessThanOrEqual,
            BinOpKind::Gt => IntCC::SignedGreaterThan,
            BinOpKind::Ge => IntCC::SignedGreaterThanOrEqual,
        };
        let flag = self.builder.ins().icmp(cc, a, b);
        self.builder.ins().uextend(types::I64, flag)
    }

    fn guard(
        &mut self,
        trace: &Trace,
        id: GuardId,
        v: Value,
        check: &GuardCheck,
    ) -> Result<(), CompileError> {
        let site = trace
            .guards
            .get(id as usize)
            .ok_or(CompileError::MissingGuardSite(id))?;

        let holds = match check {
            GuardCheck::NonZero => self.builder.ins().icmp_imm(IntCC::NotEqual, v, 0),
            GuardCheck::Zero => self.builder.ins().icmp_imm(IntCC::Equal, v, 0),
            GuardCheck::Equals(expected) => {
                self.builder.ins().icmp_imm(IntCC::Equal, v, *expected)
            }
            GuardCheck::NoneOf(cases) => {
                let mut acc = self.builder.ins().iconst(types::I8, 1);
                for case in cases {
                    let ne = self.builder.ins().icmp_imm(IntCC::NotEqual, v, *case);
                    acc = self.builder.ins().band(acc, ne);
                }
                acc
            }
        };

        let continue_block = self.builder.create_block();
        let exit_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(holds, continue_block, &[], exit_block, &[]);

        // Side exit: spill every variable of every active frame.
        self.builder.switch_to_block(exit_block);
        self.builder.seal_block(exit_block);
        for frame in &site.frames {
            for var in frame.base..frame.base + frame.nlocals {
                let val = self.get(var)?;
                self.builder.ins().store(
                    MemFlags::trusted(),
                    val,
                    self.deopt_ptr,
                    var as i32 * WORD_BYTES,
                );
            }
        }
        let code = self.builder.ins().iconst(types::I64, id as i64 + 1);
        self.builder.ins().return_(&[code]);

        self.builder.switch_to_block(continue_block);
        self.builder.seal_block(continue_block);
        Ok(())
    }
}
