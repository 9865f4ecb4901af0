//! Cranelift lowering of bytecode units.
//!
//! The evaluation stack is resolved at compile time: each stack slot becomes
//! an SSA value, and every branch target becomes a block whose parameters
//! carry the stack across the edge. Arguments and locals are frontend
//! variables.

use std::collections::HashMap;
use std::fmt;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::I64;
use cranelift_codegen::ir::{AbiParam, Block, Function, InstBuilder, MemFlags, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use tracing::{debug, warn};

use crate::emit::{CodeUnit, Instr};
use crate::node::{ArithOp, CmpOp};
use crate::types::Type;
use crate::value::{Overflow, Value};

type IrValue = cranelift_codegen::ir::Value;

/// Machine code for one unit. Owns the Cranelift module (code memory) and
/// holds the raw function pointer.
pub struct NativeCode {
    _module: JITModule,
    ptr: *const u8,
    params: Vec<Kind>,
    ret: Kind,
}

// SAFETY: JITModule owns the code memory. ptr is valid for the module's lifetime
// and the generated code touches nothing but its argument buffer.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

impl NativeCode {
    /// Runs the machine code, or returns `None` if `args` do not have the
    /// native representation the code was compiled for.
    pub fn call(&self, args: &[Value]) -> Option<Value> {
        if args.len() != self.params.len() {
            return None;
        }
        let slots = args
            .iter()
            .zip(&self.params)
            .map(|(arg, kind)| kind.to_slot(arg))
            .collect::<Option<Vec<i64>>>()?;
        let f: unsafe extern "C" fn(*const i64) -> i64 = unsafe { std::mem::transmute(self.ptr) };
        let raw = unsafe { f(slots.as_ptr()) };
        Some(self.ret.from_slot(raw))
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Debug for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCode")
            .field("params", &self.params)
            .field("ret", &self.ret)
            .finish()
    }
}

/// Native representation of a slot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Bool,
}

impl Kind {
    fn of(ty: &Type) -> Option<Self> {
        match ty {
            Type::I64 => Some(Kind::Int),
            Type::Bool => Some(Kind::Bool),
            _ => None,
        }
    }

    fn to_slot(self, value: &Value) -> Option<i64> {
        match (self, value) {
            (Kind::Int, Value::I64(n)) => Some(*n),
            (Kind::Bool, Value::Bool(b)) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn from_slot(self, raw: i64) -> Value {
        match self {
            Kind::Int => Value::I64(raw),
            Kind::Bool => Value::Bool(raw != 0),
        }
    }
}

/// Lowers `unit` to machine code.
///
/// Returns `None` when the unit has no native form or has more than
/// `max_instructions` instructions. Codegen failures are logged and also
/// yield `None`; the unit then runs on the VM.
pub fn compile_unit(unit: &CodeUnit, max_instructions: usize) -> Option<NativeCode> {
    if unit.has_closure() || !unit.handlers().is_empty() {
        return None;
    }
    if unit.instrs().len() > max_instructions {
        debug!(
            event = "native_skip",
            unit = unit.name(),
            reason = "too many instructions"
        );
        return None;
    }
    let params = unit
        .params()
        .iter()
        .map(Kind::of)
        .collect::<Option<Vec<_>>>()?;
    let ret = Kind::of(unit.ret())?;

    match compile_function(unit, &params) {
        Ok((module, ptr)) => Some(NativeCode {
            _module: module,
            ptr,
            params,
            ret,
        }),
        Err(CodegenError::Unsupported(reason)) => {
            debug!(event = "native_skip", unit = unit.name(), reason);
            None
        }
        Err(e) => {
            warn!(event = "native_failed", unit = unit.name(), error = %e);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Internal codegen
// ---------------------------------------------------------------------------

fn make_jit_module() -> Result<JITModule, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| CodegenError::Codegen(e.to_string()))?;
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| CodegenError::Codegen(e.to_string()))?;
    let isa_builder =
        cranelift_native::builder().map_err(|e| CodegenError::Codegen(e.to_string()))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CodegenError::Codegen(e.to_string()))?;
    let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    Ok(JITModule::new(builder))
}

#[derive(Debug)]
enum CodegenError {
    /// The unit uses something without a native form.
    Unsupported(&'static str),
    Module(cranelift_module::ModuleError),
    Codegen(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Unsupported(what) => write!(f, "unsupported: {what}"),
            CodegenError::Module(e) => write!(f, "module: {e}"),
            CodegenError::Codegen(s) => write!(f, "codegen: {s}"),
        }
    }
}

impl From<cranelift_module::ModuleError> for CodegenError {
    fn from(e: cranelift_module::ModuleError) -> Self {
        CodegenError::Module(e)
    }
}

#[allow(clippy::result_large_err)]
fn compile_function(
    unit: &CodeUnit,
    params: &[Kind],
) -> Result<(JITModule, *const u8), CodegenError> {
    let locals = unit
        .locals()
        .iter()
        .map(Kind::of)
        .collect::<Option<Vec<_>>>()
        .ok_or(CodegenError::Unsupported("local type"))?;
    let depths = unit.stack_depths().map_err(CodegenError::Codegen)?;

    let mut module = make_jit_module()?;
    let ptr_type = module.target_config().pointer_type();

    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    sig.returns.push(AbiParam::new(I64));

    let func_id = module.declare_function(unit.name(), Linkage::Local, &sig)?;
    let mut func = Function::with_name_signature(UserFuncName::user(0, 0), sig);
    let mut func_ctx = FunctionBuilderContext::new();

    {
        let mut builder = FunctionBuilder::new(&mut func, &mut func_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);

        let base_ptr = builder.block_params(entry)[0];
        let mut slots = Vec::with_capacity(params.len() + locals.len());
        for (i, kind) in params.iter().enumerate() {
            let var = Variable::from_u32(slots.len() as u32);
            builder.declare_var(var, I64);
            let offset = (i as i32) * 8;
            let arg = builder.ins().load(I64, MemFlags::trusted(), base_ptr, offset);
            builder.def_var(var, arg);
            slots.push((var, *kind));
        }
        for kind in &locals {
            let var = Variable::from_u32(slots.len() as u32);
            builder.declare_var(var, I64);
            let zero = builder.ins().iconst(I64, 0);
            builder.def_var(var, zero);
            slots.push((var, *kind));
        }

        let mut lowering = Lowering {
            builder,
            blocks: HashMap::new(),
            entry_kinds: HashMap::new(),
            stack: Vec::new(),
            slots,
            arg_count: params.len(),
        };
        lowering.create_blocks(unit.instrs(), &depths);
        lowering.lower(unit.instrs(), &depths)?;
        lowering.builder.seal_all_blocks();
        lowering.builder.finalize();
    }

    let mut ctx = Context::for_function(func);
    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CodegenError::Codegen(e.to_string()))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(|e| CodegenError::Codegen(e.to_string()))?;

    let ptr = module.get_finalized_function(func_id);
    Ok((module, ptr))
}

struct Lowering<'a> {
    builder: FunctionBuilder<'a>,
    /// Block starting at each reachable branch target or fallthrough point.
    blocks: HashMap<usize, Block>,
    /// Kinds of the stack slots carried into each block.
    entry_kinds: HashMap<usize, Vec<Kind>>,
    stack: Vec<(IrValue, Kind)>,
    /// Arguments, then locals.
    slots: Vec<(Variable, Kind)>,
    arg_count: usize,
}

impl Lowering<'_> {
    fn create_blocks(&mut self, instrs: &[Instr], depths: &[Option<usize>]) {
        let mut starts = Vec::new();
        for (pc, instr) in instrs.iter().enumerate() {
            if let Some(target) = instr.branch_target() {
                starts.push(target);
                starts.push(pc + 1);
            } else if instr.ends_flow() {
                starts.push(pc + 1);
            }
        }
        for start in starts {
            let Some(Some(depth)) = depths.get(start) else {
                continue;
            };
            if self.blocks.contains_key(&start) {
                continue;
            }
            let block = self.builder.create_block();
            for _ in 0..*depth {
                self.builder.append_block_param(block, I64);
            }
            self.blocks.insert(start, block);
        }
    }

    fn lower(&mut self, instrs: &[Instr], depths: &[Option<usize>]) -> Result<(), CodegenError> {
        let mut open = true;
        for (pc, instr) in instrs.iter().enumerate() {
            if let Some(&block) = self.blocks.get(&pc) {
                if open {
                    self.jump_to(pc)?;
                }
                open = match self.entry_kinds.get(&pc) {
                    Some(kinds) => {
                        let kinds = kinds.clone();
                        self.builder.switch_to_block(block);
                        let params = self.builder.block_params(block).to_vec();
                        self.stack = params.into_iter().zip(kinds).collect();
                        true
                    }
                    None => false,
                };
            }
            if !open {
                if depths[pc].is_some() {
                    return Err(CodegenError::Unsupported("block entered only from below"));
                }
                continue;
            }
            open = self.lower_instr(pc, instr)?;
        }
        if open {
            return Err(CodegenError::Codegen("falls off the end".into()));
        }
        Ok(())
    }

    /// Lowers one instruction; returns false if it ends the current block.
    fn lower_instr(&mut self, pc: usize, instr: &Instr) -> Result<bool, CodegenError> {
        match instr {
            Instr::Nop => {}
            Instr::Const(Value::I64(n)) => {
                let v = self.builder.ins().iconst(I64, *n);
                self.stack.push((v, Kind::Int));
            }
            Instr::Const(Value::Bool(b)) => {
                let v = self.builder.ins().iconst(I64, i64::from(*b));
                self.stack.push((v, Kind::Bool));
            }
            Instr::LoadDefault(ty) => {
                let kind = Kind::of(ty).ok_or(CodegenError::Unsupported("default type"))?;
                let v = self.builder.ins().iconst(I64, 0);
                self.stack.push((v, kind));
            }
            Instr::LoadArg(i) => self.load_slot(*i as usize),
            Instr::StoreArg(i) => self.store_slot(*i as usize)?,
            Instr::LoadLocal(i) => self.load_slot(self.arg_count + *i as usize),
            Instr::StoreLocal(i) => self.store_slot(self.arg_count + *i as usize)?,
            Instr::Dup => {
                let top = *self.stack.last().ok_or(CodegenError::Codegen("dup".into()))?;
                self.stack.push(top);
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::Arith {
                op,
                overflow: Overflow::Wrap,
            } => {
                let (r, _) = self.pop()?;
                let (l, kind) = self.pop()?;
                let ins = self.builder.ins();
                let v = match op {
                    ArithOp::Add => ins.iadd(l, r),
                    ArithOp::Sub => ins.isub(l, r),
                    ArithOp::Mul => ins.imul(l, r),
                    ArithOp::And => ins.band(l, r),
                    ArithOp::Or => ins.bor(l, r),
                    ArithOp::Xor => ins.bxor(l, r),
                    ArithOp::Div | ArithOp::Rem => return Err(CodegenError::Unsupported("division")),
                    ArithOp::Shl | ArithOp::Shr => return Err(CodegenError::Unsupported("shift")),
                };
                self.stack.push((v, kind));
            }
            Instr::Neg(Overflow::Wrap) => {
                let (v, kind) = self.pop()?;
                let v = self.builder.ins().ineg(v);
                self.stack.push((v, kind));
            }
            Instr::Not => {
                let (v, kind) = self.pop()?;
                let v = match kind {
                    Kind::Bool => self.builder.ins().bxor_imm(v, 1),
                    Kind::Int => self.builder.ins().bnot(v),
                };
                self.stack.push((v, kind));
            }
            Instr::Cmp(op) => self.compare(int_cc(*op))?,
            Instr::GenericEq => self.compare(IntCC::Equal)?,
            Instr::Br(target) => {
                self.jump_to(*target)?;
                return Ok(false);
            }
            Instr::BrTrue(target) | Instr::BrFalse(target) => {
                let (cond, _) = self.pop()?;
                let (taken, taken_args) = self.edge(*target)?;
                let (next, next_args) = self.edge(pc + 1)?;
                if matches!(instr, Instr::BrTrue(_)) {
                    self.builder
                        .ins()
                        .brif(cond, taken, &taken_args, next, &next_args);
                } else {
                    self.builder
                        .ins()
                        .brif(cond, next, &next_args, taken, &taken_args);
                }
                return Ok(false);
            }
            Instr::Ret => {
                let (v, _) = self.pop()?;
                self.builder.ins().return_(&[v]);
                return Ok(false);
            }
            Instr::Const(_) => return Err(CodegenError::Unsupported("constant type")),
            Instr::Arith { .. } | Instr::Neg(_) => {
                return Err(CodegenError::Unsupported("checked arithmetic"))
            }
            _ => return Err(CodegenError::Unsupported("instruction")),
        }
        Ok(true)
    }

    fn pop(&mut self) -> Result<(IrValue, Kind), CodegenError> {
        self.stack
            .pop()
            .ok_or_else(|| CodegenError::Codegen("stack underflow".into()))
    }

    fn load_slot(&mut self, index: usize) {
        let (var, kind) = self.slots[index];
        let v = self.builder.use_var(var);
        self.stack.push((v, kind));
    }

    fn store_slot(&mut self, index: usize) -> Result<(), CodegenError> {
        let (v, _) = self.pop()?;
        let (var, _) = self.slots[index];
        self.builder.def_var(var, v);
        Ok(())
    }

    fn compare(&mut self, cc: IntCC) -> Result<(), CodegenError> {
        let (r, _) = self.pop()?;
        let (l, _) = self.pop()?;
        let cmp = self.builder.ins().icmp(cc, l, r);
        let v = self.builder.ins().uextend(I64, cmp);
        self.stack.push((v, Kind::Bool));
        Ok(())
    }

    /// Block at `target` and the current stack as its arguments; records the
    /// stack kinds the block is entered with.
    fn edge(&mut self, target: usize) -> Result<(Block, Vec<IrValue>), CodegenError> {
        let block = *self
            .blocks
            .get(&target)
            .ok_or_else(|| CodegenError::Codegen(format!("no block at {target}")))?;
        let kinds: Vec<Kind> = self.stack.iter().map(|(_, k)| *k).collect();
        match self.entry_kinds.get(&target) {
            Some(existing) if *existing != kinds => {
                return Err(CodegenError::Unsupported("mixed stack kinds at join"))
            }
            Some(_) => {}
            None => {
                self.entry_kinds.insert(target, kinds);
            }
        }
        Ok((block, self.stack.iter().map(|(v, _)| *v).collect()))
    }

    fn jump_to(&mut self, target: usize) -> Result<(), CodegenError> {
        let (block, args) = self.edge(target)?;
        self.builder.ins().jump(block, &args);
        Ok(())
    }
}

fn int_cc(op: CmpOp) -> IntCC {
    match op {
        CmpOp::Eq => IntCC::Equal,
        CmpOp::Ne => IntCC::NotEqual,
        CmpOp::Lt => IntCC::SignedLessThan,
        CmpOp::Le => IntCC::SignedLessThanOrEqual,
        CmpOp::Gt => IntCC::SignedGreaterThan,
        CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
    }
}
