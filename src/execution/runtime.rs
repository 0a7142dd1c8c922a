use super::{
    import::{Caller, ProcExit},
    numeric,
    store::{ExternalFuncInst, FuncAddr, FuncInst, InstanceAddr, InternalFuncInst, MemoryInst, Store},
    value::{pop, pop_i32, Label, LabelKind, Value},
};
use crate::{
    binary::{
        instruction::{Instruction, LoadKind, StoreKind},
        module::ModuleDefinition,
        types::BlockType,
    },
    error::{FrameInfo, Trap, TrapKind},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

/// Cooperative cancellation flag. Checked at every loop iteration and
/// every call; a running execution then traps with `Cancelled` and the flag
/// is cleared.
///
/// The flag is latched: a request made while nothing runs cancels the next
/// execution, so an interrupt racing the start of a call is never lost. Use
/// [`InterruptHandle::reset`] to withdraw a pending request.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Withdraws a request no execution has consumed yet.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub max_call_depth: usize,
    pub interrupt: InterruptHandle,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            interrupt: InterruptHandle::default(),
        }
    }
}

pub struct Frame {
    pub pc: usize,
    pub sp: usize,
    pub arity: usize,
    pub labels: Vec<Label>,
    pub locals: Vec<Value>,
    pub instance: InstanceAddr,
    pub definition: Arc<ModuleDefinition>,
    pub code_idx: usize,
    pub func_idx: u32,
}

enum Control {
    Call(FuncAddr),
    Return,
}

/// Runs the function at `addr` with `args` already type-checked by the
/// caller and returns its results.
pub fn invoke(
    store: &mut Store,
    addr: FuncAddr,
    args: &[Value],
    options: &ExecutionOptions,
) -> Result<Vec<Value>, Trap> {
    let mut runtime = Runtime {
        store,
        stack: args.to_vec(),
        call_stack: vec![],
        options,
    };
    runtime.invoke(addr)?;
    Ok(runtime.stack)
}

struct Runtime<'a> {
    store: &'a mut Store,
    stack: Vec<Value>,
    /// Suspended callers; the running frame is held by `execute`.
    call_stack: Vec<Frame>,
    options: &'a ExecutionOptions,
}

impl Runtime<'_> {
    fn invoke(&mut self, addr: FuncAddr) -> Result<(), Trap> {
        if self.options.interrupt.take() {
            return Err(TrapKind::Cancelled.into());
        }
        let func = self
            .store
            .funcs
            .get(addr)
            .cloned()
            .ok_or(TrapKind::Malformed("dangling function address"))?;
        match func {
            FuncInst::External(func) => Ok(self.invoke_external(&func, None)?),
            FuncInst::Internal(func) => {
                let frame = self.new_frame(&func)?;
                self.execute(frame)
            }
        }
    }

    fn new_frame(&mut self, func: &InternalFuncInst) -> Result<Frame, TrapKind> {
        let body = func
            .body()
            .ok_or(TrapKind::Malformed("missing function body"))?;
        let bottom = self
            .stack
            .len()
            .checked_sub(func.func_type.params.len())
            .ok_or(TrapKind::Malformed("missing call arguments"))?;
        let mut locals = self.stack.split_off(bottom);
        for local in &body.locals {
            locals.extend(std::iter::repeat_n(
                Value::default_for(local.value_type),
                local.type_count as usize,
            ));
        }

        Ok(Frame {
            pc: 0,
            sp: self.stack.len(),
            arity: func.func_type.results.len(),
            labels: vec![],
            locals,
            instance: func.instance,
            definition: Arc::clone(&func.definition),
            code_idx: func.code_idx,
            func_idx: func.func_idx,
        })
    }

    fn execute(&mut self, mut frame: Frame) -> Result<(), Trap> {
        loop {
            match self.run_frame(&mut frame) {
                Ok(Control::Return) => {
                    if let Err(kind) = stack_unwind(&mut self.stack, frame.sp, frame.arity) {
                        return Err(self.trap(kind, &frame));
                    }
                    match self.call_stack.pop() {
                        Some(caller) => frame = caller,
                        None => return Ok(()),
                    }
                }
                Ok(Control::Call(addr)) => match self.call(addr, &frame) {
                    Ok(Some(callee)) => {
                        self.call_stack.push(frame);
                        frame = callee;
                    }
                    Ok(None) => {}
                    Err(kind) => return Err(self.trap(kind, &frame)),
                },
                Err(kind) => return Err(self.trap(kind, &frame)),
            }
        }
    }

    /// Starts a call from `frame`. Host functions run to completion here;
    /// internal functions return the frame to run next.
    fn call(&mut self, addr: FuncAddr, frame: &Frame) -> Result<Option<Frame>, TrapKind> {
        if self.options.interrupt.take() {
            return Err(TrapKind::Cancelled);
        }
        let func = self
            .store
            .funcs
            .get(addr)
            .cloned()
            .ok_or(TrapKind::Malformed("dangling function address"))?;
        match func {
            FuncInst::External(func) => {
                self.invoke_external(&func, Some(frame.instance))?;
                Ok(None)
            }
            FuncInst::Internal(func) => {
                if self.call_stack.len() + 2 > self.options.max_call_depth {
                    return Err(TrapKind::StackExhausted);
                }
                Ok(Some(self.new_frame(&func)?))
            }
        }
    }

    fn invoke_external(
        &mut self,
        func: &ExternalFuncInst,
        instance: Option<InstanceAddr>,
    ) -> Result<(), TrapKind> {
        let bottom = self
            .stack
            .len()
            .checked_sub(func.func_type.params.len())
            .ok_or(TrapKind::Malformed("missing call arguments"))?;
        let args = self.stack.split_off(bottom);

        let mut caller = Caller::new(self.store, instance);
        let results = (func.func)(&mut caller, &args).map_err(|err| {
            match err.downcast_ref::<ProcExit>() {
                Some(ProcExit(code)) => TrapKind::Exit(*code),
                None => TrapKind::HostCallFailed(format!("{}.{}: {err:#}", func.module, func.field)),
            }
        })?;

        let declared = &func.func_type.results;
        if results.len() != declared.len()
            || results.iter().zip(declared).any(|(value, ty)| !value.matches(*ty))
        {
            let actual = results
                .iter()
                .map(|v| v.value_type().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TrapKind::HostCallFailed(format!(
                "{}.{} returned ({actual}), declared {}",
                func.module, func.field, func.func_type
            )));
        }
        self.stack.extend(results);
        Ok(())
    }

    fn trap(&self, kind: TrapKind, frame: &Frame) -> Trap {
        let frames: Vec<FrameInfo> = std::iter::once(frame)
            .chain(self.call_stack.iter().rev())
            .map(|f| FrameInfo {
                module: self
                    .store
                    .instances
                    .get(f.instance)
                    .map(|instance| instance.name.clone())
                    .unwrap_or_default(),
                func_idx: f.func_idx,
            })
            .collect();
        debug!(kind = %kind, frame = %frames[0], depth = frames.len(), "trap");
        Trap { kind, frames }
    }

    fn memory(&mut self, instance: InstanceAddr) -> Result<&mut MemoryInst, TrapKind> {
        let addr = self
            .store
            .instances
            .get(instance)
            .and_then(|inst| inst.memories.first().copied())
            .ok_or(TrapKind::Malformed("no memory"))?;
        self.store
            .memories
            .get_mut(addr)
            .ok_or(TrapKind::Malformed("dangling memory address"))
    }

    fn func_addr(&self, instance: InstanceAddr, idx: u32) -> Result<FuncAddr, TrapKind> {
        self.store
            .instances
            .get(instance)
            .and_then(|inst| inst.funcs.get(idx as usize).copied())
            .ok_or(TrapKind::Malformed("unknown function"))
    }

    fn global_addr(&self, instance: InstanceAddr, idx: u32) -> Result<usize, TrapKind> {
        self.store
            .instances
            .get(instance)
            .and_then(|inst| inst.globals.get(idx as usize).copied())
            .ok_or(TrapKind::Malformed("unknown global"))
    }

    /// Runs `frame` until it returns or calls another function.
    fn run_frame(&mut self, frame: &mut Frame) -> Result<Control, TrapKind> {
        let definition = Arc::clone(&frame.definition);
        let insts = &definition
            .code
            .get(frame.code_idx)
            .ok_or(TrapKind::Malformed("missing function body"))?
            .code;

        loop {
            let Some(inst) = insts.get(frame.pc) else {
                return Ok(Control::Return);
            };
            frame.pc += 1;

            match inst {
                Instruction::Unreachable => return Err(TrapKind::Unreachable),
                Instruction::Nop => {}
                Instruction::Block { block_type, end } => {
                    let (params, results) = block_arity(&definition, *block_type)?;
                    let label = Label {
                        kind: LabelKind::Block,
                        pc: end + 1,
                        sp: self.label_sp(params)?,
                        arity: results,
                        results,
                    };
                    frame.labels.push(label);
                }
                Instruction::Loop { block_type } => {
                    if self.options.interrupt.take() {
                        return Err(TrapKind::Cancelled);
                    }
                    let (params, results) = block_arity(&definition, *block_type)?;
                    let label = Label {
                        kind: LabelKind::Loop,
                        pc: frame.pc - 1,
                        sp: self.label_sp(params)?,
                        arity: params,
                        results,
                    };
                    frame.labels.push(label);
                }
                Instruction::If {
                    block_type,
                    else_pc,
                    end,
                } => {
                    let cond = pop_i32(&mut self.stack)?;
                    let (params, results) = block_arity(&definition, *block_type)?;
                    let label = Label {
                        kind: LabelKind::If,
                        pc: end + 1,
                        sp: self.label_sp(params)?,
                        arity: results,
                        results,
                    };
                    if cond != 0 {
                        frame.labels.push(label);
                    } else if let Some(else_pc) = else_pc {
                        frame.labels.push(label);
                        frame.pc = else_pc + 1;
                    } else {
                        frame.pc = end + 1;
                    }
                }
                Instruction::Else { end } => {
                    // end of the then-branch
                    let label = frame
                        .labels
                        .pop()
                        .ok_or(TrapKind::Malformed("else without label"))?;
                    stack_unwind(&mut self.stack, label.sp, label.results)?;
                    frame.pc = end + 1;
                }
                Instruction::End => match frame.labels.pop() {
                    Some(label) => stack_unwind(&mut self.stack, label.sp, label.results)?,
                    None => return Ok(Control::Return),
                },
                Instruction::Br(depth) => {
                    if let Some(control) = self.branch(frame, *depth)? {
                        return Ok(control);
                    }
                }
                Instruction::BrIf(depth) => {
                    if pop_i32(&mut self.stack)? != 0 {
                        if let Some(control) = self.branch(frame, *depth)? {
                            return Ok(control);
                        }
                    }
                }
                Instruction::BrTable { targets, default } => {
                    let idx = pop_i32(&mut self.stack)? as u32 as usize;
                    let depth = targets.get(idx).unwrap_or(default);
                    if let Some(control) = self.branch(frame, *depth)? {
                        return Ok(control);
                    }
                }
                Instruction::Return => return Ok(Control::Return),
                Instruction::Call(idx) => {
                    return Ok(Control::Call(self.func_addr(frame.instance, *idx)?));
                }
                Instruction::CallIndirect {
                    type_idx,
                    table_idx,
                } => {
                    let elem_idx = pop_i32(&mut self.stack)? as u32;
                    let instance = self
                        .store
                        .instances
                        .get(frame.instance)
                        .ok_or(TrapKind::Malformed("dangling instance"))?;
                    let expected = instance
                        .types
                        .get(*type_idx as usize)
                        .ok_or(TrapKind::Malformed("unknown type"))?;
                    let table = instance
                        .tables
                        .get(*table_idx as usize)
                        .and_then(|addr| self.store.tables.get(*addr))
                        .ok_or(TrapKind::Malformed("unknown table"))?;
                    let addr = table.get(elem_idx)?;
                    let func = self
                        .store
                        .funcs
                        .get(addr)
                        .ok_or(TrapKind::UninitializedElement)?;
                    if func.func_type() != expected {
                        return Err(TrapKind::IndirectCallTypeMismatch);
                    }
                    return Ok(Control::Call(addr));
                }
                Instruction::Drop => {
                    pop(&mut self.stack)?;
                }
                Instruction::Select(_) => {
                    let cond = pop_i32(&mut self.stack)?;
                    let second = pop(&mut self.stack)?;
                    let first = pop(&mut self.stack)?;
                    self.stack.push(if cond != 0 { first } else { second });
                }
                Instruction::LocalGet(idx) => {
                    let value = *frame
                        .locals
                        .get(*idx as usize)
                        .ok_or(TrapKind::Malformed("unknown local"))?;
                    self.stack.push(value);
                }
                Instruction::LocalSet(idx) => {
                    let value = pop(&mut self.stack)?;
                    let local = frame
                        .locals
                        .get_mut(*idx as usize)
                        .ok_or(TrapKind::Malformed("unknown local"))?;
                    *local = value;
                }
                Instruction::LocalTee(idx) => {
                    let value = *self
                        .stack
                        .last()
                        .ok_or(TrapKind::Malformed("operand stack underflow"))?;
                    let local = frame
                        .locals
                        .get_mut(*idx as usize)
                        .ok_or(TrapKind::Malformed("unknown local"))?;
                    *local = value;
                }
                Instruction::GlobalGet(idx) => {
                    let addr = self.global_addr(frame.instance, *idx)?;
                    let global = self
                        .store
                        .globals
                        .get(addr)
                        .ok_or(TrapKind::Malformed("dangling global address"))?;
                    self.stack.push(global.value);
                }
                Instruction::GlobalSet(idx) => {
                    let value = pop(&mut self.stack)?;
                    let addr = self.global_addr(frame.instance, *idx)?;
                    let global = self
                        .store
                        .globals
                        .get_mut(addr)
                        .ok_or(TrapKind::Malformed("dangling global address"))?;
                    if !value.matches(global.ty.value_type) {
                        return Err(TrapKind::Malformed("global type mismatch"));
                    }
                    global.value = value;
                }
                Instruction::Load { kind, memarg } => {
                    let addr = pop_i32(&mut self.stack)? as u32;
                    let memory = self.memory(frame.instance)?;
                    let value = load(memory, *kind, addr, memarg.offset)?;
                    self.stack.push(value);
                }
                Instruction::Store { kind, memarg } => {
                    let value = pop(&mut self.stack)?;
                    let addr = pop_i32(&mut self.stack)? as u32;
                    let memory = self.memory(frame.instance)?;
                    store(memory, *kind, addr, memarg.offset, value)?;
                }
                Instruction::MemorySize => {
                    let size = self.memory(frame.instance)?.size();
                    self.stack.push(Value::I32(size as i32));
                }
                Instruction::MemoryGrow => {
                    let delta = pop_i32(&mut self.stack)? as u32;
                    let memory = self.memory(frame.instance)?;
                    let result = memory.grow(delta).map(|old| old as i32).unwrap_or(-1);
                    self.stack.push(Value::I32(result));
                }
                Instruction::MemoryCopy => {
                    let len = pop_i32(&mut self.stack)? as u32;
                    let src = pop_i32(&mut self.stack)? as u32;
                    let dst = pop_i32(&mut self.stack)? as u32;
                    self.memory(frame.instance)?.copy(dst, src, len)?;
                }
                Instruction::MemoryFill => {
                    let len = pop_i32(&mut self.stack)? as u32;
                    let value = pop_i32(&mut self.stack)? as u8;
                    let dst = pop_i32(&mut self.stack)? as u32;
                    self.memory(frame.instance)?.fill(dst, value, len)?;
                }
                Instruction::I32Const(value) => self.stack.push(Value::I32(*value)),
                Instruction::I64Const(value) => self.stack.push(Value::I64(*value)),
                Instruction::F32Const(bits) => self.stack.push(Value::F32(f32::from_bits(*bits))),
                Instruction::F64Const(bits) => self.stack.push(Value::F64(f64::from_bits(*bits))),
                Instruction::Numeric(op) => numeric::eval(*op, &mut self.stack)?,
                Instruction::TruncSat(op) => numeric::trunc_sat(*op, &mut self.stack)?,
            }
        }
    }

    fn label_sp(&self, params: usize) -> Result<usize, TrapKind> {
        self.stack
            .len()
            .checked_sub(params)
            .ok_or(TrapKind::Malformed("missing block parameters"))
    }

    /// Branches to the label `depth` levels out. The outermost level is the
    /// function body itself, for which the branch acts as `return`.
    fn branch(&mut self, frame: &mut Frame, depth: u32) -> Result<Option<Control>, TrapKind> {
        let depth = depth as usize;
        if depth == frame.labels.len() {
            return Ok(Some(Control::Return));
        }
        let idx = frame
            .labels
            .len()
            .checked_sub(depth + 1)
            .ok_or(TrapKind::Malformed("branch depth out of range"))?;
        let label = frame.labels[idx].clone();
        frame.labels.truncate(idx);
        stack_unwind(&mut self.stack, label.sp, label.arity)?;
        frame.pc = label.pc;
        Ok(None)
    }
}

fn block_arity(
    definition: &ModuleDefinition,
    block_type: BlockType,
) -> Result<(usize, usize), TrapKind> {
    definition
        .block_arity(block_type)
        .ok_or(TrapKind::Malformed("unknown block type"))
}

/// Drops everything above `sp` except the top `arity` values.
pub fn stack_unwind(stack: &mut Vec<Value>, sp: usize, arity: usize) -> Result<(), TrapKind> {
    let keep_from = stack
        .len()
        .checked_sub(arity)
        .filter(|&keep_from| keep_from >= sp)
        .ok_or(TrapKind::Malformed("operand stack underflow"))?;
    stack.drain(sp..keep_from);
    Ok(())
}

fn load(memory: &MemoryInst, kind: LoadKind, addr: u32, offset: u32) -> Result<Value, TrapKind> {
    use LoadKind::*;
    let value = match kind {
        I32Load => Value::I32(i32::from_le_bytes(memory.load(addr, offset)?)),
        I64Load => Value::I64(i64::from_le_bytes(memory.load(addr, offset)?)),
        F32Load => Value::F32(f32::from_le_bytes(memory.load(addr, offset)?)),
        F64Load => Value::F64(f64::from_le_bytes(memory.load(addr, offset)?)),
        I32Load8S => Value::I32(i8::from_le_bytes(memory.load(addr, offset)?).into()),
        I32Load8U => Value::I32(u8::from_le_bytes(memory.load(addr, offset)?).into()),
        I32Load16S => Value::I32(i16::from_le_bytes(memory.load(addr, offset)?).into()),
        I32Load16U => Value::I32(u16::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load8S => Value::I64(i8::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load8U => Value::I64(u8::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load16S => Value::I64(i16::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load16U => Value::I64(u16::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load32S => Value::I64(i32::from_le_bytes(memory.load(addr, offset)?).into()),
        I64Load32U => Value::I64(u32::from_le_bytes(memory.load(addr, offset)?).into()),
    };
    Ok(value)
}

fn store(
    memory: &mut MemoryInst,
    kind: StoreKind,
    addr: u32,
    offset: u32,
    value: Value,
) -> Result<(), TrapKind> {
    use StoreKind::*;
    match (kind, value) {
        (I32Store, Value::I32(v)) => memory.store(addr, offset, &v.to_le_bytes()),
        (I32Store8, Value::I32(v)) => memory.store(addr, offset, &(v as u8).to_le_bytes()),
        (I32Store16, Value::I32(v)) => memory.store(addr, offset, &(v as u16).to_le_bytes()),
        (I64Store, Value::I64(v)) => memory.store(addr, offset, &v.to_le_bytes()),
        (I64Store8, Value::I64(v)) => memory.store(addr, offset, &(v as u8).to_le_bytes()),
        (I64Store16, Value::I64(v)) => memory.store(addr, offset, &(v as u16).to_le_bytes()),
        (I64Store32, Value::I64(v)) => memory.store(addr, offset, &(v as u32).to_le_bytes()),
        (F32Store, Value::F32(v)) => memory.store(addr, offset, &v.to_le_bytes()),
        (F64Store, Value::F64(v)) => memory.store(addr, offset, &v.to_le_bytes()),
        _ => Err(TrapKind::Malformed("store operand type mismatch")),
    }
}
