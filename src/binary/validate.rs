//! Structural and type validation of a decoded module.
//!
//! Index and structure checks always run. Operand-stack typing of function
//! bodies runs only when requested, mirroring the `enable_validation` switch
//! of the host configuration.

use super::{
    instruction::Instruction,
    module::{ModuleDefinition, MAX_PAGES},
    section::{DataMode, Function},
    types::{BlockType, ConstExpr, ExportDesc, FuncType, ImportDesc, Limits, ValueType},
};
use crate::error::{LoadError, LoadErrorKind};
use std::collections::HashSet;

fn invalid_index(message: impl Into<String>) -> LoadError {
    LoadError::new(LoadErrorKind::InvalidIndex, message)
}

fn type_mismatch(message: impl Into<String>) -> LoadError {
    LoadError::new(LoadErrorKind::TypeMismatch, message)
}

fn malformed(message: impl Into<String>) -> LoadError {
    LoadError::new(LoadErrorKind::MalformedEncoding, message)
}

pub(crate) fn validate_module(
    module: &ModuleDefinition,
    check_operands: bool,
) -> Result<(), LoadError> {
    if module.functions.len() != module.code.len() {
        return Err(malformed(format!(
            "{} function declarations but {} bodies",
            module.functions.len(),
            module.code.len()
        )));
    }
    if let Some(count) = module.data_count {
        if count as usize != module.data.len() {
            return Err(malformed(format!(
                "data count {count} does not match {} data segments",
                module.data.len()
            )));
        }
    }

    for import in &module.imports {
        match import.desc {
            ImportDesc::Func(type_idx) => check_type_idx(module, type_idx)?,
            ImportDesc::Table(ty) => check_limits(&ty.limits, u32::MAX)?,
            ImportDesc::Memory(ty) => check_limits(&ty.limits, MAX_PAGES)?,
            ImportDesc::Global(_) => {}
        }
    }
    for &type_idx in &module.functions {
        check_type_idx(module, type_idx)?;
    }
    for table in &module.tables {
        check_limits(&table.limits, u32::MAX)?;
    }
    for memory in &module.memories {
        check_limits(&memory.limits, MAX_PAGES)?;
    }
    if module.total_memories() > 1 {
        return Err(LoadError::new(
            LoadErrorKind::Unsupported,
            "multiple memories",
        ));
    }

    for (idx, global) in module.globals.iter().enumerate() {
        let init_type = const_expr_type(module, &global.init)?;
        if init_type != global.ty.value_type {
            return Err(type_mismatch(format!(
                "global {idx}: initializer is {init_type}, declared {}",
                global.ty.value_type
            )));
        }
    }

    let mut names = HashSet::new();
    for export in &module.exports {
        if !names.insert(export.name.as_str()) {
            return Err(malformed(format!("duplicate export name `{}`", export.name)));
        }
        let (idx, count) = match export.desc {
            ExportDesc::Func(idx) => (idx, module.total_funcs()),
            ExportDesc::Table(idx) => (idx, module.total_tables()),
            ExportDesc::Memory(idx) => (idx, module.total_memories()),
            ExportDesc::Global(idx) => (idx, module.total_globals()),
        };
        if idx as usize >= count {
            return Err(invalid_index(format!(
                "export `{}` refers to missing index {idx}",
                export.name
            )));
        }
    }

    if let Some(start) = module.start {
        let ty = module
            .func_type(start)
            .ok_or_else(|| invalid_index(format!("unknown start function {start}")))?;
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(type_mismatch(format!("start function has type {ty}")));
        }
    }

    for (idx, element) in module.elements.iter().enumerate() {
        if element.table_idx as usize >= module.total_tables() {
            return Err(invalid_index(format!(
                "element segment {idx}: unknown table {}",
                element.table_idx
            )));
        }
        check_offset(module, &element.offset, "element", idx)?;
        if let Some(func_idx) = element
            .init
            .iter()
            .find(|&&func_idx| func_idx as usize >= module.total_funcs())
        {
            return Err(invalid_index(format!(
                "element segment {idx}: unknown function {func_idx}"
            )));
        }
    }

    for (idx, data) in module.data.iter().enumerate() {
        if let DataMode::Active { memory_idx, offset } = &data.mode {
            if *memory_idx as usize >= module.total_memories() {
                return Err(invalid_index(format!(
                    "data segment {idx}: unknown memory {memory_idx}"
                )));
            }
            check_offset(module, offset, "data", idx)?;
        }
    }

    let imported = module.imported_funcs().count();
    for (idx, (&type_idx, body)) in module.functions.iter().zip(&module.code).enumerate() {
        let func_idx = (imported + idx) as u32;
        let ty = &module.types[type_idx as usize];
        FuncValidator::new(module, ty, body, check_operands)
            .run(body)
            .map_err(|err| LoadError {
                message: format!("function {func_idx}: {}", err.message),
                ..err
            })?;
    }

    Ok(())
}

fn check_type_idx(module: &ModuleDefinition, type_idx: u32) -> Result<(), LoadError> {
    if type_idx as usize >= module.types.len() {
        return Err(invalid_index(format!("unknown type {type_idx}")));
    }
    Ok(())
}

fn check_limits(limits: &Limits, bound: u32) -> Result<(), LoadError> {
    if limits.min > bound || limits.max.is_some_and(|max| max > bound) {
        return Err(malformed(format!("limits {limits} exceed {bound}")));
    }
    if limits.max.is_some_and(|max| max < limits.min) {
        return Err(malformed(format!("limits {limits}: minimum above maximum")));
    }
    Ok(())
}

fn check_offset(
    module: &ModuleDefinition,
    offset: &ConstExpr,
    segment: &str,
    idx: usize,
) -> Result<(), LoadError> {
    let ty = const_expr_type(module, offset)?;
    if ty != ValueType::I32 {
        return Err(type_mismatch(format!(
            "{segment} segment {idx}: offset is {ty}, expected i32"
        )));
    }
    Ok(())
}

/// Constant initializers may only read immutable imported globals.
fn const_expr_type(module: &ModuleDefinition, expr: &ConstExpr) -> Result<ValueType, LoadError> {
    match *expr {
        ConstExpr::I32Const(_) => Ok(ValueType::I32),
        ConstExpr::I64Const(_) => Ok(ValueType::I64),
        ConstExpr::F32Const(_) => Ok(ValueType::F32),
        ConstExpr::F64Const(_) => Ok(ValueType::F64),
        ConstExpr::GlobalGet(idx) => {
            let ty = module
                .imported_globals()
                .nth(idx as usize)
                .ok_or_else(|| invalid_index(format!("constant expression reads global {idx}")))?;
            if ty.mutable {
                return Err(type_mismatch(format!(
                    "constant expression reads mutable global {idx}"
                )));
            }
            Ok(ty.value_type)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct ControlFrame {
    kind: FrameKind,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    height: usize,
    unreachable: bool,
}

impl ControlFrame {
    fn label_types(&self) -> &[ValueType] {
        if self.kind == FrameKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

/// Validates one function body. `None` on the operand stack is a value of
/// unknown type, produced after an unconditional branch.
struct FuncValidator<'a> {
    module: &'a ModuleDefinition,
    locals: Vec<ValueType>,
    results: Vec<ValueType>,
    operands: Vec<Option<ValueType>>,
    controls: Vec<ControlFrame>,
    check_operands: bool,
}

impl<'a> FuncValidator<'a> {
    fn new(
        module: &'a ModuleDefinition,
        ty: &FuncType,
        body: &Function,
        check_operands: bool,
    ) -> Self {
        let mut locals = ty.params.clone();
        for local in &body.locals {
            locals.extend(std::iter::repeat_n(local.value_type, local.type_count as usize));
        }
        Self {
            module,
            locals,
            results: ty.results.clone(),
            operands: vec![],
            controls: vec![ControlFrame {
                kind: FrameKind::Function,
                params: vec![],
                results: ty.results.clone(),
                height: 0,
                unreachable: false,
            }],
            check_operands,
        }
    }

    fn run(mut self, body: &Function) -> Result<(), LoadError> {
        for inst in &body.code {
            if self.controls.is_empty() {
                return Err(malformed("instructions after the final end"));
            }
            self.step(inst)?;
        }
        if !self.controls.is_empty() {
            return Err(malformed("missing end"));
        }
        Ok(())
    }

    fn push(&mut self, ty: ValueType) {
        if self.check_operands {
            self.operands.push(Some(ty));
        }
    }

    fn push_all(&mut self, types: &[ValueType]) {
        for &ty in types {
            self.push(ty);
        }
    }

    fn pop(&mut self) -> Result<Option<ValueType>, LoadError> {
        if !self.check_operands {
            return Ok(None);
        }
        let Some(frame) = self.controls.last() else {
            return Err(malformed("operand outside of any block"));
        };
        if self.operands.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(type_mismatch("operand stack underflow"));
        }
        Ok(self.operands.pop().flatten())
    }

    fn pop_expect(&mut self, expected: ValueType) -> Result<Option<ValueType>, LoadError> {
        match self.pop()? {
            Some(actual) if actual != expected => Err(type_mismatch(format!(
                "expected {expected}, found {actual}"
            ))),
            Some(actual) => Ok(Some(actual)),
            None => Ok(None),
        }
    }

    fn pop_all(&mut self, types: &[ValueType]) -> Result<Vec<Option<ValueType>>, LoadError> {
        let mut popped = Vec::with_capacity(types.len());
        for &ty in types.iter().rev() {
            popped.push(self.pop_expect(ty)?.or(Some(ty)));
        }
        popped.reverse();
        Ok(popped)
    }

    fn push_ctrl(&mut self, kind: FrameKind, params: Vec<ValueType>, results: Vec<ValueType>) {
        let height = self.operands.len();
        self.push_all(&params);
        self.controls.push(ControlFrame {
            kind,
            params,
            results,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<ControlFrame, LoadError> {
        let Some(results) = self.controls.last().map(|frame| frame.results.clone()) else {
            return Err(malformed("unbalanced end"));
        };
        self.pop_all(&results)?;
        let Some(frame) = self.controls.pop() else {
            return Err(malformed("unbalanced end"));
        };
        if self.check_operands && self.operands.len() != frame.height {
            return Err(type_mismatch(format!(
                "{} values left on the stack at the end of a block",
                self.operands.len() - frame.height
            )));
        }
        Ok(frame)
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.controls.last_mut() {
            self.operands.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label(&self, depth: u32) -> Result<Vec<ValueType>, LoadError> {
        let depth = depth as usize;
        if depth >= self.controls.len() {
            return Err(invalid_index(format!("branch depth {depth} out of range")));
        }
        Ok(self.controls[self.controls.len() - 1 - depth]
            .label_types()
            .to_vec())
    }

    fn block_signature(
        &self,
        block_type: BlockType,
    ) -> Result<(Vec<ValueType>, Vec<ValueType>), LoadError> {
        match block_type {
            BlockType::Empty => Ok((vec![], vec![])),
            BlockType::Value(ty) => Ok((vec![], vec![ty])),
            BlockType::TypeIndex(idx) => self
                .module
                .types
                .get(idx as usize)
                .map(|ty| (ty.params.clone(), ty.results.clone()))
                .ok_or_else(|| invalid_index(format!("unknown block type {idx}"))),
        }
    }

    fn check_memory(&self, width: Option<u32>, align: u32) -> Result<(), LoadError> {
        if self.module.total_memories() == 0 {
            return Err(invalid_index("memory instruction without a memory"));
        }
        if let Some(width) = width {
            if align >= 32 || 1u32 << align > width {
                return Err(malformed(format!(
                    "alignment 2^{align} larger than natural alignment {width}"
                )));
            }
        }
        Ok(())
    }

    fn local(&self, idx: u32) -> Result<ValueType, LoadError> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| invalid_index(format!("unknown local {idx}")))
    }

    fn step(&mut self, inst: &Instruction) -> Result<(), LoadError> {
        match inst {
            Instruction::Unreachable => self.set_unreachable(),
            Instruction::Nop => {}
            Instruction::Block { block_type, .. } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::Block, params, results);
            }
            Instruction::Loop { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::Loop, params, results);
            }
            Instruction::If { block_type, .. } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expect(ValueType::I32)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::If, params, results);
            }
            Instruction::Else { .. } => {
                let frame = self.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(malformed("else without if"));
                }
                self.push_ctrl(FrameKind::Else, frame.params, frame.results);
            }
            Instruction::End => {
                let frame = self.pop_ctrl()?;
                if self.check_operands && frame.kind == FrameKind::If && frame.params != frame.results
                {
                    return Err(type_mismatch("if without else must leave its parameters"));
                }
                if frame.kind != FrameKind::Function {
                    self.push_all(&frame.results);
                }
            }
            Instruction::Br(depth) => {
                let types = self.label(*depth)?;
                self.pop_all(&types)?;
                self.set_unreachable();
            }
            Instruction::BrIf(depth) => {
                let types = self.label(*depth)?;
                self.pop_expect(ValueType::I32)?;
                self.pop_all(&types)?;
                self.push_all(&types);
            }
            Instruction::BrTable { targets, default } => {
                let default_types = self.label(*default)?;
                self.pop_expect(ValueType::I32)?;
                for depth in targets {
                    let types = self.label(*depth)?;
                    if self.check_operands && types.len() != default_types.len() {
                        return Err(type_mismatch("br_table targets differ in arity"));
                    }
                    let popped = self.pop_all(&types)?;
                    if self.check_operands {
                        self.operands.extend(popped);
                    }
                }
                self.pop_all(&default_types)?;
                self.set_unreachable();
            }
            Instruction::Return => {
                let results = self.results.clone();
                self.pop_all(&results)?;
                self.set_unreachable();
            }
            Instruction::Call(func_idx) => {
                let ty = self
                    .module
                    .func_type(*func_idx)
                    .ok_or_else(|| invalid_index(format!("unknown function {func_idx}")))?
                    .clone();
                self.pop_all(&ty.params)?;
                self.push_all(&ty.results);
            }
            Instruction::CallIndirect {
                type_idx,
                table_idx,
            } => {
                if *table_idx as usize >= self.module.total_tables() {
                    return Err(invalid_index(format!("unknown table {table_idx}")));
                }
                let ty = self
                    .module
                    .types
                    .get(*type_idx as usize)
                    .ok_or_else(|| invalid_index(format!("unknown type {type_idx}")))?
                    .clone();
                self.pop_expect(ValueType::I32)?;
                self.pop_all(&ty.params)?;
                self.push_all(&ty.results);
            }
            Instruction::Drop => {
                self.pop()?;
            }
            Instruction::Select(None) => {
                self.pop_expect(ValueType::I32)?;
                let first = self.pop()?;
                let second = self.pop()?;
                match (first, second) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(type_mismatch(format!("select between {a} and {b}")));
                    }
                    _ => {}
                }
                if self.check_operands {
                    self.operands.push(first.or(second));
                }
            }
            Instruction::Select(Some(ty)) => {
                self.pop_expect(ValueType::I32)?;
                self.pop_expect(*ty)?;
                self.pop_expect(*ty)?;
                self.push(*ty);
            }
            Instruction::LocalGet(idx) => {
                let ty = self.local(*idx)?;
                self.push(ty);
            }
            Instruction::LocalSet(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
            }
            Instruction::LocalTee(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instruction::GlobalGet(idx) => {
                let ty = self
                    .module
                    .global_type(*idx)
                    .ok_or_else(|| invalid_index(format!("unknown global {idx}")))?;
                self.push(ty.value_type);
            }
            Instruction::GlobalSet(idx) => {
                let ty = self
                    .module
                    .global_type(*idx)
                    .ok_or_else(|| invalid_index(format!("unknown global {idx}")))?;
                if !ty.mutable {
                    return Err(type_mismatch(format!("global {idx} is immutable")));
                }
                self.pop_expect(ty.value_type)?;
            }
            Instruction::Load { kind, memarg } => {
                self.check_memory(Some(kind.width()), memarg.align)?;
                self.pop_expect(ValueType::I32)?;
                self.push(kind.value_type());
            }
            Instruction::Store { kind, memarg } => {
                self.check_memory(Some(kind.width()), memarg.align)?;
                self.pop_expect(kind.value_type())?;
                self.pop_expect(ValueType::I32)?;
            }
            Instruction::MemorySize => {
                self.check_memory(None, 0)?;
                self.push(ValueType::I32);
            }
            Instruction::MemoryGrow => {
                self.check_memory(None, 0)?;
                self.pop_expect(ValueType::I32)?;
                self.push(ValueType::I32);
            }
            Instruction::MemoryCopy | Instruction::MemoryFill => {
                self.check_memory(None, 0)?;
                self.pop_all(&[ValueType::I32; 3])?;
            }
            Instruction::I32Const(_) => self.push(ValueType::I32),
            Instruction::I64Const(_) => self.push(ValueType::I64),
            Instruction::F32Const(_) => self.push(ValueType::F32),
            Instruction::F64Const(_) => self.push(ValueType::F64),
            Instruction::Numeric(op) => {
                let (params, result) = op.signature();
                self.pop_all(params)?;
                self.push(result);
            }
            Instruction::TruncSat(op) => {
                let (from, to) = op.signature();
                self.pop_expect(from)?;
                self.push(to);
            }
        }
        Ok(())
    }
}
