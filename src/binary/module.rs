use super::{
    instruction::{Instruction, LoadKind, MemArg, NumericOp, StoreKind, TruncSatOp},
    opcode::{Opcode, PrefixedOpcode},
    section::{Data, DataMode, Element, Export, Function, Global, Import, SectionCode},
    types::{
        BlockType, ConstExpr, ExportDesc, FuncType, FunctionLocal, GlobalType, ImportDesc, Limits,
        MemoryType, TableType, ValueType,
    },
    validate,
};
use crate::error::{LoadError, LoadErrorKind};
use nom::{
    bytes::complete::{tag, take},
    error::{ContextError, ErrorKind, ParseError},
    multi::length_count,
    number::complete::{le_u32, le_u64, le_u8},
};
use nom_leb128::{leb128_i32, leb128_i64, leb128_u32};
use num_traits::FromPrimitive as _;
use tracing::debug;

pub const MAGIC: &[u8; 4] = b"\0asm";
pub const VERSION: u32 = 1;
/// Upper bound on the number of 64 KiB pages of a 32-bit memory.
pub const MAX_PAGES: u32 = 65536;
const MAX_LOCALS: u64 = 50_000;

/// Parsed and validated module. Immutable once loaded; instances share it
/// through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDefinition {
    pub version: u32,
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub data_count: Option<u32>,
    pub code: Vec<Function>,
    pub data: Vec<Data>,
}

impl Default for ModuleDefinition {
    fn default() -> Self {
        Self {
            version: VERSION,
            types: vec![],
            imports: vec![],
            functions: vec![],
            tables: vec![],
            memories: vec![],
            globals: vec![],
            exports: vec![],
            start: None,
            elements: vec![],
            data_count: None,
            code: vec![],
            data: vec![],
        }
    }
}

impl ModuleDefinition {
    /// Loads with full validation.
    pub fn new(input: &[u8]) -> Result<ModuleDefinition, LoadError> {
        Self::load(input, true)
    }

    /// Decodes `input` and validates it. Index and structure checks always
    /// run; `check_operands` adds operand-stack type checking of every
    /// function body.
    pub fn load(input: &[u8], check_operands: bool) -> Result<ModuleDefinition, LoadError> {
        let base = input.as_ptr() as usize;
        let module = match decode(input) {
            Ok((_, module)) => module,
            Err(nom::Err::Incomplete(_)) => {
                return Err(LoadError::new(
                    LoadErrorKind::TruncatedInput,
                    "unexpected end of input",
                ));
            }
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => return Err(e.into_load_error(base)),
        };

        validate::validate_module(&module, check_operands)?;

        debug!(
            types = module.types.len(),
            imports = module.imports.len(),
            functions = module.functions.len(),
            exports = module.exports.len(),
            "loaded module"
        );
        Ok(module)
    }

    pub fn imported_funcs(&self) -> impl Iterator<Item = u32> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Func(idx) => Some(idx),
            _ => None,
        })
    }

    pub fn imported_tables(&self) -> impl Iterator<Item = TableType> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Table(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn imported_memories(&self) -> impl Iterator<Item = MemoryType> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Memory(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn imported_globals(&self) -> impl Iterator<Item = GlobalType> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Global(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn total_funcs(&self) -> usize {
        self.imported_funcs().count() + self.functions.len()
    }

    pub fn total_tables(&self) -> usize {
        self.imported_tables().count() + self.tables.len()
    }

    pub fn total_memories(&self) -> usize {
        self.imported_memories().count() + self.memories.len()
    }

    pub fn total_globals(&self) -> usize {
        self.imported_globals().count() + self.globals.len()
    }

    /// Type index of a function in the combined (imported, then defined)
    /// function index space.
    pub fn func_type_idx(&self, func_idx: u32) -> Option<u32> {
        let func_idx = func_idx as usize;
        let imported = self.imported_funcs().count();
        if func_idx < imported {
            self.imported_funcs().nth(func_idx)
        } else {
            self.functions.get(func_idx - imported).copied()
        }
    }

    pub fn func_type(&self, func_idx: u32) -> Option<&FuncType> {
        let type_idx = self.func_type_idx(func_idx)?;
        self.types.get(type_idx as usize)
    }

    pub fn global_type(&self, global_idx: u32) -> Option<GlobalType> {
        let global_idx = global_idx as usize;
        let imported = self.imported_globals().count();
        if global_idx < imported {
            self.imported_globals().nth(global_idx)
        } else {
            self.globals.get(global_idx - imported).map(|g| g.ty)
        }
    }

    /// Parameter and result counts of a block.
    pub fn block_arity(&self, block_type: BlockType) -> Option<(usize, usize)> {
        match block_type {
            BlockType::Empty => Some((0, 0)),
            BlockType::Value(_) => Some((0, 1)),
            BlockType::TypeIndex(idx) => self
                .types
                .get(idx as usize)
                .map(|ty| (ty.params.len(), ty.results.len())),
        }
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|export| export.name == name)
    }
}

/// nom error carrying the load error kind. `at` is the address of the
/// failing input so the offset can be recovered from any sub-slice.
#[derive(Debug)]
pub struct DecodeError {
    kind: LoadErrorKind,
    at: usize,
    message: String,
}

impl DecodeError {
    fn new(input: &[u8], kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            at: input.as_ptr() as usize,
            message: message.into(),
        }
    }

    fn into_load_error(self, base: usize) -> LoadError {
        LoadError::new(self.kind, self.message).at(self.at.saturating_sub(base))
    }
}

impl<'a> ParseError<&'a [u8]> for DecodeError {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        let load_kind = match kind {
            ErrorKind::Eof => LoadErrorKind::TruncatedInput,
            _ => LoadErrorKind::MalformedEncoding,
        };
        Self::new(input, load_kind, kind.description())
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a> ContextError<&'a [u8]> for DecodeError {}

type IResult<'a, O> = nom::IResult<&'a [u8], O, DecodeError>;

fn fail<'a, O>(input: &'a [u8], kind: LoadErrorKind, message: impl Into<String>) -> IResult<'a, O> {
    Err(nom::Err::Failure(DecodeError::new(input, kind, message)))
}

fn decode(input: &[u8]) -> IResult<ModuleDefinition> {
    let Ok((input, _)) = tag::<_, _, DecodeError>(&MAGIC[..])(input) else {
        return fail(input, LoadErrorKind::MalformedHeader, "missing \\0asm magic");
    };
    let Ok((input, version)) = le_u32::<_, DecodeError>(input) else {
        return fail(input, LoadErrorKind::MalformedHeader, "missing version");
    };
    if version != VERSION {
        return fail(
            input,
            LoadErrorKind::MalformedHeader,
            format!("unsupported version: {version}"),
        );
    }

    let mut module = ModuleDefinition {
        version,
        ..Default::default()
    };

    let mut last_order = 0;
    let mut remaining = input;

    while !remaining.is_empty() {
        let (rest, (code, size)) = decode_section_header(remaining)?;
        let (rest, contents) = decode_bytes(rest, size)?;

        if code != SectionCode::Custom {
            if code.order() <= last_order {
                return fail(
                    remaining,
                    LoadErrorKind::MalformedEncoding,
                    format!("unexpected {code:?} section"),
                );
            }
            last_order = code.order();
        }
        debug!(section = ?code, size, "decoding section");

        match code {
            SectionCode::Custom => {
                // only the name is checked, the payload is skipped
                decode_name(contents)?;
            }
            SectionCode::Type => {
                module.types = section(contents, length_count(decode_u32, decode_func_type))?;
            }
            SectionCode::Import => {
                module.imports = section(contents, length_count(decode_u32, decode_import))?;
            }
            SectionCode::Function => {
                module.functions = section(contents, length_count(decode_u32, decode_u32))?;
            }
            SectionCode::Table => {
                module.tables = section(contents, length_count(decode_u32, decode_table_type))?;
            }
            SectionCode::Memory => {
                module.memories = section(contents, length_count(decode_u32, decode_memory_type))?;
            }
            SectionCode::Global => {
                module.globals = section(contents, length_count(decode_u32, decode_global))?;
            }
            SectionCode::Export => {
                module.exports = section(contents, length_count(decode_u32, decode_export))?;
            }
            SectionCode::Start => {
                module.start = Some(section(contents, decode_u32)?);
            }
            SectionCode::Element => {
                module.elements = section(contents, length_count(decode_u32, decode_element))?;
            }
            SectionCode::DataCount => {
                module.data_count = Some(section(contents, decode_u32)?);
            }
            SectionCode::Code => {
                module.code = section(contents, length_count(decode_u32, decode_code_entry))?;
            }
            SectionCode::Data => {
                module.data = section(contents, length_count(decode_u32, decode_data))?;
            }
        };

        remaining = rest;
    }
    Ok((remaining, module))
}

/// Runs `parser` over a whole section payload, rejecting trailing bytes.
fn section<'a, O>(
    contents: &'a [u8],
    mut parser: impl FnMut(&'a [u8]) -> IResult<'a, O>,
) -> Result<O, nom::Err<DecodeError>> {
    let (rest, out) = parser(contents)?;
    if !rest.is_empty() {
        return Err(nom::Err::Failure(DecodeError::new(
            rest,
            LoadErrorKind::MalformedEncoding,
            "section size mismatch",
        )));
    }
    Ok(out)
}

fn decode_byte(input: &[u8]) -> IResult<u8> {
    le_u8(input)
}

fn decode_bytes(input: &[u8], size: u32) -> IResult<&[u8]> {
    take(size)(input)
}

fn decode_u32_bits(input: &[u8]) -> IResult<u32> {
    le_u32(input)
}

fn decode_u64_bits(input: &[u8]) -> IResult<u64> {
    le_u64(input)
}

fn decode_u32(input: &[u8]) -> IResult<u32> {
    leb128_u32(input)
}

fn decode_i32(input: &[u8]) -> IResult<i32> {
    leb128_i32(input)
}

fn decode_i64(input: &[u8]) -> IResult<i64> {
    leb128_i64(input)
}

fn decode_section_header(input: &[u8]) -> IResult<(SectionCode, u32)> {
    let (rest, id) = decode_byte(input)?;
    let Some(code) = SectionCode::from_u8(id) else {
        return fail(
            input,
            LoadErrorKind::UnknownSection,
            format!("unknown section id: {id:#X}"),
        );
    };
    let (rest, size) = decode_u32(rest)?;
    Ok((rest, (code, size)))
}

fn decode_value_type(input: &[u8]) -> IResult<ValueType> {
    let (rest, byte) = decode_byte(input)?;
    match ValueType::from_byte(byte) {
        Some(value_type) => Ok((rest, value_type)),
        None if matches!(byte, 0x7B | 0x70 | 0x6F) => fail(
            input,
            LoadErrorKind::Unsupported,
            format!("unsupported value type: {byte:#X}"),
        ),
        None => fail(
            input,
            LoadErrorKind::MalformedEncoding,
            format!("invalid value type: {byte:#X}"),
        ),
    }
}

fn decode_func_type(input: &[u8]) -> IResult<FuncType> {
    let (rest, form) = decode_byte(input)?;
    if form != 0x60 {
        return fail(
            input,
            LoadErrorKind::MalformedEncoding,
            format!("invalid function type form: {form:#X}"),
        );
    }
    let (rest, params) = length_count(decode_u32, decode_value_type)(rest)?;
    let (rest, results) = length_count(decode_u32, decode_value_type)(rest)?;
    Ok((rest, FuncType { params, results }))
}

fn decode_name(input: &[u8]) -> IResult<String> {
    let (rest, size) = decode_u32(input)?;
    let (rest, name) = decode_bytes(rest, size)?;
    match std::str::from_utf8(name) {
        Ok(name) => Ok((rest, name.to_string())),
        Err(_) => fail(input, LoadErrorKind::MalformedEncoding, "invalid UTF-8 in name"),
    }
}

fn decode_limits(input: &[u8]) -> IResult<Limits> {
    let (rest, flags) = decode_byte(input)?;
    match flags {
        0x00 => {
            let (rest, min) = decode_u32(rest)?;
            Ok((rest, Limits { min, max: None }))
        }
        0x01 => {
            let (rest, min) = decode_u32(rest)?;
            let (rest, max) = decode_u32(rest)?;
            Ok((rest, Limits { min, max: Some(max) }))
        }
        0x02 | 0x03 => fail(input, LoadErrorKind::Unsupported, "shared memory"),
        _ => fail(
            input,
            LoadErrorKind::MalformedEncoding,
            format!("invalid limits flags: {flags:#X}"),
        ),
    }
}

fn decode_table_type(input: &[u8]) -> IResult<TableType> {
    let (rest, elem_type) = decode_byte(input)?;
    match elem_type {
        0x70 => {}
        0x6F => return fail(input, LoadErrorKind::Unsupported, "externref tables"),
        _ => {
            return fail(
                input,
                LoadErrorKind::MalformedEncoding,
                format!("invalid table element type: {elem_type:#X}"),
            );
        }
    }
    let (rest, limits) = decode_limits(rest)?;
    Ok((rest, TableType { limits }))
}

fn decode_memory_type(input: &[u8]) -> IResult<MemoryType> {
    let (rest, limits) = decode_limits(input)?;
    Ok((rest, MemoryType { limits }))
}

fn decode_global_type(input: &[u8]) -> IResult<GlobalType> {
    let (rest, value_type) = decode_value_type(input)?;
    let (after, mutability) = decode_byte(rest)?;
    let mutable = match mutability {
        0x00 => false,
        0x01 => true,
        _ => {
            return fail(
                rest,
                LoadErrorKind::MalformedEncoding,
                format!("invalid mutability: {mutability:#X}"),
            );
        }
    };
    Ok((after, GlobalType { value_type, mutable }))
}

fn decode_import(input: &[u8]) -> IResult<Import> {
    let (rest, module) = decode_name(input)?;
    let (rest, field) = decode_name(rest)?;
    let (after, kind) = decode_byte(rest)?;
    let (rest, desc) = match kind {
        0x00 => {
            let (rest, idx) = decode_u32(after)?;
            (rest, ImportDesc::Func(idx))
        }
        0x01 => {
            let (rest, ty) = decode_table_type(after)?;
            (rest, ImportDesc::Table(ty))
        }
        0x02 => {
            let (rest, ty) = decode_memory_type(after)?;
            (rest, ImportDesc::Memory(ty))
        }
        0x03 => {
            let (rest, ty) = decode_global_type(after)?;
            (rest, ImportDesc::Global(ty))
        }
        _ => {
            return fail(
                rest,
                LoadErrorKind::MalformedEncoding,
                format!("invalid import kind: {kind:#X}"),
            );
        }
    };

    Ok((
        rest,
        Import {
            module,
            field,
            desc,
        },
    ))
}

fn decode_export(input: &[u8]) -> IResult<Export> {
    let (rest, name) = decode_name(input)?;
    let (after, kind) = decode_byte(rest)?;
    let (after, idx) = decode_u32(after)?;
    let desc = match kind {
        0x00 => ExportDesc::Func(idx),
        0x01 => ExportDesc::Table(idx),
        0x02 => ExportDesc::Memory(idx),
        0x03 => ExportDesc::Global(idx),
        _ => {
            return fail(
                rest,
                LoadErrorKind::MalformedEncoding,
                format!("invalid export kind: {kind:#X}"),
            );
        }
    };
    Ok((after, Export { name, desc }))
}

fn decode_const_expr(input: &[u8]) -> IResult<ConstExpr> {
    let (rest, op) = decode_byte(input)?;
    let (rest, expr) = match op {
        0x41 => {
            let (rest, value) = decode_i32(rest)?;
            (rest, ConstExpr::I32Const(value))
        }
        0x42 => {
            let (rest, value) = decode_i64(rest)?;
            (rest, ConstExpr::I64Const(value))
        }
        0x43 => {
            let (rest, bits) = decode_u32_bits(rest)?;
            (rest, ConstExpr::F32Const(bits))
        }
        0x44 => {
            let (rest, bits) = decode_u64_bits(rest)?;
            (rest, ConstExpr::F64Const(bits))
        }
        0x23 => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, ConstExpr::GlobalGet(idx))
        }
        _ => {
            return fail(
                input,
                LoadErrorKind::Unsupported,
                format!("unsupported constant expression opcode: {op:#04X}"),
            );
        }
    };
    let (after, end) = decode_byte(rest)?;
    if end != 0x0B {
        return fail(
            rest,
            LoadErrorKind::Unsupported,
            "constant expression with more than one instruction",
        );
    }
    Ok((after, expr))
}

fn decode_global(input: &[u8]) -> IResult<Global> {
    let (rest, ty) = decode_global_type(input)?;
    let (rest, init) = decode_const_expr(rest)?;
    Ok((rest, Global { ty, init }))
}

fn decode_element(input: &[u8]) -> IResult<Element> {
    let (rest, flags) = decode_u32(input)?;
    if flags != 0 {
        return fail(
            input,
            LoadErrorKind::Unsupported,
            format!("element segment form {flags}"),
        );
    }
    let (rest, offset) = decode_const_expr(rest)?;
    let (rest, init) = length_count(decode_u32, decode_u32)(rest)?;
    Ok((
        rest,
        Element {
            table_idx: 0,
            offset,
            init,
        },
    ))
}

fn decode_data(input: &[u8]) -> IResult<Data> {
    let (rest, flags) = decode_u32(input)?;
    let (rest, mode) = match flags {
        0 => {
            let (rest, offset) = decode_const_expr(rest)?;
            (
                rest,
                DataMode::Active {
                    memory_idx: 0,
                    offset,
                },
            )
        }
        1 => (rest, DataMode::Passive),
        2 => {
            let (rest, memory_idx) = decode_u32(rest)?;
            let (rest, offset) = decode_const_expr(rest)?;
            (rest, DataMode::Active { memory_idx, offset })
        }
        _ => {
            return fail(
                input,
                LoadErrorKind::MalformedEncoding,
                format!("invalid data segment flags: {flags}"),
            );
        }
    };
    let (rest, size) = decode_u32(rest)?;
    let (rest, init) = decode_bytes(rest, size)?;
    Ok((
        rest,
        Data {
            mode,
            init: init.into(),
        },
    ))
}

fn decode_code_entry(input: &[u8]) -> IResult<Function> {
    let (rest, size) = decode_u32(input)?;
    let (rest, body) = decode_bytes(rest, size)?;
    let (leftover, function) = decode_function_body(body)?;
    if !leftover.is_empty() {
        return fail(
            leftover,
            LoadErrorKind::MalformedEncoding,
            "function body size mismatch",
        );
    }
    Ok((rest, function))
}

fn decode_local(input: &[u8]) -> IResult<FunctionLocal> {
    let (rest, type_count) = decode_u32(input)?;
    let (rest, value_type) = decode_value_type(rest)?;
    Ok((
        rest,
        FunctionLocal {
            type_count,
            value_type,
        },
    ))
}

fn decode_function_body(input: &[u8]) -> IResult<Function> {
    let (rest, locals) = length_count(decode_u32, decode_local)(input)?;
    let total: u64 = locals.iter().map(|l| u64::from(l.type_count)).sum();
    if total > MAX_LOCALS {
        return fail(
            input,
            LoadErrorKind::Unsupported,
            format!("too many locals: {total}"),
        );
    }
    let (rest, code) = decode_expression(rest)?;
    Ok((rest, Function { locals, code }))
}

/// Decodes instructions up to and including the `end` closing the body,
/// filling in the `else`/`end` positions of structured instructions.
fn decode_expression(input: &[u8]) -> IResult<Vec<Instruction>> {
    let mut code = vec![];
    let mut open_blocks: Vec<usize> = vec![];
    let mut remaining = input;

    loop {
        let (rest, inst) = decode_instruction(remaining)?;
        let pc = code.len();

        match &inst {
            Instruction::Block { .. } | Instruction::Loop { .. } | Instruction::If { .. } => {
                open_blocks.push(pc);
            }
            Instruction::Else { .. } => {
                let open = open_blocks.last().copied();
                match open.map(|idx| &mut code[idx]) {
                    Some(Instruction::If { else_pc, .. }) if else_pc.is_none() => {
                        *else_pc = Some(pc);
                    }
                    _ => {
                        return fail(remaining, LoadErrorKind::MalformedEncoding, "else without if");
                    }
                }
            }
            Instruction::End => match open_blocks.pop() {
                Some(open) => {
                    let else_pc = match &mut code[open] {
                        Instruction::Block { end, .. } => {
                            *end = pc;
                            None
                        }
                        Instruction::If { end, else_pc, .. } => {
                            *end = pc;
                            *else_pc
                        }
                        _ => None,
                    };
                    if let Some(else_pc) = else_pc {
                        code[else_pc] = Instruction::Else { end: pc };
                    }
                }
                None => {
                    code.push(inst);
                    remaining = rest;
                    break;
                }
            },
            _ => {}
        }

        code.push(inst);
        remaining = rest;
    }

    Ok((remaining, code))
}

fn decode_block_type(input: &[u8]) -> IResult<BlockType> {
    let (rest, byte) = decode_byte(input)?;
    if byte == 0x40 {
        return Ok((rest, BlockType::Empty));
    }
    if let Some(value_type) = ValueType::from_byte(byte) {
        return Ok((rest, BlockType::Value(value_type)));
    }
    if matches!(byte, 0x7B | 0x70 | 0x6F) {
        return fail(
            input,
            LoadErrorKind::Unsupported,
            format!("unsupported block type: {byte:#X}"),
        );
    }
    let (rest, idx) = decode_i64(input)?;
    match u32::try_from(idx) {
        Ok(idx) => Ok((rest, BlockType::TypeIndex(idx))),
        Err(_) => fail(
            input,
            LoadErrorKind::MalformedEncoding,
            format!("invalid block type: {idx}"),
        ),
    }
}

fn decode_memarg(input: &[u8]) -> IResult<MemArg> {
    let (rest, align) = decode_u32(input)?;
    let (rest, offset) = decode_u32(rest)?;
    Ok((rest, MemArg { align, offset }))
}

fn decode_zero_byte(input: &[u8]) -> IResult<()> {
    let (rest, byte) = decode_byte(input)?;
    if byte != 0 {
        return fail(input, LoadErrorKind::Unsupported, "non-zero memory index");
    }
    Ok((rest, ()))
}

fn decode_instruction(input: &[u8]) -> IResult<Instruction> {
    let (rest, byte) = decode_byte(input)?;

    if let Some(kind) = LoadKind::from_u8(byte) {
        let (rest, memarg) = decode_memarg(rest)?;
        return Ok((rest, Instruction::Load { kind, memarg }));
    }
    if let Some(kind) = StoreKind::from_u8(byte) {
        let (rest, memarg) = decode_memarg(rest)?;
        return Ok((rest, Instruction::Store { kind, memarg }));
    }
    if let Some(op) = NumericOp::from_u8(byte) {
        return Ok((rest, Instruction::Numeric(op)));
    }

    let Some(op) = Opcode::from_u8(byte) else {
        return fail(
            input,
            LoadErrorKind::Unsupported,
            format!("unknown or unsupported opcode: {byte:#04X}"),
        );
    };

    let (rest, inst) = match op {
        Opcode::Unreachable => (rest, Instruction::Unreachable),
        Opcode::Nop => (rest, Instruction::Nop),
        Opcode::Block => {
            let (rest, block_type) = decode_block_type(rest)?;
            (rest, Instruction::Block { block_type, end: 0 })
        }
        Opcode::Loop => {
            let (rest, block_type) = decode_block_type(rest)?;
            (rest, Instruction::Loop { block_type })
        }
        Opcode::If => {
            let (rest, block_type) = decode_block_type(rest)?;
            (
                rest,
                Instruction::If {
                    block_type,
                    else_pc: None,
                    end: 0,
                },
            )
        }
        Opcode::Else => (rest, Instruction::Else { end: 0 }),
        Opcode::End => (rest, Instruction::End),
        Opcode::Br => {
            let (rest, depth) = decode_u32(rest)?;
            (rest, Instruction::Br(depth))
        }
        Opcode::BrIf => {
            let (rest, depth) = decode_u32(rest)?;
            (rest, Instruction::BrIf(depth))
        }
        Opcode::BrTable => {
            let (rest, targets) = length_count(decode_u32, decode_u32)(rest)?;
            let (rest, default) = decode_u32(rest)?;
            (rest, Instruction::BrTable { targets, default })
        }
        Opcode::Return => (rest, Instruction::Return),
        Opcode::Call => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::Call(idx))
        }
        Opcode::CallIndirect => {
            let (rest, type_idx) = decode_u32(rest)?;
            let (rest, table_idx) = decode_u32(rest)?;
            (
                rest,
                Instruction::CallIndirect {
                    type_idx,
                    table_idx,
                },
            )
        }
        Opcode::Drop => (rest, Instruction::Drop),
        Opcode::Select => (rest, Instruction::Select(None)),
        Opcode::SelectTyped => {
            let (after, types) = length_count(decode_u32, decode_value_type)(rest)?;
            let [value_type] = types[..] else {
                return fail(
                    rest,
                    LoadErrorKind::MalformedEncoding,
                    "typed select must name exactly one type",
                );
            };
            (after, Instruction::Select(Some(value_type)))
        }
        Opcode::LocalGet => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::LocalGet(idx))
        }
        Opcode::LocalSet => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::LocalSet(idx))
        }
        Opcode::LocalTee => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::LocalTee(idx))
        }
        Opcode::GlobalGet => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::GlobalGet(idx))
        }
        Opcode::GlobalSet => {
            let (rest, idx) = decode_u32(rest)?;
            (rest, Instruction::GlobalSet(idx))
        }
        Opcode::MemorySize => {
            let (rest, _) = decode_zero_byte(rest)?;
            (rest, Instruction::MemorySize)
        }
        Opcode::MemoryGrow => {
            let (rest, _) = decode_zero_byte(rest)?;
            (rest, Instruction::MemoryGrow)
        }
        Opcode::I32Const => {
            let (rest, value) = decode_i32(rest)?;
            (rest, Instruction::I32Const(value))
        }
        Opcode::I64Const => {
            let (rest, value) = decode_i64(rest)?;
            (rest, Instruction::I64Const(value))
        }
        Opcode::F32Const => {
            let (rest, bits) = decode_u32_bits(rest)?;
            (rest, Instruction::F32Const(bits))
        }
        Opcode::F64Const => {
            let (rest, bits) = decode_u64_bits(rest)?;
            (rest, Instruction::F64Const(bits))
        }
        Opcode::Prefix => decode_prefixed_instruction(rest)?,
    };
    Ok((rest, inst))
}

fn decode_prefixed_instruction(input: &[u8]) -> IResult<Instruction> {
    let (rest, sub) = decode_u32(input)?;
    let Some(op) = PrefixedOpcode::from_u32(sub) else {
        return fail(
            input,
            LoadErrorKind::Unsupported,
            format!("unsupported opcode: 0xFC {sub}"),
        );
    };
    let trunc_sat = match op {
        PrefixedOpcode::I32TruncSatF32S => TruncSatOp::I32TruncSatF32S,
        PrefixedOpcode::I32TruncSatF32U => TruncSatOp::I32TruncSatF32U,
        PrefixedOpcode::I32TruncSatF64S => TruncSatOp::I32TruncSatF64S,
        PrefixedOpcode::I32TruncSatF64U => TruncSatOp::I32TruncSatF64U,
        PrefixedOpcode::I64TruncSatF32S => TruncSatOp::I64TruncSatF32S,
        PrefixedOpcode::I64TruncSatF32U => TruncSatOp::I64TruncSatF32U,
        PrefixedOpcode::I64TruncSatF64S => TruncSatOp::I64TruncSatF64S,
        PrefixedOpcode::I64TruncSatF64U => TruncSatOp::I64TruncSatF64U,
        PrefixedOpcode::MemoryCopy => {
            let (rest, _) = decode_zero_byte(rest)?;
            let (rest, _) = decode_zero_byte(rest)?;
            return Ok((rest, Instruction::MemoryCopy));
        }
        PrefixedOpcode::MemoryFill => {
            let (rest, _) = decode_zero_byte(rest)?;
            return Ok((rest, Instruction::MemoryFill));
        }
    };
    Ok((rest, Instruction::TruncSat(trunc_sat)))
}
