use num_derive::FromPrimitive;

/// Single-byte opcodes that are not loads, stores or numeric operators.
/// Those three groups decode straight into [`LoadKind`], [`StoreKind`] and
/// [`NumericOp`].
///
/// [`LoadKind`]: super::instruction::LoadKind
/// [`StoreKind`]: super::instruction::StoreKind
/// [`NumericOp`]: super::instruction::NumericOp
#[derive(Debug, FromPrimitive, PartialEq)]
pub enum Opcode {
    Unreachable = 0x00,
    Nop = 0x01,
    Block = 0x02,
    Loop = 0x03,
    If = 0x04,
    Else = 0x05,
    End = 0x0B,
    Br = 0x0C,
    BrIf = 0x0D,
    BrTable = 0x0E,
    Return = 0x0F,
    Call = 0x10,
    CallIndirect = 0x11,
    Drop = 0x1A,
    Select = 0x1B,
    SelectTyped = 0x1C,
    LocalGet = 0x20,
    LocalSet = 0x21,
    LocalTee = 0x22,
    GlobalGet = 0x23,
    GlobalSet = 0x24,
    MemorySize = 0x3F,
    MemoryGrow = 0x40,
    I32Const = 0x41,
    I64Const = 0x42,
    F32Const = 0x43,
    F64Const = 0x44,
    Prefix = 0xFC,
}

/// Sub-opcodes behind the `0xFC` prefix that the engine understands.
#[derive(Debug, FromPrimitive, PartialEq)]
pub enum PrefixedOpcode {
    I32TruncSatF32S = 0,
    I32TruncSatF32U = 1,
    I32TruncSatF64S = 2,
    I32TruncSatF64U = 3,
    I64TruncSatF32S = 4,
    I64TruncSatF32U = 5,
    I64TruncSatF64S = 6,
    I64TruncSatF64U = 7,
    MemoryCopy = 10,
    MemoryFill = 11,
}
