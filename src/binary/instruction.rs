use super::types::{BlockType, ValueType};
use num_derive::FromPrimitive;

/// Decoded instruction. Structured control carries the positions of its
/// matching `else`/`end` so the runtime never has to scan for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block {
        block_type: BlockType,
        end: usize,
    },
    Loop {
        block_type: BlockType,
    },
    If {
        block_type: BlockType,
        else_pc: Option<usize>,
        end: usize,
    },
    Else {
        end: usize,
    },
    End,
    Br(u32),
    BrIf(u32),
    BrTable {
        targets: Vec<u32>,
        default: u32,
    },
    Return,
    Call(u32),
    CallIndirect {
        type_idx: u32,
        table_idx: u32,
    },
    Drop,
    Select(Option<ValueType>),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load {
        kind: LoadKind,
        memarg: MemArg,
    },
    Store {
        kind: StoreKind,
        memarg: MemArg,
    },
    MemorySize,
    MemoryGrow,
    MemoryCopy,
    MemoryFill,
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    Numeric(NumericOp),
    TruncSat(TruncSatOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum LoadKind {
    I32Load = 0x28,
    I64Load = 0x29,
    F32Load = 0x2A,
    F64Load = 0x2B,
    I32Load8S = 0x2C,
    I32Load8U = 0x2D,
    I32Load16S = 0x2E,
    I32Load16U = 0x2F,
    I64Load8S = 0x30,
    I64Load8U = 0x31,
    I64Load16S = 0x32,
    I64Load16U = 0x33,
    I64Load32S = 0x34,
    I64Load32U = 0x35,
}

impl LoadKind {
    pub fn value_type(self) -> ValueType {
        use LoadKind::*;
        match self {
            I32Load | I32Load8S | I32Load8U | I32Load16S | I32Load16U => ValueType::I32,
            I64Load | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U => ValueType::I64,
            F32Load => ValueType::F32,
            F64Load => ValueType::F64,
        }
    }

    /// Access width in bytes.
    pub fn width(self) -> u32 {
        use LoadKind::*;
        match self {
            I32Load8S | I32Load8U | I64Load8S | I64Load8U => 1,
            I32Load16S | I32Load16U | I64Load16S | I64Load16U => 2,
            I32Load | F32Load | I64Load32S | I64Load32U => 4,
            I64Load | F64Load => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum StoreKind {
    I32Store = 0x36,
    I64Store = 0x37,
    F32Store = 0x38,
    F64Store = 0x39,
    I32Store8 = 0x3A,
    I32Store16 = 0x3B,
    I64Store8 = 0x3C,
    I64Store16 = 0x3D,
    I64Store32 = 0x3E,
}

impl StoreKind {
    pub fn value_type(self) -> ValueType {
        use StoreKind::*;
        match self {
            I32Store | I32Store8 | I32Store16 => ValueType::I32,
            I64Store | I64Store8 | I64Store16 | I64Store32 => ValueType::I64,
            F32Store => ValueType::F32,
            F64Store => ValueType::F64,
        }
    }

    pub fn width(self) -> u32 {
        use StoreKind::*;
        match self {
            I32Store8 | I64Store8 => 1,
            I32Store16 | I64Store16 => 2,
            I32Store | F32Store | I64Store32 => 4,
            I64Store | F64Store => 8,
        }
    }
}

/// Every numeric operator of the MVP plus the sign-extension operators.
/// The discriminant is the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum NumericOp {
    I32Eqz = 0x45,
    I32Eq = 0x46,
    I32Ne = 0x47,
    I32LtS = 0x48,
    I32LtU = 0x49,
    I32GtS = 0x4A,
    I32GtU = 0x4B,
    I32LeS = 0x4C,
    I32LeU = 0x4D,
    I32GeS = 0x4E,
    I32GeU = 0x4F,

    I64Eqz = 0x50,
    I64Eq = 0x51,
    I64Ne = 0x52,
    I64LtS = 0x53,
    I64LtU = 0x54,
    I64GtS = 0x55,
    I64GtU = 0x56,
    I64LeS = 0x57,
    I64LeU = 0x58,
    I64GeS = 0x59,
    I64GeU = 0x5A,

    F32Eq = 0x5B,
    F32Ne = 0x5C,
    F32Lt = 0x5D,
    F32Gt = 0x5E,
    F32Le = 0x5F,
    F32Ge = 0x60,

    F64Eq = 0x61,
    F64Ne = 0x62,
    F64Lt = 0x63,
    F64Gt = 0x64,
    F64Le = 0x65,
    F64Ge = 0x66,

    I32Clz = 0x67,
    I32Ctz = 0x68,
    I32Popcnt = 0x69,
    I32Add = 0x6A,
    I32Sub = 0x6B,
    I32Mul = 0x6C,
    I32DivS = 0x6D,
    I32DivU = 0x6E,
    I32RemS = 0x6F,
    I32RemU = 0x70,
    I32And = 0x71,
    I32Or = 0x72,
    I32Xor = 0x73,
    I32Shl = 0x74,
    I32ShrS = 0x75,
    I32ShrU = 0x76,
    I32Rotl = 0x77,
    I32Rotr = 0x78,

    I64Clz = 0x79,
    I64Ctz = 0x7A,
    I64Popcnt = 0x7B,
    I64Add = 0x7C,
    I64Sub = 0x7D,
    I64Mul = 0x7E,
    I64DivS = 0x7F,
    I64DivU = 0x80,
    I64RemS = 0x81,
    I64RemU = 0x82,
    I64And = 0x83,
    I64Or = 0x84,
    I64Xor = 0x85,
    I64Shl = 0x86,
    I64ShrS = 0x87,
    I64ShrU = 0x88,
    I64Rotl = 0x89,
    I64Rotr = 0x8A,

    F32Abs = 0x8B,
    F32Neg = 0x8C,
    F32Ceil = 0x8D,
    F32Floor = 0x8E,
    F32Trunc = 0x8F,
    F32Nearest = 0x90,
    F32Sqrt = 0x91,
    F32Add = 0x92,
    F32Sub = 0x93,
    F32Mul = 0x94,
    F32Div = 0x95,
    F32Min = 0x96,
    F32Max = 0x97,
    F32Copysign = 0x98,

    F64Abs = 0x99,
    F64Neg = 0x9A,
    F64Ceil = 0x9B,
    F64Floor = 0x9C,
    F64Trunc = 0x9D,
    F64Nearest = 0x9E,
    F64Sqrt = 0x9F,
    F64Add = 0xA0,
    F64Sub = 0xA1,
    F64Mul = 0xA2,
    F64Div = 0xA3,
    F64Min = 0xA4,
    F64Max = 0xA5,
    F64Copysign = 0xA6,

    I32WrapI64 = 0xA7,
    I32TruncF32S = 0xA8,
    I32TruncF32U = 0xA9,
    I32TruncF64S = 0xAA,
    I32TruncF64U = 0xAB,
    I64ExtendI32S = 0xAC,
    I64ExtendI32U = 0xAD,
    I64TruncF32S = 0xAE,
    I64TruncF32U = 0xAF,
    I64TruncF64S = 0xB0,
    I64TruncF64U = 0xB1,
    F32ConvertI32S = 0xB2,
    F32ConvertI32U = 0xB3,
    F32ConvertI64S = 0xB4,
    F32ConvertI64U = 0xB5,
    F32DemoteF64 = 0xB6,
    F64ConvertI32S = 0xB7,
    F64ConvertI32U = 0xB8,
    F64ConvertI64S = 0xB9,
    F64ConvertI64U = 0xBA,
    F64PromoteF32 = 0xBB,
    I32ReinterpretF32 = 0xBC,
    I64ReinterpretF64 = 0xBD,
    F32ReinterpretI32 = 0xBE,
    F64ReinterpretI64 = 0xBF,

    I32Extend8S = 0xC0,
    I32Extend16S = 0xC1,
    I64Extend8S = 0xC2,
    I64Extend16S = 0xC3,
    I64Extend32S = 0xC4,
}

impl NumericOp {
    /// Operand types (bottom to top) and the result type.
    pub fn signature(self) -> (&'static [ValueType], ValueType) {
        use ValueType::*;
        match self as u8 {
            0x45 => (&[I32], I32),
            0x46..=0x4F => (&[I32, I32], I32),
            0x50 => (&[I64], I32),
            0x51..=0x5A => (&[I64, I64], I32),
            0x5B..=0x60 => (&[F32, F32], I32),
            0x61..=0x66 => (&[F64, F64], I32),
            0x67..=0x69 => (&[I32], I32),
            0x6A..=0x78 => (&[I32, I32], I32),
            0x79..=0x7B => (&[I64], I64),
            0x7C..=0x8A => (&[I64, I64], I64),
            0x8B..=0x91 => (&[F32], F32),
            0x92..=0x98 => (&[F32, F32], F32),
            0x99..=0x9F => (&[F64], F64),
            0xA0..=0xA6 => (&[F64, F64], F64),
            0xA7 => (&[I64], I32),
            0xA8 | 0xA9 => (&[F32], I32),
            0xAA | 0xAB => (&[F64], I32),
            0xAC | 0xAD => (&[I32], I64),
            0xAE | 0xAF => (&[F32], I64),
            0xB0 | 0xB1 => (&[F64], I64),
            0xB2 | 0xB3 => (&[I32], F32),
            0xB4 | 0xB5 => (&[I64], F32),
            0xB6 => (&[F64], F32),
            0xB7 | 0xB8 => (&[I32], F64),
            0xB9 | 0xBA => (&[I64], F64),
            0xBB => (&[F32], F64),
            0xBC => (&[F32], I32),
            0xBD => (&[F64], I64),
            0xBE => (&[I32], F32),
            0xBF => (&[I64], F64),
            0xC0 | 0xC1 => (&[I32], I32),
            _ => (&[I64], I64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncSatOp {
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

impl TruncSatOp {
    pub fn signature(self) -> (ValueType, ValueType) {
        use TruncSatOp::*;
        match self {
            I32TruncSatF32S | I32TruncSatF32U => (ValueType::F32, ValueType::I32),
            I32TruncSatF64S | I32TruncSatF64U => (ValueType::F64, ValueType::I32),
            I64TruncSatF32S | I64TruncSatF32U => (ValueType::F32, ValueType::I64),
            I64TruncSatF64S | I64TruncSatF64U => (ValueType::F64, ValueType::I64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LoadKind, NumericOp};
    use crate::binary::types::ValueType;
    use num_traits::FromPrimitive as _;

    #[test]
    fn numeric_signatures() {
        let (params, result) = NumericOp::I32Add.signature();
        assert_eq!(params, &[ValueType::I32, ValueType::I32]);
        assert_eq!(result, ValueType::I32);

        let (params, result) = NumericOp::F64ConvertI64U.signature();
        assert_eq!(params, &[ValueType::I64]);
        assert_eq!(result, ValueType::F64);

        let (params, result) = NumericOp::I64Extend32S.signature();
        assert_eq!(params, &[ValueType::I64]);
        assert_eq!(result, ValueType::I64);
    }

    #[test]
    fn opcode_byte_roundtrip() {
        assert_eq!(NumericOp::from_u8(0x6D), Some(NumericOp::I32DivS));
        assert_eq!(NumericOp::from_u8(0xC5), None);
        assert_eq!(LoadKind::from_u8(0x2D), Some(LoadKind::I32Load8U));
        assert_eq!(LoadKind::I64Load32U.width(), 4);
    }
}
