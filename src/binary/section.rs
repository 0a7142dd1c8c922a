use super::{
    instruction::Instruction,
    types::{ConstExpr, ExportDesc, FunctionLocal, GlobalType, ImportDesc},
};
use num_derive::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SectionCode {
    Custom = 0x00,
    Type = 0x01,
    Import = 0x02,
    Function = 0x03,
    Table = 0x04,
    Memory = 0x05,
    Global = 0x06,
    Export = 0x07,
    Start = 0x08,
    Element = 0x09,
    Code = 0x0a,
    Data = 0x0b,
    DataCount = 0x0c,
}

impl SectionCode {
    /// Position in the mandatory section order. The data count section sits
    /// between the element and code sections despite its larger id.
    pub fn order(self) -> u8 {
        match self {
            SectionCode::Custom => 0,
            SectionCode::Type => 1,
            SectionCode::Import => 2,
            SectionCode::Function => 3,
            SectionCode::Table => 4,
            SectionCode::Memory => 5,
            SectionCode::Global => 6,
            SectionCode::Export => 7,
            SectionCode::Start => 8,
            SectionCode::Element => 9,
            SectionCode::DataCount => 10,
            SectionCode::Code => 11,
            SectionCode::Data => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub desc: ExportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// Active element segment initializing a table with function indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub table_idx: u32,
    pub offset: ConstExpr,
    pub init: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMode {
    Active { memory_idx: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub mode: DataMode,
    pub init: Vec<u8>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub locals: Vec<FunctionLocal>,
    pub code: Vec<Instruction>,
}

impl Function {
    pub fn local_count(&self) -> usize {
        self.locals.iter().map(|l| l.type_count as usize).sum()
    }
}
