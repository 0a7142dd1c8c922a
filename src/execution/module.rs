use super::store::{FuncAddr, GlobalAddr, MemoryAddr, TableAddr};
use crate::binary::{
    module::ModuleDefinition,
    types::{ExternType, FuncType},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

/// Address of an exported item inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalValue {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemoryAddr),
    Global(GlobalAddr),
}

/// Result of an export lookup: where the item lives and its current type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHandle {
    pub value: ExternalValue,
    pub ty: ExternType,
}

/// Store objects created by one instance, released when it is unregistered.
/// Imported items are not listed here; they belong to their provider.
#[derive(Debug, Default, Clone)]
pub struct Allocations {
    pub funcs: Vec<FuncAddr>,
    pub tables: Vec<TableAddr>,
    pub memories: Vec<MemoryAddr>,
    pub globals: Vec<GlobalAddr>,
}

#[derive(Debug, Default)]
pub struct ModuleInstance {
    pub name: String,
    /// `None` for host modules.
    pub definition: Option<Arc<ModuleDefinition>>,
    pub types: Vec<FuncType>,
    pub funcs: Vec<FuncAddr>,
    pub tables: Vec<TableAddr>,
    pub memories: Vec<MemoryAddr>,
    pub globals: Vec<GlobalAddr>,
    pub exports: HashMap<String, ExternalValue>,
    /// Names of the modules this instance imports from.
    pub dependencies: BTreeSet<String>,
    pub allocated: Allocations,
}
