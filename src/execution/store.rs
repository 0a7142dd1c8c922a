use super::{import::HostFunc, module::ModuleInstance, value::Value};
use crate::{
    binary::{
        module::{ModuleDefinition, MAX_PAGES},
        section::Function,
        types::{FuncType, GlobalType, Limits, MemoryType, TableType},
    },
    error::TrapKind,
};
use std::{fmt, sync::Arc};

pub const PAGE_SIZE: usize = 65536;

pub type FuncAddr = usize;
pub type TableAddr = usize;
pub type MemoryAddr = usize;
pub type GlobalAddr = usize;
pub type InstanceAddr = usize;

/// Slot arena. Freed slots are never reused, so a stale address can only
/// miss, never alias a newer object.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { slots: vec![] }
    }
}

impl<T> Arena<T> {
    pub fn alloc(&mut self, value: T) -> usize {
        self.slots.push(Some(value));
        self.slots.len() - 1
    }

    pub fn get(&self, addr: usize) -> Option<&T> {
        self.slots.get(addr).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, addr: usize) -> Option<&mut T> {
        self.slots.get_mut(addr).and_then(Option::as_mut)
    }

    pub fn free(&mut self, addr: usize) -> Option<T> {
        self.slots.get_mut(addr).and_then(Option::take)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every runtime object of a host context. Instances refer to each other
/// only through addresses into these arenas.
#[derive(Debug, Default)]
pub struct Store {
    pub funcs: Arena<FuncInst>,
    pub tables: Arena<TableInst>,
    pub memories: Arena<MemoryInst>,
    pub globals: Arena<GlobalInst>,
    pub instances: Arena<ModuleInstance>,
}

#[derive(Debug, Clone)]
pub struct InternalFuncInst {
    pub func_type: FuncType,
    pub instance: InstanceAddr,
    pub definition: Arc<ModuleDefinition>,
    pub code_idx: usize,
    pub func_idx: u32,
}

impl InternalFuncInst {
    pub fn body(&self) -> Option<&Function> {
        self.definition.code.get(self.code_idx)
    }
}

#[derive(Clone)]
pub struct ExternalFuncInst {
    pub module: String,
    pub field: String,
    pub func_type: FuncType,
    pub func: HostFunc,
}

impl fmt::Debug for ExternalFuncInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalFuncInst")
            .field("module", &self.module)
            .field("field", &self.field)
            .field("func_type", &self.func_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum FuncInst {
    Internal(InternalFuncInst),
    External(ExternalFuncInst),
}

impl FuncInst {
    pub fn func_type(&self) -> &FuncType {
        match self {
            FuncInst::Internal(func) => &func.func_type,
            FuncInst::External(func) => &func.func_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableInst {
    pub elements: Vec<Option<FuncAddr>>,
    pub max: Option<u32>,
}

impl TableInst {
    pub fn new(ty: TableType) -> Self {
        Self {
            elements: vec![None; ty.limits.min as usize],
            max: ty.limits.max,
        }
    }

    pub fn ty(&self) -> TableType {
        TableType {
            limits: Limits {
                min: self.elements.len() as u32,
                max: self.max,
            },
        }
    }

    pub fn get(&self, idx: u32) -> Result<FuncAddr, TrapKind> {
        match self.elements.get(idx as usize) {
            Some(Some(addr)) => Ok(*addr),
            Some(None) => Err(TrapKind::UninitializedElement),
            None => Err(TrapKind::UndefinedElement),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryInst {
    pub data: Vec<u8>,
    pub max: Option<u32>,
    /// Host-imposed cap in pages, applied on top of `max`.
    pub limit: Option<u32>,
}

impl MemoryInst {
    pub fn new(ty: MemoryType, limit: Option<u32>) -> Self {
        Self {
            data: vec![0; ty.limits.min as usize * PAGE_SIZE],
            max: ty.limits.max,
            limit,
        }
    }

    pub fn ty(&self) -> MemoryType {
        MemoryType {
            limits: Limits {
                min: self.size(),
                max: self.max,
            },
        }
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grows by `delta` pages and returns the previous size, or `None` when
    /// the new size would exceed the declared maximum or the host limit.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.size();
        let new = old.checked_add(delta)?;
        let cap = [Some(MAX_PAGES), self.max, self.limit]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(MAX_PAGES);
        if new > cap {
            return None;
        }
        self.data.resize(new as usize * PAGE_SIZE, 0);
        Some(old)
    }

    fn range(&self, start: u64, len: u64) -> Result<std::ops::Range<usize>, TrapKind> {
        let end = start
            .checked_add(len)
            .ok_or(TrapKind::OutOfBoundsMemory)?;
        if end > self.data.len() as u64 {
            return Err(TrapKind::OutOfBoundsMemory);
        }
        Ok(start as usize..end as usize)
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], TrapKind> {
        let range = self.range(offset as u64, len as u64)?;
        Ok(&self.data[range])
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), TrapKind> {
        let range = self.range(offset as u64, bytes.len() as u64)?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, TrapKind> {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.read(offset, 4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), TrapKind> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Reads `N` bytes at the effective address `addr + offset`.
    pub fn load<const N: usize>(&self, addr: u32, offset: u32) -> Result<[u8; N], TrapKind> {
        let range = self.range(u64::from(addr) + u64::from(offset), N as u64)?;
        let mut bytes = [0; N];
        bytes.copy_from_slice(&self.data[range]);
        Ok(bytes)
    }

    pub fn store(&mut self, addr: u32, offset: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let range = self.range(u64::from(addr) + u64::from(offset), bytes.len() as u64)?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), TrapKind> {
        let src = self.range(u64::from(src), u64::from(len))?;
        let dst = self.range(u64::from(dst), u64::from(len))?;
        self.data.copy_within(src, dst.start);
        Ok(())
    }

    pub fn fill(&mut self, dst: u32, value: u8, len: u32) -> Result<(), TrapKind> {
        let range = self.range(u64::from(dst), u64::from(len))?;
        self.data[range].fill(value);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GlobalInst {
    pub ty: GlobalType,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::{Arena, MemoryInst, TableInst, PAGE_SIZE};
    use crate::{
        binary::types::{Limits, MemoryType, TableType},
        error::TrapKind,
    };

    fn memory(min: u32, max: Option<u32>, limit: Option<u32>) -> MemoryInst {
        MemoryInst::new(
            MemoryType {
                limits: Limits { min, max },
            },
            limit,
        )
    }

    #[test]
    fn arena_never_reuses_slots() {
        let mut arena = Arena::default();
        let a = arena.alloc("a");
        assert_eq!(arena.free(a), Some("a"));
        let b = arena.alloc("b");
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn memory_grow_respects_max_and_limit() {
        let mut mem = memory(1, Some(3), None);
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.grow(2), None);
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.data.len(), 2 * PAGE_SIZE);

        let mut mem = memory(1, None, Some(2));
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.grow(1), None);
    }

    #[test]
    fn memory_bounds() {
        let mut mem = memory(1, None, None);
        mem.store(PAGE_SIZE as u32 - 4, 0, &42i32.to_le_bytes())
            .expect("store at the last word");
        assert_eq!(
            i32::from_le_bytes(mem.load(PAGE_SIZE as u32 - 8, 4).expect("load")),
            42
        );
        assert_eq!(
            mem.load::<4>(PAGE_SIZE as u32 - 3, 0),
            Err(TrapKind::OutOfBoundsMemory)
        );
        assert_eq!(
            mem.load::<1>(u32::MAX, u32::MAX),
            Err(TrapKind::OutOfBoundsMemory)
        );
    }

    #[test]
    fn memory_copy_and_fill() {
        let mut mem = memory(1, None, None);
        mem.write(0, b"abcdef").expect("write");
        mem.copy(2, 0, 4).expect("overlapping copy");
        assert_eq!(mem.read(0, 6).expect("read"), b"ababcd");
        mem.fill(1, b'z', 2).expect("fill");
        assert_eq!(mem.read(0, 4).expect("read"), b"azzb");
        assert_eq!(mem.fill(PAGE_SIZE as u32, 0, 1), Err(TrapKind::OutOfBoundsMemory));
        assert_eq!(mem.fill(PAGE_SIZE as u32, 0, 0), Ok(()));
    }

    #[test]
    fn table_elements() {
        let mut table = TableInst::new(TableType {
            limits: Limits { min: 2, max: None },
        });
        table.elements[0] = Some(7);
        assert_eq!(table.get(0), Ok(7));
        assert_eq!(table.get(1), Err(TrapKind::UninitializedElement));
        assert_eq!(table.get(2), Err(TrapKind::UndefinedElement));
    }
}
