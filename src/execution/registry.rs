use super::{
    import::HostModule,
    module::{ExportHandle, ExternalValue, ModuleInstance},
    runtime::{self, ExecutionOptions},
    store::{
        ExternalFuncInst, FuncAddr, FuncInst, GlobalAddr, GlobalInst, InstanceAddr, InternalFuncInst,
        MemoryAddr, MemoryInst, Store, TableAddr, TableInst, PAGE_SIZE,
    },
    value::Value,
};
use crate::{
    binary::{
        module::ModuleDefinition,
        section::DataMode,
        types::{ConstExpr, ExportDesc, ExternType, ImportDesc},
    },
    error::{InstantiationError, LinkError, LookupError, RegisterError, Trap},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info};

/// Import bindings of a module being registered, in index-space order.
#[derive(Debug, Default)]
struct Imports {
    funcs: Vec<FuncAddr>,
    tables: Vec<TableAddr>,
    memories: Vec<MemoryAddr>,
    globals: Vec<GlobalAddr>,
    dependencies: BTreeSet<String>,
}

/// Everything computed before the first allocation.
#[derive(Debug, Default)]
struct Layout {
    globals: Vec<Value>,
    element_offsets: Vec<usize>,
    data_offsets: Vec<Option<usize>>,
}

/// Named module instances over one store. Imports are bound by
/// `(module, field)` at registration time.
#[derive(Debug, Default)]
pub struct Registry {
    store: Store,
    names: BTreeMap<String, InstanceAddr>,
    memory_limit: Option<u32>,
    options: ExecutionOptions,
}

impl Registry {
    pub fn new(memory_limit: Option<u32>, options: ExecutionOptions) -> Self {
        Self {
            memory_limit,
            options,
            ..Default::default()
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.keys().map(String::as_str)
    }

    pub fn instance(&self, name: &str) -> Option<&ModuleInstance> {
        let addr = *self.names.get(name)?;
        self.store.instances.get(addr)
    }

    /// Links `definition` against the registered modules and inserts it
    /// under `name`. On any error nothing is inserted and no store object
    /// survives.
    pub fn register(
        &mut self,
        name: &str,
        definition: Arc<ModuleDefinition>,
    ) -> Result<(), RegisterError> {
        if self.contains(name) {
            return Err(RegisterError::DuplicateName(name.to_string()));
        }

        let imports = self.resolve_imports(&definition)?;
        let mut layout = self.layout(&definition, &imports)?;
        let globals = std::mem::take(&mut layout.globals);
        let (addr, start) = self.allocate(name, &definition, imports, globals);
        self.names.insert(name.to_string(), addr);

        if let Err(err) = self.initialize(addr, &definition, &layout) {
            self.remove(name);
            return Err(err.into());
        }

        if let Some(start) = start {
            debug!(module = name, "running start function");
            if let Err(trap) = runtime::invoke(&mut self.store, start, &[], &self.options) {
                self.remove(name);
                return Err(InstantiationError::StartTrapped(trap).into());
            }
        }

        info!(
            module = name,
            imports = definition.imports.len(),
            exports = definition.exports.len(),
            "registered module"
        );
        Ok(())
    }

    /// Registers host functions as an instance whose exports are the
    /// functions' field names.
    pub fn register_host(&mut self, module: &HostModule) -> Result<(), RegisterError> {
        let name = module.name();
        if self.contains(name) {
            return Err(RegisterError::DuplicateName(name.to_string()));
        }
        let mut fields = BTreeSet::new();
        if let Some(def) = module.funcs().iter().find(|def| !fields.insert(def.field.as_str())) {
            return Err(RegisterError::DuplicateField {
                module: name.to_string(),
                field: def.field.clone(),
            });
        }

        let addr = self.store.instances.alloc(ModuleInstance::default());
        let mut instance = ModuleInstance {
            name: name.to_string(),
            ..Default::default()
        };
        for def in module.funcs() {
            let func = self.store.funcs.alloc(FuncInst::External(ExternalFuncInst {
                module: name.to_string(),
                field: def.field.clone(),
                func_type: def.func_type.clone(),
                func: Arc::clone(&def.func),
            }));
            instance.types.push(def.func_type.clone());
            instance.funcs.push(func);
            instance.allocated.funcs.push(func);
            instance
                .exports
                .insert(def.field.clone(), ExternalValue::Func(func));
        }
        if let Some(slot) = self.store.instances.get_mut(addr) {
            *slot = instance;
        }
        self.names.insert(name.to_string(), addr);

        info!(module = name, funcs = module.funcs().len(), "registered host module");
        Ok(())
    }

    pub fn lookup_export(&self, module: &str, name: &str) -> Result<ExportHandle, LookupError> {
        let not_found = || LookupError::NotFound {
            module: module.to_string(),
            name: name.to_string(),
        };
        let instance = self
            .instance(module)
            .ok_or_else(|| LookupError::ModuleNotFound(module.to_string()))?;
        let value = instance.exports.get(name).copied().ok_or_else(not_found)?;
        let ty = self.extern_type(value).ok_or_else(not_found)?;
        Ok(ExportHandle { value, ty })
    }

    /// Current type of a store object. Tables and memories report their
    /// current size as the minimum.
    pub fn extern_type(&self, value: ExternalValue) -> Option<ExternType> {
        let ty = match value {
            ExternalValue::Func(addr) => ExternType::Func(self.store.funcs.get(addr)?.func_type().clone()),
            ExternalValue::Table(addr) => ExternType::Table(self.store.tables.get(addr)?.ty()),
            ExternalValue::Memory(addr) => ExternType::Memory(self.store.memories.get(addr)?.ty()),
            ExternalValue::Global(addr) => ExternType::Global(self.store.globals.get(addr)?.ty),
        };
        Some(ty)
    }

    /// Names of the registered modules importing from `name`, or owning a
    /// table that holds one of its functions.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let funcs = self
            .instance(name)
            .map(|instance| instance.allocated.funcs.as_slice())
            .unwrap_or_default();
        self.names
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .filter_map(|(other, addr)| {
                let instance = self.store.instances.get(*addr)?;
                (instance.dependencies.contains(name) || self.holds_any(instance, funcs))
                    .then(|| other.clone())
            })
            .collect()
    }

    /// Whether a table allocated by `instance` refers to any of `funcs`.
    fn holds_any(&self, instance: &ModuleInstance, funcs: &[FuncAddr]) -> bool {
        instance
            .allocated
            .tables
            .iter()
            .filter_map(|addr| self.store.tables.get(*addr))
            .flat_map(|table| table.elements.iter().flatten())
            .any(|func| funcs.contains(func))
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegisterError> {
        if !self.contains(name) {
            return Err(RegisterError::NotRegistered(name.to_string()));
        }
        let dependents = self.dependents(name);
        if !dependents.is_empty() {
            return Err(RegisterError::InUse {
                name: name.to_string(),
                dependents,
            });
        }
        self.remove(name);
        info!(module = name, "unregistered module");
        Ok(())
    }

    /// Removes `name` together with every module that transitively imports
    /// from it. Returns the removed names, dependents first.
    pub fn unregister_cascade(&mut self, name: &str) -> Result<Vec<String>, RegisterError> {
        if !self.contains(name) {
            return Err(RegisterError::NotRegistered(name.to_string()));
        }
        let mut order = vec![];
        self.removal_order(name, &mut BTreeSet::new(), &mut order);
        for module in &order {
            self.remove(module);
        }
        info!(module = name, removed = ?order, "unregistered module with dependents");
        Ok(order)
    }

    /// Post-order over dependents. A table owner and the module whose
    /// functions it holds can depend on each other, so visits are tracked.
    fn removal_order(&self, name: &str, visited: &mut BTreeSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        for dependent in self.dependents(name) {
            self.removal_order(&dependent, visited, order);
        }
        order.push(name.to_string());
    }

    /// Runs a function without any type checks on `args`.
    pub(crate) fn invoke(&mut self, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        runtime::invoke(&mut self.store, addr, args, &self.options)
    }

    pub fn memory(&self, module: &str, name: &str) -> Result<&MemoryInst, LookupError> {
        let addr = self.memory_addr(module, name)?;
        self.store.memories.get(addr).ok_or_else(|| LookupError::NotFound {
            module: module.to_string(),
            name: name.to_string(),
        })
    }

    pub fn memory_mut(&mut self, module: &str, name: &str) -> Result<&mut MemoryInst, LookupError> {
        let addr = self.memory_addr(module, name)?;
        self.store.memories.get_mut(addr).ok_or_else(|| LookupError::NotFound {
            module: module.to_string(),
            name: name.to_string(),
        })
    }

    fn memory_addr(&self, module: &str, name: &str) -> Result<MemoryAddr, LookupError> {
        match self.lookup_export(module, name)?.value {
            ExternalValue::Memory(addr) => Ok(addr),
            _ => Err(LookupError::KindMismatch {
                module: module.to_string(),
                name: name.to_string(),
                expected: "memory",
            }),
        }
    }

    fn resolve_imports(&self, definition: &ModuleDefinition) -> Result<Imports, LinkError> {
        let mut imports = Imports::default();
        for import in &definition.imports {
            let handle = self
                .lookup_export(&import.module, &import.field)
                .map_err(|_| LinkError::UnresolvedImport {
                    module: import.module.clone(),
                    field: import.field.clone(),
                })?;
            let mismatch = |expected: String| LinkError::TypeMismatch {
                module: import.module.clone(),
                field: import.field.clone(),
                expected,
                found: handle.ty.to_string(),
            };

            match (import.desc, &handle.ty, handle.value) {
                (ImportDesc::Func(type_idx), ExternType::Func(found), ExternalValue::Func(addr)) => {
                    let expected = definition
                        .types
                        .get(type_idx as usize)
                        .ok_or_else(|| mismatch(format!("func type {type_idx}")))?;
                    if expected != found {
                        return Err(mismatch(format!("func {expected}")));
                    }
                    imports.funcs.push(addr);
                }
                (ImportDesc::Table(expected), ExternType::Table(found), ExternalValue::Table(addr)) => {
                    if !found.limits.satisfies(&expected.limits) {
                        return Err(mismatch(ExternType::Table(expected).to_string()));
                    }
                    imports.tables.push(addr);
                }
                (ImportDesc::Memory(expected), ExternType::Memory(found), ExternalValue::Memory(addr)) => {
                    if !found.limits.satisfies(&expected.limits) {
                        return Err(mismatch(ExternType::Memory(expected).to_string()));
                    }
                    imports.memories.push(addr);
                }
                (ImportDesc::Global(expected), ExternType::Global(found), ExternalValue::Global(addr)) => {
                    if expected != *found {
                        return Err(mismatch(ExternType::Global(expected).to_string()));
                    }
                    imports.globals.push(addr);
                }
                (desc, _, _) => return Err(mismatch(import_kind(desc).to_string())),
            }
            imports.dependencies.insert(import.module.clone());
        }
        Ok(imports)
    }

    /// Evaluates initializers and checks every segment against its target
    /// before anything is allocated.
    fn layout(
        &self,
        definition: &ModuleDefinition,
        imports: &Imports,
    ) -> Result<Layout, InstantiationError> {
        if let Some(limit) = self.memory_limit {
            for memory in &definition.memories {
                if memory.limits.min > limit {
                    return Err(InstantiationError::MemoryLimitExceeded {
                        requested: memory.limits.min,
                        limit,
                    });
                }
            }
        }

        let mut layout = Layout::default();
        for global in &definition.globals {
            layout.globals.push(self.eval_const(global.init, imports)?);
        }

        for (index, element) in definition.elements.iter().enumerate() {
            let offset = self.eval_offset(element.offset, imports)?;
            let table_idx = element.table_idx as usize;
            let size = match imports.tables.get(table_idx) {
                Some(addr) => self.store.tables.get(*addr).map_or(0, |t| t.elements.len()),
                None => definition
                    .tables
                    .get(table_idx - imports.tables.len())
                    .map_or(0, |t| t.limits.min as usize),
            };
            if offset + element.init.len() > size {
                return Err(InstantiationError::SegmentOutOfBounds {
                    segment: "element",
                    index,
                });
            }
            layout.element_offsets.push(offset);
        }

        for (index, data) in definition.data.iter().enumerate() {
            let DataMode::Active { memory_idx, offset } = data.mode else {
                layout.data_offsets.push(None);
                continue;
            };
            let offset = self.eval_offset(offset, imports)?;
            let memory_idx = memory_idx as usize;
            let size = match imports.memories.get(memory_idx) {
                Some(addr) => self.store.memories.get(*addr).map_or(0, |m| m.data.len()),
                None => definition
                    .memories
                    .get(memory_idx - imports.memories.len())
                    .map_or(0, |m| m.limits.min as usize * PAGE_SIZE),
            };
            if offset + data.init.len() > size {
                return Err(InstantiationError::SegmentOutOfBounds {
                    segment: "data",
                    index,
                });
            }
            layout.data_offsets.push(Some(offset));
        }

        Ok(layout)
    }

    fn eval_const(&self, expr: ConstExpr, imports: &Imports) -> Result<Value, InstantiationError> {
        let value = match expr {
            ConstExpr::I32Const(v) => Value::I32(v),
            ConstExpr::I64Const(v) => Value::I64(v),
            ConstExpr::F32Const(bits) => Value::F32(f32::from_bits(bits)),
            ConstExpr::F64Const(bits) => Value::F64(f64::from_bits(bits)),
            ConstExpr::GlobalGet(idx) => imports
                .globals
                .get(idx as usize)
                .and_then(|addr| self.store.globals.get(*addr))
                .map(|global| global.value)
                .ok_or(InstantiationError::UnknownGlobal(idx))?,
        };
        Ok(value)
    }

    /// Segment offsets are i32 values read as unsigned.
    fn eval_offset(&self, expr: ConstExpr, imports: &Imports) -> Result<usize, InstantiationError> {
        let offset = self.eval_const(expr, imports)?.as_i32().unwrap_or_default();
        Ok(offset as u32 as usize)
    }

    /// Allocates the instance and its store objects. Returns the instance
    /// address and the address of the start function, if any.
    fn allocate(
        &mut self,
        name: &str,
        definition: &Arc<ModuleDefinition>,
        imports: Imports,
        globals: Vec<Value>,
    ) -> (InstanceAddr, Option<FuncAddr>) {
        let addr = self.store.instances.alloc(ModuleInstance::default());
        let mut instance = ModuleInstance {
            name: name.to_string(),
            definition: Some(Arc::clone(definition)),
            types: definition.types.clone(),
            funcs: imports.funcs,
            tables: imports.tables,
            memories: imports.memories,
            globals: imports.globals,
            dependencies: imports.dependencies,
            ..Default::default()
        };

        let imported_funcs = instance.funcs.len() as u32;
        for (code_idx, type_idx) in definition.functions.iter().enumerate() {
            // type indices were checked at load
            let func_type = definition
                .types
                .get(*type_idx as usize)
                .cloned()
                .unwrap_or_default();
            let func = self.store.funcs.alloc(FuncInst::Internal(InternalFuncInst {
                func_type,
                instance: addr,
                definition: Arc::clone(definition),
                code_idx,
                func_idx: imported_funcs + code_idx as u32,
            }));
            instance.funcs.push(func);
            instance.allocated.funcs.push(func);
        }

        for ty in &definition.tables {
            let table = self.store.tables.alloc(TableInst::new(*ty));
            instance.tables.push(table);
            instance.allocated.tables.push(table);
        }

        for ty in &definition.memories {
            let memory = self
                .store
                .memories
                .alloc(MemoryInst::new(*ty, self.memory_limit));
            instance.memories.push(memory);
            instance.allocated.memories.push(memory);
        }

        for (global, value) in definition.globals.iter().zip(globals) {
            let global = self.store.globals.alloc(GlobalInst {
                ty: global.ty,
                value,
            });
            instance.globals.push(global);
            instance.allocated.globals.push(global);
        }

        for export in &definition.exports {
            let value = match export.desc {
                ExportDesc::Func(idx) => instance.funcs.get(idx as usize).copied().map(ExternalValue::Func),
                ExportDesc::Table(idx) => instance.tables.get(idx as usize).copied().map(ExternalValue::Table),
                ExportDesc::Memory(idx) => instance
                    .memories
                    .get(idx as usize)
                    .copied()
                    .map(ExternalValue::Memory),
                ExportDesc::Global(idx) => instance
                    .globals
                    .get(idx as usize)
                    .copied()
                    .map(ExternalValue::Global),
            };
            if let Some(value) = value {
                instance.exports.insert(export.name.clone(), value);
            }
        }

        let start = definition
            .start
            .and_then(|idx| instance.funcs.get(idx as usize).copied());
        if let Some(slot) = self.store.instances.get_mut(addr) {
            *slot = instance;
        }
        (addr, start)
    }

    /// Copies element and data segments into their targets.
    fn initialize(
        &mut self,
        addr: InstanceAddr,
        definition: &ModuleDefinition,
        layout: &Layout,
    ) -> Result<(), InstantiationError> {
        let Some(instance) = self.store.instances.get(addr) else {
            return Ok(());
        };
        let (funcs, tables, memories) = (
            instance.funcs.clone(),
            instance.tables.clone(),
            instance.memories.clone(),
        );

        for (index, (element, offset)) in definition
            .elements
            .iter()
            .zip(&layout.element_offsets)
            .enumerate()
        {
            let out_of_bounds = InstantiationError::SegmentOutOfBounds {
                segment: "element",
                index,
            };
            let table = tables
                .get(element.table_idx as usize)
                .and_then(|addr| self.store.tables.get_mut(*addr))
                .ok_or_else(|| out_of_bounds.clone())?;
            let slots = table
                .elements
                .get_mut(*offset..*offset + element.init.len())
                .ok_or(out_of_bounds)?;
            for (slot, func_idx) in slots.iter_mut().zip(&element.init) {
                *slot = funcs.get(*func_idx as usize).copied();
            }
        }

        for (index, (data, offset)) in definition.data.iter().zip(&layout.data_offsets).enumerate() {
            let (DataMode::Active { memory_idx, .. }, Some(offset)) = (&data.mode, offset) else {
                continue;
            };
            let out_of_bounds = InstantiationError::SegmentOutOfBounds {
                segment: "data",
                index,
            };
            let memory = memories
                .get(*memory_idx as usize)
                .and_then(|addr| self.store.memories.get_mut(*addr))
                .ok_or_else(|| out_of_bounds.clone())?;
            memory
                .write(*offset, &data.init)
                .map_err(|_| out_of_bounds)?;
        }

        Ok(())
    }

    /// Drops the name and frees everything the instance allocated.
    fn remove(&mut self, name: &str) -> Option<ModuleInstance> {
        let addr = self.names.remove(name)?;
        let instance = self.store.instances.free(addr)?;
        for addr in &instance.allocated.funcs {
            self.store.funcs.free(*addr);
        }
        for addr in &instance.allocated.tables {
            self.store.tables.free(*addr);
        }
        // A failed registration may already have filled a surviving table.
        for addr in instance.tables.iter().filter(|addr| !instance.allocated.tables.contains(*addr)) {
            if let Some(table) = self.store.tables.get_mut(*addr) {
                for slot in &mut table.elements {
                    if slot.is_some_and(|func| instance.allocated.funcs.contains(&func)) {
                        *slot = None;
                    }
                }
            }
        }
        for addr in &instance.allocated.memories {
            self.store.memories.free(*addr);
        }
        for addr in &instance.allocated.globals {
            self.store.globals.free(*addr);
        }
        debug!(module = name, "released instance");
        Some(instance)
    }
}

fn import_kind(desc: ImportDesc) -> &'static str {
    match desc {
        ImportDesc::Func(_) => "func",
        ImportDesc::Table(_) => "table",
        ImportDesc::Memory(_) => "memory",
        ImportDesc::Global(_) => "global",
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::{
        binary::{
            module::ModuleDefinition,
            types::{ExternType, FuncType, GlobalType, ValueType},
        },
        error::{InstantiationError, LinkError, LookupError, RegisterError, Trap, TrapKind},
        execution::{
            import::HostModule,
            module::ExternalValue,
            runtime::ExecutionOptions,
            value::Value,
        },
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn definition(source: &str) -> Result<Arc<ModuleDefinition>> {
        let wasm = wat::parse_str(source)?;
        Ok(Arc::new(ModuleDefinition::new(&wasm)?))
    }

    fn fixture(path: &str) -> Result<Arc<ModuleDefinition>> {
        let wasm = wat::parse_file(path)?;
        Ok(Arc::new(ModuleDefinition::new(&wasm)?))
    }

    fn call(registry: &mut Registry, module: &str, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let ExternalValue::Func(addr) = registry.lookup_export(module, name)?.value else {
            anyhow::bail!("{module}.{name} is not a function");
        };
        Ok(registry.invoke(addr, args)?)
    }

    fn library() -> Result<Registry> {
        let mut registry = Registry::default();
        registry.register("book", fixture("src/fixtures/book.wat")?)?;
        Ok(registry)
    }

    #[test]
    fn register_then_lookup() -> Result<()> {
        let registry = library()?;
        let handle = registry.lookup_export("book", "add")?;
        assert_eq!(
            handle.ty,
            ExternType::Func(FuncType::new(
                [ValueType::I32, ValueType::I32],
                [ValueType::I32]
            ))
        );

        assert_eq!(
            registry.lookup_export("book", "sub"),
            Err(LookupError::NotFound {
                module: "book".into(),
                name: "sub".into()
            })
        );
        assert_eq!(
            registry.lookup_export("shelf", "add"),
            Err(LookupError::ModuleNotFound("shelf".into()))
        );
        Ok(())
    }

    #[test]
    fn link_by_name() -> Result<()> {
        let mut registry = library()?;
        registry.register("app", fixture("src/fixtures/app.wat")?)?;

        let ExternalValue::Func(add) = registry.lookup_export("book", "add")?.value else {
            anyhow::bail!("book.add is not a function");
        };
        let app = registry.instance("app").expect("app is registered");
        assert_eq!(app.funcs[0], add);
        assert!(app.dependencies.contains("book"));
        assert_eq!(app.allocated.funcs.len(), 1);

        assert_eq!(call(&mut registry, "app", "start", &[])?, vec![Value::I32(42)]);
        assert_eq!(registry.modules().collect::<Vec<_>>(), vec!["app", "book"]);
        Ok(())
    }

    #[test]
    fn unresolved_import_leaves_registry_unchanged() -> Result<()> {
        let mut registry = Registry::default();
        let err = registry
            .register("app", fixture("src/fixtures/app.wat")?)
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Link(LinkError::UnresolvedImport {
                module: "book".into(),
                field: "add".into()
            })
        );
        assert_eq!(registry.modules().count(), 0);
        assert!(registry.store().funcs.is_empty());
        assert!(registry.store().instances.is_empty());
        assert!(matches!(
            registry.lookup_export("app", "start"),
            Err(LookupError::ModuleNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn import_type_mismatch() -> Result<()> {
        let mut registry = Registry::default();
        registry.register(
            "book",
            definition(
                r#"(module
                    (func (export "add") (param i64 i64) (result i64)
                        (i64.add (local.get 0) (local.get 1)))
                    (memory (export "pages") 1))"#,
            )?,
        )?;

        let err = registry
            .register("app", fixture("src/fixtures/app.wat")?)
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Link(LinkError::TypeMismatch {
                module: "book".into(),
                field: "add".into(),
                expected: "func (i32, i32) -> (i32)".into(),
                found: "func (i64, i64) -> (i64)".into(),
            })
        );

        let err = registry
            .register(
                "other",
                definition(r#"(module (import "book" "pages" (func)))"#)?,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RegisterError::Link(LinkError::TypeMismatch { .. })
        ));
        assert_eq!(registry.modules().collect::<Vec<_>>(), vec!["book"]);
        Ok(())
    }

    #[test]
    fn memory_import_limits() -> Result<()> {
        let mut registry = Registry::default();
        registry.register("provider", definition(r#"(module (memory (export "mem") 2 4))"#)?)?;

        let tests = vec![
            (r#"(module (import "provider" "mem" (memory 1)))"#, true),
            (r#"(module (import "provider" "mem" (memory 2 8)))"#, true),
            (r#"(module (import "provider" "mem" (memory 3)))"#, false),
            (r#"(module (import "provider" "mem" (memory 1 3)))"#, false),
        ];
        for (i, (source, ok)) in tests.into_iter().enumerate() {
            let result = registry.register(&format!("user{i}"), definition(source)?);
            assert_eq!(result.is_ok(), ok, "{source}");
        }
        Ok(())
    }

    #[test]
    fn global_import_must_match_exactly() -> Result<()> {
        let mut registry = Registry::default();
        registry.register(
            "env",
            definition(r#"(module (global (export "g") (mut i32) (i32.const 1)))"#)?,
        )?;
        let err = registry
            .register("user", definition(r#"(module (import "env" "g" (global i32)))"#)?)
            .unwrap_err();
        assert!(matches!(
            err,
            RegisterError::Link(LinkError::TypeMismatch { .. })
        ));
        registry.register("user", definition(r#"(module (import "env" "g" (global (mut i32))))"#)?)?;
        Ok(())
    }

    #[test]
    fn duplicate_name_is_rejected() -> Result<()> {
        let mut registry = library()?;
        let err = registry
            .register("book", fixture("src/fixtures/book.wat")?)
            .unwrap_err();
        assert_eq!(err, RegisterError::DuplicateName("book".into()));

        let err = registry.register_host(&HostModule::new("book")).unwrap_err();
        assert_eq!(err, RegisterError::DuplicateName("book".into()));
        Ok(())
    }

    #[test]
    fn unregister_in_use() -> Result<()> {
        let mut registry = library()?;
        registry.register("app", fixture("src/fixtures/app.wat")?)?;

        assert_eq!(
            registry.unregister("book"),
            Err(RegisterError::InUse {
                name: "book".into(),
                dependents: vec!["app".into()]
            })
        );
        assert_eq!(call(&mut registry, "app", "start", &[])?, vec![Value::I32(42)]);

        registry.unregister("app")?;
        registry.unregister("book")?;
        assert!(registry.store().funcs.is_empty());
        assert_eq!(
            registry.unregister("book"),
            Err(RegisterError::NotRegistered("book".into()))
        );
        Ok(())
    }

    #[test]
    fn unregister_cascade_removes_dependents_first() -> Result<()> {
        let mut registry = library()?;
        registry.register("app", fixture("src/fixtures/app.wat")?)?;
        registry.register(
            "shell",
            definition(
                r#"(module
                    (import "app" "start" (func (result i32)))
                    (import "book" "add" (func (param i32 i32) (result i32))))"#,
            )?,
        )?;

        assert_eq!(
            registry.unregister_cascade("book")?,
            vec!["shell".to_string(), "app".to_string(), "book".to_string()]
        );
        assert_eq!(registry.modules().count(), 0);
        assert!(registry.store().instances.is_empty());
        Ok(())
    }

    #[test]
    fn start_function_runs_at_registration() -> Result<()> {
        let mut registry = Registry::default();
        registry.register(
            "init",
            definition(
                r#"(module
                    (global $g (export "g") (mut i32) (i32.const 0))
                    (func $init (global.set $g (i32.const 7)))
                    (start $init))"#,
            )?,
        )?;
        let ExternalValue::Global(addr) = registry.lookup_export("init", "g")?.value else {
            anyhow::bail!("init.g is not a global");
        };
        assert_eq!(registry.store().globals.get(addr).map(|g| g.value), Some(Value::I32(7)));
        Ok(())
    }

    #[test]
    fn start_trap_rolls_back() -> Result<()> {
        let mut registry = Registry::default();
        let err = registry
            .register(
                "broken",
                definition(
                    r#"(module
                        (memory (export "memory") 1)
                        (func $init unreachable)
                        (start $init))"#,
                )?,
            )
            .unwrap_err();
        let RegisterError::Instantiation(InstantiationError::StartTrapped(trap)) = err else {
            anyhow::bail!("unexpected error: {err}");
        };
        assert_eq!(trap.kind, TrapKind::Unreachable);
        assert_eq!(registry.modules().count(), 0);
        assert!(registry.store().memories.is_empty());
        assert!(registry.store().funcs.is_empty());
        Ok(())
    }

    const TABLE_PROVIDER: &str = r#"(module
        (type $get (func (result i32)))
        (table (export "t") 2 funcref)
        (func (export "run") (result i32) (call_indirect (type $get) (i32.const 0))))"#;

    #[test]
    fn element_in_imported_table_pins_module() -> Result<()> {
        let mut registry = Registry::default();
        registry.register("provider", definition(TABLE_PROVIDER)?)?;
        registry.register(
            "user",
            definition(
                r#"(module
                    (import "provider" "t" (table 2 funcref))
                    (func $seven (result i32) (i32.const 7))
                    (elem (i32.const 0) $seven))"#,
            )?,
        )?;
        assert_eq!(call(&mut registry, "provider", "run", &[])?, vec![Value::I32(7)]);

        assert_eq!(
            registry.unregister("user"),
            Err(RegisterError::InUse {
                name: "user".into(),
                dependents: vec!["provider".into()]
            })
        );
        assert_eq!(call(&mut registry, "provider", "run", &[])?, vec![Value::I32(7)]);

        assert_eq!(
            registry.unregister_cascade("provider")?,
            vec!["user".to_string(), "provider".to_string()]
        );
        assert!(registry.store().funcs.is_empty());
        assert!(registry.store().tables.is_empty());
        Ok(())
    }

    #[test]
    fn failed_registration_clears_imported_table() -> Result<()> {
        let mut registry = Registry::default();
        registry.register("provider", definition(TABLE_PROVIDER)?)?;
        let err = registry
            .register(
                "user",
                definition(
                    r#"(module
                        (import "provider" "t" (table 2 funcref))
                        (func $seven (result i32) (i32.const 7))
                        (func $init unreachable)
                        (elem (i32.const 0) $seven)
                        (start $init))"#,
                )?,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RegisterError::Instantiation(InstantiationError::StartTrapped(_))
        ));

        let trap = call(&mut registry, "provider", "run", &[])
            .unwrap_err()
            .downcast::<Trap>()?;
        assert_eq!(trap.kind, TrapKind::UninitializedElement);
        assert!(registry.dependents("provider").is_empty());
        Ok(())
    }

    #[test]
    fn segment_out_of_bounds() -> Result<()> {
        let mut registry = Registry::default();
        let err = registry
            .register(
                "data",
                definition(r#"(module (memory 1) (data (i32.const 65535) "ab"))"#)?,
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Instantiation(InstantiationError::SegmentOutOfBounds {
                segment: "data",
                index: 0
            })
        );

        let err = registry
            .register(
                "elem",
                definition(r#"(module (table 1 funcref) (func $f) (elem (i32.const 1) $f))"#)?,
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Instantiation(InstantiationError::SegmentOutOfBounds {
                segment: "element",
                index: 0
            })
        );
        assert!(registry.store().memories.is_empty());
        assert!(registry.store().tables.is_empty());
        Ok(())
    }

    #[test]
    fn data_segment_into_imported_memory() -> Result<()> {
        let mut registry = Registry::default();
        registry.register("provider", definition(r#"(module (memory (export "mem") 1))"#)?)?;
        registry.register(
            "user",
            definition(
                r#"(module
                    (import "provider" "mem" (memory 1))
                    (data (i32.const 8) "shared"))"#,
            )?,
        )?;
        assert_eq!(registry.memory("provider", "mem")?.read(8, 6)?, b"shared");
        Ok(())
    }

    #[test]
    fn memory_limit() -> Result<()> {
        let mut registry = Registry::new(Some(1), ExecutionOptions::default());
        let err = registry
            .register("big", definition("(module (memory 2))")?)
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Instantiation(InstantiationError::MemoryLimitExceeded {
                requested: 2,
                limit: 1
            })
        );
        registry.register("small", definition("(module (memory 1))")?)?;
        Ok(())
    }

    #[test]
    fn host_module_exports() -> Result<()> {
        let mut registry = Registry::default();
        registry.register_host(&HostModule::new("env").func(
            "add",
            &[ValueType::I32, ValueType::I32],
            &[ValueType::I32],
            |_, args| {
                let (Some(a), Some(b)) = (args[0].as_i32(), args[1].as_i32()) else {
                    anyhow::bail!("expected i32 arguments");
                };
                Ok(vec![Value::I32(a.wrapping_add(b))])
            },
        ))?;
        registry.register(
            "user",
            definition(
                r#"(module
                    (import "env" "add" (func $add (param i32 i32) (result i32)))
                    (func (export "twice") (param i32) (result i32)
                        (call $add (local.get 0) (local.get 0))))"#,
            )?,
        )?;

        assert_eq!(
            call(&mut registry, "user", "twice", &[Value::I32(21)])?,
            vec![Value::I32(42)]
        );
        assert_eq!(registry.dependents("env"), vec!["user".to_string()]);
        assert_eq!(
            registry.memory("env", "add").unwrap_err(),
            LookupError::KindMismatch {
                module: "env".into(),
                name: "add".into(),
                expected: "memory"
            }
        );
        Ok(())
    }

    #[test]
    fn host_module_rejects_repeated_field() -> Result<()> {
        let mut registry = Registry::default();
        let env = HostModule::new("env")
            .func("tick", &[], &[], |_, _| Ok(vec![]))
            .func("tick", &[ValueType::I32], &[], |_, _| Ok(vec![]));
        assert_eq!(
            registry.register_host(&env),
            Err(RegisterError::DuplicateField {
                module: "env".into(),
                field: "tick".into()
            })
        );
        assert_eq!(registry.modules().count(), 0);
        assert!(registry.store().funcs.is_empty());
        Ok(())
    }

    #[test]
    fn exported_global_type() -> Result<()> {
        let mut registry = Registry::default();
        registry.register(
            "env",
            definition(r#"(module (global (export "pi") f64 (f64.const 3.5)))"#)?,
        )?;
        let handle = registry.lookup_export("env", "pi")?;
        assert_eq!(
            handle.ty,
            ExternType::Global(GlobalType {
                value_type: ValueType::F64,
                mutable: false
            })
        );
        Ok(())
    }
}
