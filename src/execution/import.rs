use super::{
    module::ExternalValue,
    store::{InstanceAddr, MemoryInst, Store},
    value::Value,
};
use crate::binary::types::{FuncType, ValueType};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Host function callable from WebAssembly. Errors surface as a
/// `HostCallFailed` trap, except [`ProcExit`] which becomes `Exit(code)`.
pub type HostFunc = Arc<dyn Fn(&mut Caller<'_>, &[Value]) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// Returned (through `anyhow`) by a host function to stop the guest with an
/// exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process exited with code {0}")]
pub struct ProcExit(pub i32);

/// View of the calling instance handed to host functions.
pub struct Caller<'a> {
    store: &'a mut Store,
    instance: Option<InstanceAddr>,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(store: &'a mut Store, instance: Option<InstanceAddr>) -> Self {
        Self { store, instance }
    }

    /// Name of the calling module, `None` when called directly by the host.
    pub fn module_name(&self) -> Option<&str> {
        let instance = self.store.instances.get(self.instance?)?;
        Some(&instance.name)
    }

    /// Memory 0 of the calling instance.
    pub fn memory(&self) -> Option<&MemoryInst> {
        let instance = self.store.instances.get(self.instance?)?;
        let addr = *instance.memories.first()?;
        self.store.memories.get(addr)
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryInst> {
        let instance = self.store.instances.get(self.instance?)?;
        let addr = *instance.memories.first()?;
        self.store.memories.get_mut(addr)
    }

    pub fn export(&self, name: &str) -> Option<ExternalValue> {
        let instance = self.store.instances.get(self.instance?)?;
        instance.exports.get(name).copied()
    }
}

#[derive(Clone)]
pub struct HostFuncDef {
    pub field: String,
    pub func_type: FuncType,
    pub func: HostFunc,
}

/// A named set of host functions, registered like any other module.
#[derive(Clone)]
pub struct HostModule {
    name: String,
    funcs: Vec<HostFuncDef>,
}

impl HostModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: vec![],
        }
    }

    /// Adds a function export. Field names must be unique; registration
    /// rejects a module that repeats one.
    pub fn func(
        mut self,
        field: impl Into<String>,
        params: &[ValueType],
        results: &[ValueType],
        func: impl Fn(&mut Caller<'_>, &[Value]) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.funcs.push(HostFuncDef {
            field: field.into(),
            func_type: FuncType::new(params, results),
            func: Arc::new(func),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn funcs(&self) -> &[HostFuncDef] {
        &self.funcs
    }
}

/// Unpacks the arguments of a host function taking `N` i32 parameters.
pub(crate) fn i32_args<const N: usize>(args: &[Value]) -> anyhow::Result<[i32; N]> {
    if args.len() != N {
        anyhow::bail!("expected {N} arguments, got {}", args.len());
    }
    let mut values = [0; N];
    for (value, arg) in values.iter_mut().zip(args) {
        *value = arg
            .as_i32()
            .ok_or_else(|| anyhow::anyhow!("expected an i32 argument, got {}", arg.value_type()))?;
    }
    Ok(values)
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostModule")
            .field("name", &self.name)
            .field(
                "funcs",
                &self
                    .funcs
                    .iter()
                    .map(|def| format!("{}: {}", def.field, def.func_type))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::HostModule;
    use crate::{binary::types::ValueType, execution::value::Value};

    #[test]
    fn host_module_builder() {
        let module = HostModule::new("env")
            .func("add", &[ValueType::I32, ValueType::I32], &[ValueType::I32], |_, args| {
                let (Some(a), Some(b)) = (args[0].as_i32(), args[1].as_i32()) else {
                    anyhow::bail!("expected i32 arguments");
                };
                Ok(vec![Value::I32(a + b)])
            })
            .func("log", &[ValueType::I32], &[], |_, _| Ok(vec![]));

        assert_eq!(module.name(), "env");
        assert_eq!(module.funcs().len(), 2);
        assert_eq!(module.funcs()[0].func_type.to_string(), "(i32, i32) -> (i32)");
        assert_eq!(
            format!("{module:?}"),
            r#"HostModule { name: "env", funcs: ["add: (i32, i32) -> (i32)", "log: (i32) -> ()"] }"#
        );
    }
}
