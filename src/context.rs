use crate::{
    binary::{
        module::ModuleDefinition,
        types::{ExternType, FuncType},
    },
    config::Config,
    error::{Error, ExecError, LoadError, LookupError, RegisterError},
    execution::{
        dispatcher,
        module::ExportHandle,
        registry::Registry,
        runtime::{ExecutionOptions, InterruptHandle},
        store::MemoryInst,
        value::Value,
    },
};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

/// Owns the registry of one embedding session. Every load, register and
/// execute goes through it; dropping it releases every instance.
#[derive(Debug)]
pub struct HostContext {
    registry: Registry,
    enable_validation: bool,
}

impl HostContext {
    /// Creates a context and registers the configured host modules.
    pub fn new(config: Config) -> Result<Self, RegisterError> {
        let options = ExecutionOptions {
            max_call_depth: config.max_call_depth,
            interrupt: InterruptHandle::default(),
        };
        let mut registry = Registry::new(config.memory_limit, options);
        for module in &config.host_modules {
            registry.register_host(module)?;
        }
        if let Some(wasi) = config.wasi {
            registry.register_host(&wasi.into_host_module())?;
        }

        info!(
            validation = config.enable_validation,
            memory_limit = ?config.memory_limit,
            host_modules = registry.modules().count(),
            "created host context"
        );
        Ok(Self {
            registry,
            enable_validation: config.enable_validation,
        })
    }

    pub fn load(&self, bytes: &[u8]) -> Result<ModuleDefinition, LoadError> {
        ModuleDefinition::load(bytes, self.enable_validation)
    }

    pub fn register(
        &mut self,
        name: &str,
        definition: impl Into<Arc<ModuleDefinition>>,
    ) -> Result<(), RegisterError> {
        self.registry.register(name, definition.into())
    }

    pub fn register_module(&mut self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        let definition = self.load(bytes)?;
        self.register(name, definition)?;
        Ok(())
    }

    pub fn register_module_from_file(&mut self, name: &str, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        debug!(module = name, path = %path.display(), "reading module");
        let bytes = std::fs::read(path)?;
        self.register_module(name, &bytes)
    }

    pub fn lookup_export(&self, module: &str, name: &str) -> Result<ExportHandle, LookupError> {
        self.registry.lookup_export(module, name)
    }

    /// Signature of an exported function.
    pub fn func_type(&self, module: &str, name: &str) -> Result<FuncType, LookupError> {
        match self.lookup_export(module, name)?.ty {
            ExternType::Func(ty) => Ok(ty),
            _ => Err(LookupError::KindMismatch {
                module: module.to_string(),
                name: name.to_string(),
                expected: "function",
            }),
        }
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegisterError> {
        self.registry.unregister(name)
    }

    pub fn unregister_cascade(&mut self, name: &str) -> Result<Vec<String>, RegisterError> {
        self.registry.unregister_cascade(name)
    }

    pub fn execute_registered(
        &mut self,
        module: &str,
        export: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ExecError> {
        dispatcher::execute_registered(&mut self.registry, module, export, args)
    }

    pub fn memory(&self, module: &str, name: &str) -> Result<&MemoryInst, LookupError> {
        self.registry.memory(module, name)
    }

    pub fn memory_mut(&mut self, module: &str, name: &str) -> Result<&mut MemoryInst, LookupError> {
        self.registry.memory_mut(module, name)
    }

    /// Handle for cancelling executions of this context from any thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.registry.options().interrupt.clone()
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> + '_ {
        self.registry.modules()
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        debug!(modules = self.registry.modules().count(), "releasing host context");
    }
}

#[cfg(test)]
mod tests {
    use super::HostContext;
    use crate::{
        binary::types::ValueType,
        config::Config,
        error::{Error, ExecError, LinkError, LoadErrorKind, RegisterError, TrapKind},
        execution::{import::HostModule, value::Value},
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn book_and_app() -> Result<HostContext> {
        let mut context = HostContext::new(Config::default())?;
        context.register_module("book", &wat::parse_file("src/fixtures/book.wat")?)?;
        context.register_module("app", &wat::parse_file("src/fixtures/app.wat")?)?;
        Ok(context)
    }

    #[test]
    fn app_calls_book() -> Result<()> {
        let mut context = book_and_app()?;
        let add = context.execute_registered("book", "add", &[Value::I32(40), Value::I32(1)])?;
        let Some(add) = add[0].as_i32() else {
            anyhow::bail!("book.add returned {add:?}");
        };
        assert_eq!(
            context.execute_registered("app", "start", &[])?,
            vec![Value::I32(add + 1)]
        );
        Ok(())
    }

    #[test]
    fn trap_keeps_context_usable() -> Result<()> {
        let mut context = book_and_app()?;
        let err = context
            .execute_registered("book", "div", &[Value::I32(7), Value::I32(0)])
            .unwrap_err();
        assert!(matches!(err, ExecError::Trap(ref trap) if trap.kind == TrapKind::DivideByZero));

        assert_eq!(
            context.execute_registered("book", "add", &[Value::I32(1), Value::I32(2)])?,
            vec![Value::I32(3)]
        );
        assert_eq!(context.execute_registered("app", "start", &[])?, vec![Value::I32(42)]);
        Ok(())
    }

    #[test]
    fn unregister_with_dependents() -> Result<()> {
        let mut context = book_and_app()?;
        assert!(matches!(
            context.unregister("book"),
            Err(RegisterError::InUse { .. })
        ));
        assert_eq!(context.modules().collect::<Vec<_>>(), vec!["app", "book"]);

        assert_eq!(
            context.unregister_cascade("book")?,
            vec!["app".to_string(), "book".to_string()]
        );
        assert_eq!(context.modules().count(), 0);
        assert!(matches!(
            context.execute_registered("app", "start", &[]),
            Err(ExecError::ModuleNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn unresolved_import_changes_nothing() -> Result<()> {
        let mut context = HostContext::new(Config::default())?;
        let err = context
            .register_module("app", &wat::parse_file("src/fixtures/app.wat")?)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Register(RegisterError::Link(LinkError::UnresolvedImport { .. }))
        ));
        assert_eq!(context.modules().count(), 0);

        context.register_module("book", &wat::parse_file("src/fixtures/book.wat")?)?;
        context.register_module("app", &wat::parse_file("src/fixtures/app.wat")?)?;
        assert_eq!(context.execute_registered("app", "start", &[])?, vec![Value::I32(42)]);
        Ok(())
    }

    #[test]
    fn wrong_arity_never_reaches_host() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = Config::new().host_module(HostModule::new("env").func(
            "tick",
            &[ValueType::I32],
            &[],
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            },
        ));
        let mut context = HostContext::new(config)?;
        context.register_module(
            "user",
            &wat::parse_str(
                r#"(module
                    (import "env" "tick" (func $tick (param i32)))
                    (func (export "run") (param i32) (call $tick (local.get 0))))"#,
            )?,
        )?;

        assert_eq!(
            context.execute_registered("user", "run", &[]),
            Err(ExecError::ArityMismatch {
                expected: 1,
                actual: 0
            })
        );
        assert_eq!(
            context.execute_registered("env", "tick", &[Value::I32(1), Value::I32(2)]),
            Err(ExecError::ArityMismatch {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        context.execute_registered("user", "run", &[Value::I32(1)])?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn validation_toggle() -> Result<()> {
        let wasm = wat::parse_str(
            r#"(module
                (func (export "wide") (result i32) (i64.const 7))
                (func (export "mixed") (result i32) (i32.add (i32.const 1) (i64.const 2))))"#,
        )?;

        let context = HostContext::new(Config::default())?;
        assert_eq!(context.load(&wasm).unwrap_err().kind, LoadErrorKind::TypeMismatch);

        let mut context = HostContext::new(Config::new().enable_validation(false))?;
        context.register_module("loose", &wasm)?;
        assert_eq!(
            context.execute_registered("loose", "wide", &[]),
            Err(ExecError::ResultMismatch {
                expected: vec![ValueType::I32],
                actual: vec![ValueType::I64]
            })
        );
        let err = context.execute_registered("loose", "mixed", &[]).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Trap(ref trap) if matches!(trap.kind, TrapKind::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn exported_memory_access() -> Result<()> {
        let mut context = HostContext::new(Config::new().memory_limit(2))?;
        context.register_module("mem", &wat::parse_file("src/fixtures/memory.wat")?)?;

        context.memory_mut("mem", "memory")?.write(100, &42i32.to_le_bytes())?;
        assert_eq!(
            context.execute_registered("mem", "load", &[Value::I32(100)])?,
            vec![Value::I32(42)]
        );
        assert_eq!(context.memory("mem", "memory")?.read(16, 5)?, b"hello");
        assert_eq!(
            context.execute_registered("mem", "grow", &[Value::I32(2)])?,
            vec![Value::I32(-1)]
        );
        assert_eq!(
            context.func_type("mem", "load")?.to_string(),
            "(i32) -> (i32)"
        );
        Ok(())
    }

    #[test]
    fn interrupt_handle_cancels() -> Result<()> {
        let mut context = HostContext::new(Config::default())?;
        context.register_module("control", &wat::parse_file("src/fixtures/control.wat")?)?;
        context.interrupt_handle().interrupt();
        let err = context.execute_registered("control", "spin", &[]).unwrap_err();
        assert!(matches!(err, ExecError::Trap(ref trap) if trap.kind == TrapKind::Cancelled));
        Ok(())
    }

    #[test]
    fn register_from_file_reports_io_errors() -> Result<()> {
        let mut context = HostContext::new(Config::default())?;
        let err = context
            .register_module_from_file("ghost", "src/fixtures/does_not_exist.wasm")
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        Ok(())
    }
}
