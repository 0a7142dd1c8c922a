//! Typed entry point for calling exported functions by name.

use super::{module::ExternalValue, registry::Registry, value::Value};
use crate::{
    binary::types::{ExternType, FuncType, ValueType},
    error::{ExecError, LookupError},
};
use tracing::{debug, trace};

/// Looks up `module.export`, checks `args` against its signature and runs
/// it. The runtime is not entered when the lookup or the argument check
/// fails.
pub fn execute_registered(
    registry: &mut Registry,
    module: &str,
    export: &str,
    args: &[Value],
) -> Result<Vec<Value>, ExecError> {
    let handle = registry.lookup_export(module, export).map_err(|err| match err {
        LookupError::ModuleNotFound(name) => ExecError::ModuleNotFound(name),
        _ => ExecError::ExportNotFound {
            module: module.to_string(),
            name: export.to_string(),
        },
    })?;

    let (ExternalValue::Func(addr), ExternType::Func(func_type)) = (handle.value, handle.ty) else {
        return Err(ExecError::NotAFunction {
            module: module.to_string(),
            name: export.to_string(),
        });
    };

    check_args(&func_type, args)?;
    trace!(module, export, args = ?args, "dispatch");

    let results = registry.invoke(addr, args).inspect_err(|trap| {
        debug!(module, export, kind = %trap.kind, "execution trapped");
    })?;

    check_results(&func_type, &results)?;
    trace!(module, export, results = ?results, "returned");
    Ok(results)
}

pub fn check_args(func_type: &FuncType, args: &[Value]) -> Result<(), ExecError> {
    if args.len() != func_type.params.len() {
        return Err(ExecError::ArityMismatch {
            expected: func_type.params.len(),
            actual: args.len(),
        });
    }
    for (index, (arg, expected)) in args.iter().zip(&func_type.params).enumerate() {
        if !arg.matches(*expected) {
            return Err(ExecError::ArgTypeMismatch {
                index,
                expected: *expected,
                actual: arg.value_type(),
            });
        }
    }
    Ok(())
}

fn check_results(func_type: &FuncType, results: &[Value]) -> Result<(), ExecError> {
    let actual: Vec<ValueType> = results.iter().map(Value::value_type).collect();
    if actual != func_type.results {
        return Err(ExecError::ResultMismatch {
            expected: func_type.results.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::execute_registered;
    use crate::{
        binary::{module::ModuleDefinition, types::ValueType},
        error::{ExecError, TrapKind},
        execution::{import::HostModule, registry::Registry, value::Value},
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn register(registry: &mut Registry, name: &str, path: &str) -> Result<()> {
        let wasm = wat::parse_file(path)?;
        registry.register(name, Arc::new(ModuleDefinition::new(&wasm)?))?;
        Ok(())
    }

    #[test]
    fn execute_book_app() -> Result<()> {
        let mut registry = Registry::default();
        register(&mut registry, "book", "src/fixtures/book.wat")?;
        register(&mut registry, "app", "src/fixtures/app.wat")?;

        let add = execute_registered(&mut registry, "book", "add", &[Value::I32(40), Value::I32(1)])?;
        let start = execute_registered(&mut registry, "app", "start", &[])?;
        assert_eq!(add, vec![Value::I32(41)]);
        assert_eq!(start, vec![Value::I32(42)]);
        Ok(())
    }

    #[test]
    fn divide_by_zero_leaves_module_usable() -> Result<()> {
        let mut registry = Registry::default();
        register(&mut registry, "book", "src/fixtures/book.wat")?;

        let err = execute_registered(&mut registry, "book", "div", &[Value::I32(1), Value::I32(0)])
            .unwrap_err();
        let ExecError::Trap(trap) = err else {
            panic!("expected a trap, got {err}");
        };
        assert_eq!(trap.kind, TrapKind::DivideByZero);
        assert_eq!(trap.frames[0].module, "book");

        assert_eq!(
            execute_registered(&mut registry, "book", "add", &[Value::I32(2), Value::I32(3)])?,
            vec![Value::I32(5)]
        );
        assert_eq!(
            execute_registered(&mut registry, "book", "div", &[Value::I32(9), Value::I32(3)])?,
            vec![Value::I32(3)]
        );
        Ok(())
    }

    #[test]
    fn lookup_failures() -> Result<()> {
        let mut registry = Registry::default();
        register(&mut registry, "mem", "src/fixtures/memory.wat")?;

        assert_eq!(
            execute_registered(&mut registry, "nope", "f", &[]),
            Err(ExecError::ModuleNotFound("nope".into()))
        );
        assert_eq!(
            execute_registered(&mut registry, "mem", "missing", &[]),
            Err(ExecError::ExportNotFound {
                module: "mem".into(),
                name: "missing".into()
            })
        );
        assert_eq!(
            execute_registered(&mut registry, "mem", "memory", &[]),
            Err(ExecError::NotAFunction {
                module: "mem".into(),
                name: "memory".into()
            })
        );
        assert_eq!(
            execute_registered(&mut registry, "mem", "counter", &[]),
            Err(ExecError::NotAFunction {
                module: "mem".into(),
                name: "counter".into()
            })
        );
        Ok(())
    }

    #[test]
    fn argument_checks_never_invoke() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = Registry::default();
        registry.register_host(&HostModule::new("env").func(
            "count",
            &[ValueType::I32],
            &[ValueType::I32],
            move |_, args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args.to_vec())
            },
        ))?;

        let tests = vec![
            (
                vec![],
                ExecError::ArityMismatch {
                    expected: 1,
                    actual: 0,
                },
            ),
            (
                vec![Value::I32(1), Value::I32(2)],
                ExecError::ArityMismatch {
                    expected: 1,
                    actual: 2,
                },
            ),
            (
                vec![Value::I64(1)],
                ExecError::ArgTypeMismatch {
                    index: 0,
                    expected: ValueType::I32,
                    actual: ValueType::I64,
                },
            ),
        ];
        for (args, want) in tests {
            assert_eq!(execute_registered(&mut registry, "env", "count", &args), Err(want));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            execute_registered(&mut registry, "env", "count", &[Value::I32(7)])?,
            vec![Value::I32(7)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
