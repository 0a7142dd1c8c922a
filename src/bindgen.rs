//! Host side of the `wasmedge-bindgen` calling convention.
//!
//! Each parameter is copied into a buffer obtained from the guest's
//! `allocate` export. The guest function receives a pointer to
//! `(pointer, length)` pairs and their count, and reports typed results
//! through the `wasmedge-bindgen` host module as `(pointer, type code,
//! byte length)` triples.

use crate::{
    binary::types::ValueType::I32,
    context::HostContext,
    error::BindgenError,
    execution::{
        import::{i32_args, Caller, HostModule},
        value::Value,
    },
};
use anyhow::{anyhow, bail, Result};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const MODULE_NAME: &str = "wasmedge-bindgen";

const MEMORY: &str = "memory";

#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    VecI8(Vec<i8>),
    VecU8(Vec<u8>),
    VecI16(Vec<i16>),
    VecU16(Vec<u16>),
    VecI32(Vec<i32>),
    VecU32(Vec<u32>),
    VecI64(Vec<i64>),
    VecU64(Vec<u64>),
    String(String),
}

impl Param {
    /// Little-endian bytes and the element count the guest receives.
    fn encode(&self) -> (Vec<u8>, usize) {
        match self {
            Param::I8(v) => (v.to_le_bytes().to_vec(), 1),
            Param::U8(v) => (vec![*v], 1),
            Param::I16(v) => (v.to_le_bytes().to_vec(), 1),
            Param::U16(v) => (v.to_le_bytes().to_vec(), 1),
            Param::I32(v) => (v.to_le_bytes().to_vec(), 1),
            Param::U32(v) => (v.to_le_bytes().to_vec(), 1),
            Param::I64(v) => (v.to_le_bytes().to_vec(), 1),
            Param::U64(v) => (v.to_le_bytes().to_vec(), 1),
            Param::F32(v) => (v.to_le_bytes().to_vec(), 1),
            Param::F64(v) => (v.to_le_bytes().to_vec(), 1),
            Param::Bool(v) => (vec![u8::from(*v)], 1),
            Param::VecI8(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecU8(v) => (v.clone(), v.len()),
            Param::VecI16(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecU16(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecI32(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecU32(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecI64(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::VecU64(v) => (v.iter().flat_map(|x| x.to_le_bytes()).collect(), v.len()),
            Param::String(v) => (v.as_bytes().to_vec(), v.len()),
        }
    }
}

/// Type codes the guest attaches to each reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum RetType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
    Bool = 11,
    Char = 12,
    U8Array = 21,
    I8Array = 22,
    U16Array = 23,
    I16Array = 24,
    U32Array = 25,
    I32Array = 26,
    U64Array = 27,
    I64Array = 28,
    String = 31,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
    VecU8(Vec<u8>),
    VecI8(Vec<i8>),
    VecU16(Vec<u16>),
    VecI16(Vec<i16>),
    VecU32(Vec<u32>),
    VecI32(Vec<i32>),
    VecU64(Vec<u64>),
    VecI64(Vec<i64>),
    String(String),
}

fn decode(code: u32, bytes: &[u8]) -> Result<ReturnValue> {
    let Some(ret) = RetType::from_u32(code) else {
        bail!("unknown result type code {code}");
    };
    let value = match ret {
        RetType::U8 => ReturnValue::U8(u8::from_le_bytes(fixed(bytes)?)),
        RetType::I8 => ReturnValue::I8(i8::from_le_bytes(fixed(bytes)?)),
        RetType::U16 => ReturnValue::U16(u16::from_le_bytes(fixed(bytes)?)),
        RetType::I16 => ReturnValue::I16(i16::from_le_bytes(fixed(bytes)?)),
        RetType::U32 => ReturnValue::U32(u32::from_le_bytes(fixed(bytes)?)),
        RetType::I32 => ReturnValue::I32(i32::from_le_bytes(fixed(bytes)?)),
        RetType::U64 => ReturnValue::U64(u64::from_le_bytes(fixed(bytes)?)),
        RetType::I64 => ReturnValue::I64(i64::from_le_bytes(fixed(bytes)?)),
        RetType::F32 => ReturnValue::F32(f32::from_le_bytes(fixed(bytes)?)),
        RetType::F64 => ReturnValue::F64(f64::from_le_bytes(fixed(bytes)?)),
        RetType::Bool => {
            let [byte] = fixed(bytes)?;
            ReturnValue::Bool(byte == 1)
        }
        RetType::Char => {
            let scalar = u32::from_le_bytes(fixed(bytes)?);
            let c = char::from_u32(scalar).ok_or_else(|| anyhow!("invalid char {scalar:#x}"))?;
            ReturnValue::Char(c)
        }
        RetType::U8Array => ReturnValue::VecU8(bytes.to_vec()),
        RetType::I8Array => ReturnValue::VecI8(elements(bytes, i8::from_le_bytes)?),
        RetType::U16Array => ReturnValue::VecU16(elements(bytes, u16::from_le_bytes)?),
        RetType::I16Array => ReturnValue::VecI16(elements(bytes, i16::from_le_bytes)?),
        RetType::U32Array => ReturnValue::VecU32(elements(bytes, u32::from_le_bytes)?),
        RetType::I32Array => ReturnValue::VecI32(elements(bytes, i32::from_le_bytes)?),
        RetType::U64Array => ReturnValue::VecU64(elements(bytes, u64::from_le_bytes)?),
        RetType::I64Array => ReturnValue::VecI64(elements(bytes, i64::from_le_bytes)?),
        RetType::String => ReturnValue::String(String::from_utf8(bytes.to_vec())?),
    };
    Ok(value)
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| anyhow!("expected {N} bytes, got {}", bytes.len()))
}

fn elements<T, const N: usize>(bytes: &[u8], from: impl Fn([u8; N]) -> T) -> Result<Vec<T>> {
    if bytes.len() % N != 0 {
        bail!("{} bytes is not a whole number of {N}-byte elements", bytes.len());
    }
    bytes.chunks_exact(N).map(|chunk| fixed(chunk).map(&from)).collect()
}

type Outcome = Arc<Mutex<Option<Result<Vec<ReturnValue>, String>>>>;

/// Calls guest functions compiled against `wasmedge-bindgen`.
///
/// [`Bindgen::host_module`] must be registered with the context before the
/// guest, which imports `return_result` and `return_error` from it.
#[derive(Debug, Clone, Default)]
pub struct Bindgen {
    outcome: Outcome,
}

impl Bindgen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_module(&self) -> HostModule {
        let (results, errors) = (Arc::clone(&self.outcome), Arc::clone(&self.outcome));
        HostModule::new(MODULE_NAME)
            .func("return_result", &[I32, I32], &[], move |caller, args| {
                let [pointer, count] = i32_args(args)?;
                let values = read_results(caller, pointer as u32, count as u32)?;
                report(&results, Ok(values))
            })
            .func("return_error", &[I32, I32], &[], move |caller, args| {
                let [pointer, len] = i32_args(args)?;
                let memory = caller
                    .memory()
                    .ok_or_else(|| anyhow!("caller has no memory"))?;
                let message = memory.read(pointer as u32 as usize, len as u32 as usize)?;
                report(&errors, Err(String::from_utf8_lossy(message).into_owned()))
            })
    }

    /// Runs `module.func` with `params` marshaled into guest memory and
    /// returns what the guest reported. Parameter buffers are handed back
    /// through `deallocate` once the call returns.
    pub fn run_wasm(
        &self,
        context: &mut HostContext,
        module: &str,
        func: &str,
        params: &[Param],
    ) -> Result<Vec<ReturnValue>, BindgenError> {
        self.take();

        let pairs_size = params.len() * 8;
        let pairs = allocate(context, module, pairs_size)?;
        let mut buffers = Vec::with_capacity(params.len() + 1);
        for (pos, param) in params.iter().enumerate() {
            let (bytes, length) = param.encode();
            let pointer = allocate(context, module, bytes.len())?;
            buffers.push((pointer, bytes.len()));

            let memory = context.memory_mut(module, MEMORY)?;
            let entry = pairs as usize + pos * 8;
            memory.write(pointer as usize, &bytes)?;
            memory.write_u32(entry, pointer)?;
            memory.write_u32(entry + 4, length as u32)?;
        }
        buffers.push((pairs, pairs_size));

        debug!(module, func, params = params.len(), "calling bindgen function");
        let args = [Value::I32(pairs as i32), Value::I32(params.len() as i32)];
        context.execute_registered(module, func, &args)?;

        for (pointer, size) in buffers {
            let args = [Value::I32(pointer as i32), Value::I32(size as i32)];
            context.execute_registered(module, "deallocate", &args)?;
        }

        match self.take() {
            Some(Ok(values)) => Ok(values),
            Some(Err(message)) => Err(BindgenError::Guest(message)),
            None => Err(BindgenError::NoResult {
                module: module.to_string(),
                func: func.to_string(),
            }),
        }
    }

    fn take(&self) -> Option<Result<Vec<ReturnValue>, String>> {
        self.outcome.lock().ok()?.take()
    }
}

fn allocate(context: &mut HostContext, module: &str, size: usize) -> Result<u32, BindgenError> {
    let results = context.execute_registered(module, "allocate", &[Value::I32(size as i32)])?;
    if let [Value::I32(pointer)] = results[..] {
        return Ok(pointer as u32);
    }
    Err(BindgenError::BadPointer(results))
}

fn read_results(caller: &Caller<'_>, pointer: u32, count: u32) -> Result<Vec<ReturnValue>> {
    let memory = caller
        .memory()
        .ok_or_else(|| anyhow!("caller has no memory"))?;
    (0..count as usize)
        .map(|i| {
            let entry = pointer as usize + i * 12;
            let data = memory.read_u32(entry)?;
            let code = memory.read_u32(entry + 4)?;
            let len = memory.read_u32(entry + 8)?;
            decode(code, memory.read(data as usize, len as usize)?)
        })
        .collect()
}

fn report(outcome: &Outcome, result: Result<Vec<ReturnValue>, String>) -> Result<Vec<Value>> {
    let mut slot = outcome
        .lock()
        .map_err(|_| anyhow!("bindgen outcome poisoned"))?;
    *slot = Some(result);
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::{decode, Bindgen, Param, ReturnValue};
    use crate::{
        config::Config,
        context::HostContext,
        error::{BindgenError, ExecError, TrapKind},
        execution::value::Value,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn guest() -> Result<(Bindgen, HostContext)> {
        let bindgen = Bindgen::new();
        let mut context = HostContext::new(Config::new().host_module(bindgen.host_module()))?;
        context.register_module("guest", &wat::parse_file("src/fixtures/bindgen.wat")?)?;
        Ok((bindgen, context))
    }

    fn live(context: &mut HostContext) -> Result<Vec<Value>> {
        Ok(context.execute_registered("guest", "live", &[])?)
    }

    #[test]
    fn encode_params() {
        let tests = vec![
            (Param::I8(-1), (vec![0xff], 1)),
            (Param::U16(0x0102), (vec![0x02, 0x01], 1)),
            (Param::Bool(true), (vec![1], 1)),
            (Param::F32(1.0), (vec![0x00, 0x00, 0x80, 0x3f], 1)),
            (Param::VecI16(vec![1, -1]), (vec![0x01, 0x00, 0xff, 0xff], 2)),
            (Param::VecU64(vec![]), (vec![], 0)),
            (Param::String("hé".into()), ("hé".as_bytes().to_vec(), 3)),
        ];
        for (param, want) in tests {
            assert_eq!(param.encode(), want);
        }
    }

    #[test]
    fn decode_results() -> Result<()> {
        assert_eq!(decode(9, &1.5f32.to_le_bytes())?, ReturnValue::F32(1.5));
        assert_eq!(decode(11, &[1])?, ReturnValue::Bool(true));
        assert_eq!(decode(12, &('λ' as u32).to_le_bytes())?, ReturnValue::Char('λ'));
        assert_eq!(
            decode(26, &[1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff])?,
            ReturnValue::VecI32(vec![1, -1])
        );
        assert_eq!(decode(31, b"ok")?, ReturnValue::String("ok".into()));

        assert!(decode(6, &[1, 2]).is_err());
        assert!(decode(24, &[1, 2, 3]).is_err());
        assert!(decode(12, &0xd800u32.to_le_bytes()).is_err());
        assert!(decode(40, &[]).is_err());
        Ok(())
    }

    #[test]
    fn run_wasm_with_scalars() -> Result<()> {
        let (bindgen, mut context) = guest()?;
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "add", &[Param::I32(40), Param::I32(2)])?,
            vec![ReturnValue::I32(42)]
        );
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "divmod", &[Param::I32(17), Param::I32(5)])?,
            vec![ReturnValue::I32(3), ReturnValue::I32(2)]
        );
        assert_eq!(live(&mut context)?, vec![Value::I32(0)]);
        Ok(())
    }

    #[test]
    fn run_wasm_with_buffers() -> Result<()> {
        let (bindgen, mut context) = guest()?;
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "sum", &[Param::VecI32(vec![1, 2, 3, -10])])?,
            vec![ReturnValue::I64(-4)]
        );
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "sum", &[Param::VecI32(vec![])])?,
            vec![ReturnValue::I64(0)]
        );
        assert_eq!(
            bindgen.run_wasm(
                &mut context,
                "guest",
                "echo",
                &[Param::String("héllo".into()), Param::U8(31)]
            )?,
            vec![ReturnValue::String("héllo".into())]
        );
        assert_eq!(
            bindgen.run_wasm(
                &mut context,
                "guest",
                "echo",
                &[Param::VecU8(vec![1, 2, 3]), Param::U8(21)]
            )?,
            vec![ReturnValue::VecU8(vec![1, 2, 3])]
        );
        assert_eq!(live(&mut context)?, vec![Value::I32(0)]);
        Ok(())
    }

    #[test]
    fn guest_errors() -> Result<()> {
        let (bindgen, mut context) = guest()?;
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "divmod", &[Param::I32(7), Param::I32(0)]),
            Err(BindgenError::Guest("division by zero".into()))
        );
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "add", &[Param::I32(1)]),
            Err(BindgenError::Guest("expected two arguments".into()))
        );
        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "silent", &[]),
            Err(BindgenError::NoResult {
                module: "guest".into(),
                func: "silent".into()
            })
        );

        let err = bindgen
            .run_wasm(&mut context, "guest", "echo", &[Param::VecU8(vec![1]), Param::U8(99)])
            .unwrap_err();
        assert!(matches!(
            err,
            BindgenError::Exec(ExecError::Trap(ref trap))
                if matches!(trap.kind, TrapKind::HostCallFailed(_))
        ));

        assert_eq!(
            bindgen.run_wasm(&mut context, "guest", "add", &[Param::I32(2), Param::I32(2)])?,
            vec![ReturnValue::I32(4)]
        );
        Ok(())
    }
}
