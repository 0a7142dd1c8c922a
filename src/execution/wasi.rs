use super::{
    import::{i32_args, Caller, HostModule, ProcExit},
    store::MemoryInst,
    value::Value,
};
use crate::binary::types::ValueType::I32;
use anyhow::{anyhow, Result};
use rand::RngCore;
use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
};

pub const MODULE_NAME: &str = "wasi_snapshot_preview1";

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_IO: i32 = 29;

type Output = Arc<Mutex<dyn Write + Send>>;

/// The subset of `wasi_snapshot_preview1` needed to run command-style
/// modules: console output, arguments, environment, randomness and exit.
#[derive(Clone)]
pub struct WasiSnapshotPreview1 {
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdout: Output,
    stderr: Output,
}

impl Default for WasiSnapshotPreview1 {
    fn default() -> Self {
        Self {
            args: vec![],
            envs: vec![],
            stdout: Arc::new(Mutex::new(io::stdout())),
            stderr: Arc::new(Mutex::new(io::stderr())),
        }
    }
}

impl fmt::Debug for WasiSnapshotPreview1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasiSnapshotPreview1")
            .field("args", &self.args)
            .field("envs", &self.envs)
            .finish_non_exhaustive()
    }
}

impl WasiSnapshotPreview1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stdout = Arc::new(Mutex::new(writer));
        self
    }

    pub fn stderr(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stderr = Arc::new(Mutex::new(writer));
        self
    }

    pub fn into_host_module(self) -> HostModule {
        let args: Arc<Vec<Vec<u8>>> = Arc::new(self.args.iter().map(|arg| c_string(arg)).collect());
        let envs: Arc<Vec<Vec<u8>>> = Arc::new(
            self.envs
                .iter()
                .map(|(key, value)| c_string(&format!("{key}={value}")))
                .collect(),
        );
        let (stdout, stderr) = (self.stdout, self.stderr);
        let (args_sizes, envs_sizes) = (Arc::clone(&args), Arc::clone(&envs));

        HostModule::new(MODULE_NAME)
            .func("fd_write", &[I32, I32, I32, I32], &[I32], move |caller, args| {
                let [fd, iovs, iovs_len, nwritten] = i32_args(args)?;
                let output = match fd {
                    1 => &stdout,
                    2 => &stderr,
                    _ => return errno(ERRNO_BADF),
                };
                fd_write(caller, output, iovs, iovs_len, nwritten)
            })
            .func("proc_exit", &[I32], &[], |_, args| {
                let [code] = i32_args(args)?;
                Err(ProcExit(code).into())
            })
            .func("args_sizes_get", &[I32, I32], &[I32], move |caller, args| {
                let [count, size] = i32_args(args)?;
                sizes_get(caller, &args_sizes, count, size)
            })
            .func("args_get", &[I32, I32], &[I32], move |caller, params| {
                let [ptrs, buf] = i32_args(params)?;
                strings_get(caller, &args, ptrs, buf)
            })
            .func("environ_sizes_get", &[I32, I32], &[I32], move |caller, args| {
                let [count, size] = i32_args(args)?;
                sizes_get(caller, &envs_sizes, count, size)
            })
            .func("environ_get", &[I32, I32], &[I32], move |caller, params| {
                let [ptrs, buf] = i32_args(params)?;
                strings_get(caller, &envs, ptrs, buf)
            })
            .func("random_get", &[I32, I32], &[I32], |caller, args| {
                let [buf, len] = i32_args(args)?;
                let memory = caller_memory(caller)?;
                let range = buf as u32 as usize..buf as u32 as usize + len as u32 as usize;
                match memory.data_mut().get_mut(range) {
                    Some(bytes) => {
                        rand::rng().fill_bytes(bytes);
                        errno(ERRNO_SUCCESS)
                    }
                    None => errno(ERRNO_FAULT),
                }
            })
    }
}

fn fd_write(
    caller: &mut Caller<'_>,
    output: &Output,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> Result<Vec<Value>> {
    let memory = caller_memory(caller)?;
    let mut bytes = vec![];
    for i in 0..iovs_len as u32 as usize {
        let iov = iovs as u32 as usize + i * 8;
        let (Ok(start), Ok(len)) = (memory.read_u32(iov), memory.read_u32(iov + 4)) else {
            return errno(ERRNO_FAULT);
        };
        match memory.read(start as usize, len as usize) {
            Ok(chunk) => bytes.extend_from_slice(chunk),
            Err(_) => return errno(ERRNO_FAULT),
        }
    }

    {
        let mut output = output.lock().map_err(|_| anyhow!("output writer poisoned"))?;
        if output.write_all(&bytes).and_then(|()| output.flush()).is_err() {
            return errno(ERRNO_IO);
        }
    }

    if memory.write_u32(nwritten as u32 as usize, bytes.len() as u32).is_err() {
        return errno(ERRNO_FAULT);
    }
    errno(ERRNO_SUCCESS)
}

fn sizes_get(caller: &mut Caller<'_>, strings: &[Vec<u8>], count: i32, size: i32) -> Result<Vec<Value>> {
    let memory = caller_memory(caller)?;
    let total: usize = strings.iter().map(Vec::len).sum();
    let written = memory
        .write_u32(count as u32 as usize, strings.len() as u32)
        .and_then(|()| memory.write_u32(size as u32 as usize, total as u32));
    match written {
        Ok(()) => errno(ERRNO_SUCCESS),
        Err(_) => errno(ERRNO_FAULT),
    }
}

/// Writes NUL-terminated `strings` back to back at `buf` and their
/// addresses at `ptrs`.
fn strings_get(caller: &mut Caller<'_>, strings: &[Vec<u8>], ptrs: i32, buf: i32) -> Result<Vec<Value>> {
    let memory = caller_memory(caller)?;
    let (mut ptr, mut offset) = (ptrs as u32 as usize, buf as u32 as usize);
    for string in strings {
        if memory.write_u32(ptr, offset as u32).is_err() || memory.write(offset, string).is_err() {
            return errno(ERRNO_FAULT);
        }
        ptr += 4;
        offset += string.len();
    }
    errno(ERRNO_SUCCESS)
}

fn caller_memory<'a>(caller: &'a mut Caller<'_>) -> Result<&'a mut MemoryInst> {
    let module = caller.module_name().unwrap_or("host").to_string();
    caller
        .memory_mut()
        .ok_or_else(|| anyhow!("module `{module}` has no memory"))
}

fn errno(code: i32) -> Result<Vec<Value>> {
    Ok(vec![Value::I32(code)])
}

fn c_string(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}
