//! Host context configuration.
//!
//! Options are fixed when the context is created.

use crate::execution::{import::HostModule, wasi::WasiSnapshotPreview1};

#[derive(Debug, Clone)]
pub struct Config {
    /// Type-check the operand stack of every function body at load time.
    /// Index and structure checks run regardless.
    pub enable_validation: bool,

    /// Cap, in 64 KiB pages, on every memory created by the context.
    pub memory_limit: Option<u32>,

    /// Maximum number of nested wasm calls before `StackExhausted`.
    pub max_call_depth: usize,

    /// Host functions registered as modules when the context is created.
    pub host_modules: Vec<HostModule>,

    pub wasi: Option<WasiSnapshotPreview1>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_validation: true,
            memory_limit: None,
            max_call_depth: 1024,
            host_modules: vec![],
            wasi: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    pub fn memory_limit(mut self, pages: u32) -> Self {
        self.memory_limit = Some(pages);
        self
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn host_module(mut self, module: HostModule) -> Self {
        self.host_modules.push(module);
        self
    }

    pub fn wasi(mut self, wasi: WasiSnapshotPreview1) -> Self {
        self.wasi = Some(wasi);
        self
    }
}
