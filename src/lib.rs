pub mod bindgen;
pub mod binary;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod logging;

pub use binary::{
    module::ModuleDefinition,
    types::{ExternType, FuncType, ValueType},
};
pub use bindgen::{Bindgen, Param, ReturnValue};
pub use config::Config;
pub use context::HostContext;
pub use error::{
    BindgenError, Error, ExecError, InstantiationError, LinkError, LoadError, LoadErrorKind, LookupError,
    RegisterError, Trap, TrapKind,
};
pub use execution::{
    import::{Caller, HostFunc, HostModule, ProcExit},
    module::{ExportHandle, ExternalValue},
    runtime::InterruptHandle,
    value::Value,
    wasi::WasiSnapshotPreview1,
};
