//! Error taxonomy shared by the loader, the registry and the dispatcher.

use crate::{binary::types::ValueType, execution::value::Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    MalformedHeader,
    UnknownSection,
    InvalidIndex,
    TypeMismatch,
    TruncatedInput,
    /// Framing or encoding problems: LEB128, UTF-8, section sizes, form bytes.
    MalformedEncoding,
    /// Well-formed WebAssembly that uses features this engine does not run.
    Unsupported,
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadErrorKind::MalformedHeader => "malformed header",
            LoadErrorKind::UnknownSection => "unknown section",
            LoadErrorKind::InvalidIndex => "invalid index",
            LoadErrorKind::TypeMismatch => "type mismatch",
            LoadErrorKind::TruncatedInput => "truncated input",
            LoadErrorKind::MalformedEncoding => "malformed encoding",
            LoadErrorKind::Unsupported => "unsupported feature",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}: {message}", .offset.map(|o| format!(" at offset {o:#x}")).unwrap_or_default())]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub offset: Option<usize>,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            offset: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unresolved import: {module}.{field}")]
    UnresolvedImport { module: String, field: String },

    #[error("type mismatch for import {module}.{field}: expected {expected}, found {found}")]
    TypeMismatch {
        module: String,
        field: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstantiationError {
    #[error("memory of {requested} pages exceeds the limit of {limit} pages")]
    MemoryLimitExceeded { requested: u32, limit: u32 },

    #[error("{segment} segment {index} does not fit its target")]
    SegmentOutOfBounds { segment: &'static str, index: usize },

    #[error("constant expression reads unknown global {0}")]
    UnknownGlobal(u32),

    #[error("start function trapped")]
    StartTrapped(#[source] Trap),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegisterError {
    #[error("module `{0}` is already registered")]
    DuplicateName(String),

    #[error("module `{0}` is not registered")]
    NotRegistered(String),

    #[error("host module `{module}` defines `{field}` more than once")]
    DuplicateField { module: String, field: String },

    #[error("module `{name}` is still referenced by {dependents:?}")]
    InUse {
        name: String,
        dependents: Vec<String>,
    },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("module `{0}` is not registered")]
    ModuleNotFound(String),

    #[error("export `{module}.{name}` not found")]
    NotFound { module: String, name: String },

    #[error("export `{module}.{name}` is not a {expected}")]
    KindMismatch {
        module: String,
        name: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("module `{0}` is not registered")]
    ModuleNotFound(String),

    #[error("export `{module}.{name}` not found")]
    ExportNotFound { module: String, name: String },

    #[error("export `{module}.{name}` is not a function")]
    NotAFunction { module: String, name: String },

    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("argument {index}: expected {expected}, got {actual}")]
    ArgTypeMismatch {
        index: usize,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("function returned {actual:?}, declared {expected:?}")]
    ResultMismatch {
        expected: Vec<ValueType>,
        actual: Vec<ValueType>,
    },

    #[error(transparent)]
    Trap(#[from] Trap),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrapKind {
    #[error("integer divide by zero")]
    DivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("out of bounds memory access")]
    OutOfBoundsMemory,
    #[error("undefined element")]
    UndefinedElement,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("unreachable")]
    Unreachable,
    #[error("call stack exhausted")]
    StackExhausted,
    #[error("execution cancelled")]
    Cancelled,
    #[error("host call failed: {0}")]
    HostCallFailed(String),
    #[error("exit with code {0}")]
    Exit(i32),
    /// Only reachable when operand validation is disabled.
    #[error("malformed code: {0}")]
    Malformed(&'static str),
}

/// One active call at the time of a trap, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub module: String,
    pub func_idx: u32,
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!func[{}]", self.module, self.func_idx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trap: {kind}")]
pub struct Trap {
    pub kind: TrapKind,
    pub frames: Vec<FrameInfo>,
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Self {
            kind,
            frames: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindgenError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("guest memory access failed: {0}")]
    Memory(#[from] TrapKind),

    #[error("`allocate` returned {0:?}, expected a single i32")]
    BadPointer(Vec<Value>),

    #[error("guest reported an error: {0}")]
    Guest(String),

    #[error("`{module}.{func}` returned without reporting a result")]
    NoResult { module: String, func: String },
}

/// Umbrella error for the convenience entry points of the host context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read module: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[cfg(test)]
mod tests {
    use super::{LoadError, LoadErrorKind, Trap, TrapKind};

    #[test]
    fn load_error_display() {
        let err = LoadError::new(LoadErrorKind::InvalidIndex, "unknown type 3").at(0x1a);
        assert_eq!(err.to_string(), "invalid index at offset 0x1a: unknown type 3");

        let err = LoadError::new(LoadErrorKind::MalformedHeader, "bad magic");
        assert_eq!(err.to_string(), "malformed header: bad magic");
    }

    #[test]
    fn trap_display() {
        let trap = Trap::from(TrapKind::DivideByZero);
        assert_eq!(trap.to_string(), "trap: integer divide by zero");
    }
}
