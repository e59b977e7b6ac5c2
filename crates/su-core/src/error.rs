//! Crate-wide error types.
//!
//! The original VM reports every error the same way: a formatted message,
//! optionally with source location, delivered by unwinding to the nearest
//! installed checkpoint (`setjmp`/`longjmp`). Here that unwind is ordinary
//! `Result` propagation via `?`; `SuError` is the payload.

use thiserror::Error;

/// Runtime errors raised while executing or embedding the VM.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SuError {
    #[error("{0}")]
    Loader(#[from] LoaderError),

    #[error("type error: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },

    #[error("arity error: expected {expected}, got {got}")]
    Arity { expected: i32, got: usize },

    #[error("attempt to call unknown global variable: {0}")]
    UnknownGlobal(String),

    #[error("redefinition of global variable: {0}")]
    DuplicateGlobal(String),

    #[error("key not found")]
    MissingKey,

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("operand stack overflow")]
    StackOverflow,

    #[error("call nesting too deep")]
    CallDepthExceeded,

    #[error("{0}")]
    User(String),

    /// An error annotated with the raising instruction's source location
    /// (`filename:line`), matching `global_error`'s "filename from the
    /// innermost named frame + line_info[pc]" formatting. Attached by the
    /// interpreter's dispatch loop, not by the individual operations that
    /// first produce the inner error.
    #[error("{location}: {source}")]
    Located {
        location: String,
        #[source]
        source: Box<SuError>,
    },
}

impl SuError {
    pub fn type_error(expected: &'static str, got: &'static str) -> Self {
        SuError::Type { expected, got }
    }
}

/// Errors produced while decoding a compiled program from a byte source.
///
/// Returned as an integer/`Result` status from `load`, never raised through
/// the `SuError` long-jump-equivalent path -- the loader runs before any
/// partial state could become reachable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("bad signature")]
    BadSignature,

    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unsupported flags {0:#06x}")]
    BadFlags(u16),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("bad constant tag {0}")]
    BadConstantTag(u8),

    #[error("bad opcode {0}")]
    BadOpcode(u8),
}

pub type SuResult<T> = Result<T, SuError>;
pub type LoaderResult<T> = Result<T, LoaderError>;
