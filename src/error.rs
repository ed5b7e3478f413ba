//! Error types for the Quicktrace runtime and JIT

use std::fmt;
use thiserror::Error;

/// Location of an instruction inside a loaded program
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeLocation {
    /// Name of the instruction sequence
    pub iseq: String,
    /// Source line (0 when the sequence carries no line table)
    pub line: u32,
    /// Instruction offset inside the sequence
    pub offset: u32,
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}", self.iseq, self.line)
        } else {
            write!(f, "{}@{}", self.iseq, self.offset)
        }
    }
}

/// Kinds of errors raised by the reference interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// No method for the receiver
    NoMethodError,
    /// Wrong operand type
    TypeError,
    /// Integer division by zero
    ZeroDivisionError,
    /// Wrong number of arguments
    ArgumentError,
    /// Unknown constant or variable
    NameError,
    /// Value out of range
    RangeError,
    /// `yield` without a block, `throw`
    LocalJumpError,
    /// Malformed regular expression
    RegexpError,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeErrorKind::NoMethodError => "NoMethodError",
            RuntimeErrorKind::TypeError => "TypeError",
            RuntimeErrorKind::ZeroDivisionError => "ZeroDivisionError",
            RuntimeErrorKind::ArgumentError => "ArgumentError",
            RuntimeErrorKind::NameError => "NameError",
            RuntimeErrorKind::RangeError => "RangeError",
            RuntimeErrorKind::LocalJumpError => "LocalJumpError",
            RuntimeErrorKind::RegexpError => "RegexpError",
        };
        f.write_str(name)
    }
}

/// Main error type for Quicktrace
#[derive(Error, Debug)]
pub enum Error {
    /// Error raised by the interpreted program
    #[error("{kind}: {message}{}", location.as_ref().map(|l| format!(" at {}", l)).unwrap_or_default())]
    Runtime {
        kind: RuntimeErrorKind,
        message: String,
        location: Option<CodeLocation>,
    },

    /// Malformed instruction sequence or program file
    #[error("BytecodeError: {0}")]
    Bytecode(String),

    /// Assembler syntax error
    #[error("AsmError: {message} at line {line}")]
    Asm { message: String, line: usize },

    /// The backend declined to compile a trace
    #[error("CodegenError: {0}")]
    Codegen(String),

    /// Invalid JIT configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// Internal invariant violated
    #[error("InternalError: {0}")]
    Internal(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Binary program image error
    #[error("ImageError: {source}")]
    Image {
        #[from]
        source: bincode::Error,
    },
}

impl Error {
    /// Create a runtime error of the given kind
    pub fn runtime(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Error::Runtime {
            kind,
            message: message.into(),
            location: None,
        }
    }

    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::TypeError, message)
    }

    /// Create a NoMethodError
    pub fn no_method(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::NoMethodError, message)
    }

    /// Create an ArgumentError
    pub fn argument_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::ArgumentError, message)
    }

    /// Create a ZeroDivisionError
    pub fn zero_division() -> Self {
        Self::runtime(RuntimeErrorKind::ZeroDivisionError, "divided by 0")
    }

    /// Create a NameError
    pub fn name_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeErrorKind::NameError, message)
    }

    /// Create a bytecode error
    pub fn bytecode(message: impl Into<String>) -> Self {
        Error::Bytecode(message.into())
    }

    /// Create an assembler error
    pub fn asm(message: impl Into<String>, line: usize) -> Self {
        Error::Asm {
            message: message.into(),
            line,
        }
    }

    /// Create a codegen error
    pub fn codegen(message: impl Into<String>) -> Self {
        Error::Codegen(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Attach a code location to a runtime error that has none yet
    pub fn with_location(self, at: CodeLocation) -> Self {
        match self {
            Error::Runtime {
                kind,
                message,
                location: None,
            } => Error::Runtime {
                kind,
                message,
                location: Some(at),
            },
            other => other,
        }
    }

    /// Runtime error kind, if this is a runtime error
    pub fn runtime_kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            Error::Runtime { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type for Quicktrace operations
pub type Result<T> = std::result::Result<T, Error>;
