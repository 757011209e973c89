use thiserror::Error;

/// A single accumulated compile-time diagnostic. The compiler collects
/// these in panic mode and keeps parsing past each one to surface as many
/// as possible in one pass.
#[derive(Debug, Clone, Error)]
#[error("[line {line}] {message}")]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError { line, message: message.into() }
    }
}

/// The language-level exception class name raised for an internal VM
/// failure that has no user-constructed `Exception` behind it yet. The VM
/// turns one of these into a real heap `Instance` before unwinding, so
/// user code can `catch` it like any other thrown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Arity,
    Type,
    InvalidOperation,
    InvalidIndex,
    IndexOutOfBounds,
    UndefinedVariable,
    UndefinedProperty,
    InvalidInheritance,
    InvalidImport,
    Io,
    StackOverflow,
}

impl RuntimeErrorKind {
    pub fn class_name(self) -> &'static str {
        use RuntimeErrorKind::*;
        match self {
            Arity => "ArityException",
            Type => "TypeException",
            InvalidOperation => "InvalidOperationException",
            InvalidIndex => "InvalidIndexException",
            IndexOutOfBounds => "IndexOutOfBoundsException",
            UndefinedVariable => "UndefinedVariableException",
            UndefinedProperty => "UndefinedPropertyException",
            InvalidInheritance => "InvalidInheritanceException",
            InvalidImport => "InvalidImportException",
            Io => "IOException",
            StackOverflow => "StackOverflowException",
        }
    }
}

/// Fatal outcomes that terminate the VM outright rather than unwinding to
/// a handler: an uncaught exception, a stack overflow past `FRAMES_MAX`,
/// or allocator exhaustion.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("{name}: {value}\n{stack}")]
    UncaughtException { name: String, value: String, stack: String },
    #[error("stack overflow")]
    StackOverflow,
    #[error("out of memory")]
    OutOfMemory,
}

/// Mirrors the CLI exit-code contract: 0 success, -1 usage, -2 compile
/// error, -3 runtime error, -4 I/O error opening the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    Usage = -1,
    CompileError = -2,
    RuntimeError = -3,
    IoError = -4,
}
