//! Runtime and interpreter error types.
//!
//! At the interface there is one runtime error kind; the enum below is the
//! internal classification. A runtime error carries the message plus a
//! stack trace of (line, function) pairs, deepest frame first. No runtime
//! error is recoverable: the VM resets its stack and hands the error up.

use std::fmt;

use ember_compiler::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    TypeMismatch,
    ArityMismatch,
    UndefinedVariable,
    UnknownAttribute,
    NotCallable,
    IndexOutOfRange,
    StackOverflow,
    EmptyContainer,
    KeyMustBeString,
    Native,
}

/// One frame of the error trace.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// Function name, or `"script"` for the top level.
    pub function: String,
}

#[derive(Debug)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n[line {}] in {}", frame.line, frame.function)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// What `interpret` reports: the program failed to compile, or it failed
/// while running.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{e}"),
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<CompileError> for InterpretError {
    fn from(e: CompileError) -> InterpretError {
        InterpretError::Compile(e)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> InterpretError {
        InterpretError::Runtime(e)
    }
}
