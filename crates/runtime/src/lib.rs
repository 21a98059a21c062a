//! Ember virtual machine.
//!
//! `Vm::interpret` compiles a source string and executes the resulting
//! bytecode on an operand stack with a fixed-capacity call-frame stack.
//! All heap state lives in `ember_core::Heap`; this crate owns the stack,
//! the frames, the open-upvalue list and the dispatch loop.

pub mod error;
pub mod natives;
pub mod vm;

pub use error::{InterpretError, RuntimeError, RuntimeErrorKind, TraceFrame};
pub use vm::{Vm, VmOptions};
