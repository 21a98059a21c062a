//! Ember core runtime: values, heap objects, garbage collection, bytecode.
//!
//! Key design principles:
//! - `Value`: one 64-bit NaN-boxed word — what the language talks about
//! - `Heap`: arena of heap cells with a mark bit, owner of every object,
//!   the intern table, and the globals table
//! - `Chunk`: a function's compiled body (bytecode + constants + line runs)
//!
//! The compiler and the VM live in their own crates and drive these types;
//! nothing here parses source or dispatches instructions.

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{CallFrame, ExternalRoots, Handle, Heap};
pub use object::{
    ArrayObj, BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeFn, NativeObj,
    Object, StringObj, TableObj, UpvalueObj, UpvalueState,
};
pub use table::Table;
pub use value::Value;
