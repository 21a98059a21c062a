//! Heap object variants.
//!
//! Every object lives in a `Heap` cell addressed by a `Handle`; values refer
//! to objects only through handles, so cloning a value never clones an
//! object. The GC dispatches on the `Object` tag to trace interior
//! references (see `Heap::blacken`).

use crate::chunk::Chunk;
use crate::heap::{Handle, Heap};
use crate::table::Table;
use crate::value::Value;

/// Native function: reads its arguments, returns a result value or an error
/// message which the VM turns into a runtime error.
pub type NativeFn = fn(heap: &mut Heap, args: &[Value]) -> Result<Value, String>;

pub enum Object {
    String(StringObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Table(TableObj),
    Array(ArrayObj),
    Native(NativeObj),
}

/// Interned string. `hash` is the FNV-1a of `chars`, cached because every
/// table operation needs it.
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: its bytecode plus the arity and upvalue shape the
/// VM checks at call and closure-creation time.
pub struct FunctionObj {
    pub arity: usize,
    pub upvalue_count: usize,
    /// `None` for the top-level script.
    pub name: Option<Handle>,
    pub chunk: Chunk,
}

/// Runtime pairing of a function with its captured upvalues. Created every
/// time `OP_CLOSURE` executes.
pub struct ClosureObj {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// Either an index into the operand stack (open) or an owned captured value
/// (closed). Reads and writes go through whichever side is active.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct UpvalueObj {
    pub state: UpvalueState,
    /// Next open upvalue; the VM keeps the list sorted by stack index,
    /// descending.
    pub next: Option<Handle>,
}

impl UpvalueObj {
    pub fn stack_index(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(idx) => Some(idx),
            UpvalueState::Closed(_) => None,
        }
    }
}

pub struct ClassObj {
    pub name: Handle,
    /// Method name -> closure.
    pub methods: Table,
}

pub struct InstanceObj {
    pub class: Handle,
    pub fields: Table,
}

/// A method pulled off an instance: remembers the receiver so a later call
/// can reinstall it in slot zero.
pub struct BoundMethodObj {
    pub receiver: Value,
    pub closure: Handle,
}

/// First-class hash literal `{ "k": v, ... }`.
pub struct TableObj {
    pub values: Table,
}

/// First-class array literal `[v, ...]`. The methods map carries the shared
/// `push`/`pop` closures installed at heap init.
pub struct ArrayObj {
    pub values: Vec<Value>,
    pub methods: Table,
}

pub struct NativeObj {
    pub function: NativeFn,
}

impl Object {
    /// Bytes charged against the allocation budget for this object.
    /// Measured once at allocation; interior growth is not re-measured.
    pub fn size_estimate(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match self {
            Object::String(s) => s.chars.len(),
            Object::Function(f) => {
                f.chunk.code_len()
                    + f.chunk.constants_len() * std::mem::size_of::<Value>()
            }
            Object::Closure(c) => c.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Upvalue(_) => 0,
            Object::Class(c) => c.methods.capacity() * entry_size(),
            Object::Instance(i) => i.fields.capacity() * entry_size(),
            Object::BoundMethod(_) => 0,
            Object::Table(t) => t.values.capacity() * entry_size(),
            Object::Array(a) => {
                a.values.len() * std::mem::size_of::<Value>()
                    + a.methods.capacity() * entry_size()
            }
            Object::Native(_) => 0,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) => "function",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "method",
            Object::Table(_) => "table",
            Object::Array(_) => "array",
            Object::Native(_) => "native",
        }
    }
}

fn entry_size() -> usize {
    std::mem::size_of::<(Option<Handle>, u32, Value)>()
}
