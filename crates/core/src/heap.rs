//! Object heap and mark-sweep garbage collector.
//!
//! The heap is an arena of cells addressed by `Handle`. Cells are recycled
//! through a free list, so a handle is only valid while its object is
//! reachable — the GC is free to reuse a slot the moment nothing roots it.
//!
//! The heap also owns the two tables every collection must see: the intern
//! set (weak — swept strings are removed) and the globals table (strong).
//! Roots the heap cannot see on its own — the operand stack, the call
//! frames, the open-upvalue list — are handed to `collect` by the caller.
//!
//! Allocation never collects by itself: callers check `should_collect`
//! first, at a point where they can describe their roots. Any object that
//! is reachable only from an in-progress computation must sit on the
//! operand stack or on the temp-root stack across such a point.

use tracing::{debug, trace};

use crate::chunk::{Chunk, OpCode};
use crate::object::{
    ArrayObj, ClosureObj, FunctionObj, Object, StringObj, UpvalueState,
};
use crate::table::{Table, fnv1a};
use crate::value::{Value, format_number};

/// Heap threshold that arms the first collection.
const FIRST_GC_BYTES: usize = 1024 * 1024;

/// Threshold multiplier applied after every collection.
const GC_GROW_FACTOR: usize = 2;

/// Index of an object cell. Opaque outside the core crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    pub(crate) fn new(index: u32) -> Handle {
        Handle(index)
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// One active function invocation. `slots` is the operand-stack base:
/// local `i` lives at `slots + i`, and slot 0 holds the callee (the
/// receiver, for methods).
#[derive(Clone, Copy)]
pub struct CallFrame {
    pub closure: Handle,
    /// The closure's function, cached so the dispatch loop skips one hop.
    pub function: Handle,
    pub ip: usize,
    pub slots: usize,
}

/// Roots that live outside the heap, described by the caller at collection
/// time. Compile-time collections pass `empty()`: the compiler parks its
/// in-flight objects on the temp-root stack instead.
pub struct ExternalRoots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    pub open_upvalues: Option<Handle>,
}

impl ExternalRoots<'_> {
    pub fn empty() -> ExternalRoots<'static> {
        ExternalRoots {
            stack: &[],
            frames: &[],
            open_upvalues: None,
        }
    }
}

struct Cell {
    marked: bool,
    /// Bytes charged at allocation; released verbatim on free.
    size: usize,
    object: Object,
}

enum Slot {
    Live(Cell),
    /// Link in the free list.
    Free(Option<u32>),
}

pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    /// Intern set: every live string exactly once, held weakly.
    strings: Table,
    /// Global variables. Owned here so compile-time collections see them.
    pub globals: Table,
    grey: Vec<Handle>,
    temp_roots: Vec<Value>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation point; for debugging the collector.
    stress: bool,
    /// Interned `"init"`, compared against method names.
    pub init_string: Handle,
    push_string: Handle,
    pop_string: Handle,
    push_method: Handle,
    pop_method: Handle,
}

impl Heap {
    pub fn new(stress: bool) -> Heap {
        let mut heap = Heap {
            slots: Vec::new(),
            free_head: None,
            strings: Table::new(),
            globals: Table::new(),
            grey: Vec::new(),
            temp_roots: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_BYTES,
            stress,
            init_string: Handle(0),
            push_string: Handle(0),
            pop_string: Handle(0),
            push_method: Handle(0),
            pop_method: Handle(0),
        };
        heap.init_string = heap.intern("init");
        heap.push_string = heap.intern("push");
        heap.pop_string = heap.intern("pop");
        heap.push_method = heap.array_method(heap.push_string, 1, OpCode::ArrayPush);
        heap.pop_method = heap.array_method(heap.pop_string, 0, OpCode::ArrayPop);
        heap
    }

    /// Build one of the shared array method closures: a single dedicated
    /// opcode followed by a return.
    fn array_method(&mut self, name: Handle, arity: usize, op: OpCode) -> Handle {
        let mut chunk = Chunk::new();
        chunk.write(op as u8, 0);
        chunk.write(OpCode::Return as u8, 0);
        let function = self.allocate(Object::Function(FunctionObj {
            arity,
            upvalue_count: 0,
            name: Some(name),
            chunk,
        }));
        self.allocate(Object::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }))
    }

    /// A fresh array object with the shared `push`/`pop` methods installed.
    pub fn array_object(&self) -> ArrayObj {
        let mut methods = Table::new();
        let push_hash = self.string(self.push_string).hash;
        let pop_hash = self.string(self.pop_string).hash;
        methods.set(self.push_string, push_hash, Value::object(self.push_method));
        methods.set(self.pop_string, pop_hash, Value::object(self.pop_method));
        ArrayObj {
            values: Vec::new(),
            methods,
        }
    }

    // ----- allocation ------------------------------------------------------

    /// Place an object in a cell and charge its size against the budget.
    /// Does not collect; see `should_collect`.
    pub fn allocate(&mut self, object: Object) -> Handle {
        let size = object.size_estimate();
        self.bytes_allocated += size;
        let cell = Cell {
            marked: false,
            size,
            object,
        };
        match self.free_head {
            Some(idx) => {
                self.free_head = match &self.slots[idx as usize] {
                    Slot::Free(next) => *next,
                    Slot::Live(_) => unreachable!("free list points at a live cell"),
                };
                self.slots[idx as usize] = Slot::Live(cell);
                Handle(idx)
            }
            None => {
                self.slots.push(Slot::Live(cell));
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when the next allocation point should run a collection first.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Intern a string: reuse the existing object when the bytes match,
    /// allocate and register a new one otherwise.
    pub fn intern(&mut self, chars: &str) -> Handle {
        let hash = fnv1a(chars.as_bytes());
        let existing = self
            .strings
            .find_by(hash, |h| &*self.string(h).chars == chars);
        if let Some(h) = existing {
            return h;
        }
        let handle = self.allocate(Object::String(StringObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(handle, hash, Value::NIL);
        handle
    }

    /// Look up an interned string by content without allocating.
    pub fn find_interned(&self, chars: &str) -> Option<Handle> {
        let hash = fnv1a(chars.as_bytes());
        self.strings
            .find_by(hash, |h| &*self.string(h).chars == chars)
    }

    // ----- temp roots ------------------------------------------------------

    /// Pin a value for the duration of an allocating computation.
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    pub fn roots_mark(&self) -> usize {
        self.temp_roots.len()
    }

    pub fn truncate_roots(&mut self, mark: usize) {
        self.temp_roots.truncate(mark);
    }

    // ----- typed access ----------------------------------------------------

    pub fn object(&self, handle: Handle) -> &Object {
        match &self.slots[handle.0 as usize] {
            Slot::Live(cell) => &cell.object,
            Slot::Free(_) => unreachable!("dangling handle {}", handle.0),
        }
    }

    pub fn object_mut(&mut self, handle: Handle) -> &mut Object {
        match &mut self.slots[handle.0 as usize] {
            Slot::Live(cell) => &mut cell.object,
            Slot::Free(_) => unreachable!("dangling handle {}", handle.0),
        }
    }

    pub fn string(&self, handle: Handle) -> &StringObj {
        match self.object(handle) {
            Object::String(s) => s,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn string_hash(&self, handle: Handle) -> u32 {
        self.string(handle).hash
    }

    pub fn function(&self, handle: Handle) -> &FunctionObj {
        match self.object(handle) {
            Object::Function(f) => f,
            other => unreachable!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, handle: Handle) -> &ClosureObj {
        match self.object(handle) {
            Object::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    // ----- collection ------------------------------------------------------

    /// Run a full mark-sweep collection. `roots` describes the caller's
    /// stack, frames and open upvalues; heap-owned roots (globals, temp
    /// roots, the interned `"init"` and the array method closures) are
    /// always included.
    pub fn collect(&mut self, roots: &ExternalRoots<'_>) {
        let before = self.bytes_allocated;
        debug!(bytes = before, "gc begin");

        self.mark_roots(roots);
        self.trace_references();
        self.sweep_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;
        debug!(
            collected = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn mark_roots(&mut self, roots: &ExternalRoots<'_>) {
        for &value in roots.stack {
            self.mark_value(value);
        }
        for frame in roots.frames {
            self.mark_object(frame.closure);
        }
        let mut upvalue = roots.open_upvalues;
        while let Some(h) = upvalue {
            self.mark_object(h);
            upvalue = match self.object(h) {
                Object::Upvalue(u) => u.next,
                other => unreachable!("open-upvalue list holds {}", other.kind_name()),
            };
        }

        for i in 0..self.globals.capacity() {
            if let Some((key, value)) = self.globals.entry_at(i) {
                self.mark_object(key);
                self.mark_value(value);
            }
        }
        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots[i];
            self.mark_value(value);
        }

        self.mark_object(self.init_string);
        self.mark_object(self.push_string);
        self.mark_object(self.pop_string);
        self.mark_object(self.push_method);
        self.mark_object(self.pop_method);
    }

    fn mark_value(&mut self, value: Value) {
        if value.is_object() {
            self.mark_object(value.as_handle());
        }
    }

    fn mark_object(&mut self, handle: Handle) {
        let cell = match &mut self.slots[handle.0 as usize] {
            Slot::Live(cell) => cell,
            Slot::Free(_) => unreachable!("marking a freed cell {}", handle.0),
        };
        if cell.marked {
            return;
        }
        cell.marked = true;
        self.grey.push(handle);
    }

    /// Drain the grey worklist, blackening each object by marking
    /// everything it references.
    fn trace_references(&mut self) {
        while let Some(handle) = self.grey.pop() {
            trace!(handle = handle.0, "blacken");
            let mut children: Vec<Value> = Vec::new();
            match self.object(handle) {
                Object::String(_) | Object::Native(_) => {}
                Object::Function(f) => {
                    if let Some(name) = f.name {
                        children.push(Value::object(name));
                    }
                    children.extend(f.chunk.all_constants());
                }
                Object::Closure(c) => {
                    children.push(Value::object(c.function));
                    children.extend(c.upvalues.iter().map(|&u| Value::object(u)));
                }
                Object::Upvalue(u) => {
                    if let UpvalueState::Closed(v) = u.state {
                        children.push(v);
                    }
                }
                Object::Class(c) => {
                    children.push(Value::object(c.name));
                    collect_table(&c.methods, &mut children);
                }
                Object::Instance(i) => {
                    children.push(Value::object(i.class));
                    collect_table(&i.fields, &mut children);
                }
                Object::BoundMethod(b) => {
                    children.push(b.receiver);
                    children.push(Value::object(b.closure));
                }
                Object::Table(t) => {
                    collect_table(&t.values, &mut children);
                }
                Object::Array(a) => {
                    children.extend(a.values.iter().copied());
                    collect_table(&a.methods, &mut children);
                }
            }
            for child in children {
                self.mark_value(child);
            }
        }
    }

    /// Remove unmarked strings from the intern set. Runs before the object
    /// sweep because it still dereferences the doomed strings' hashes.
    fn sweep_strings(&mut self) {
        let mut doomed: Vec<(Handle, u32)> = Vec::new();
        for i in 0..self.strings.capacity() {
            if let Some((key, _)) = self.strings.entry_at(i) {
                if !self.is_marked(key) {
                    doomed.push((key, self.string(key).hash));
                }
            }
        }
        for (key, hash) in doomed {
            trace!(string = &*self.string(key).chars, "intern sweep");
            self.strings.delete(key, hash);
        }
    }

    fn is_marked(&self, handle: Handle) -> bool {
        match &self.slots[handle.0 as usize] {
            Slot::Live(cell) => cell.marked,
            Slot::Free(_) => unreachable!("mark query on freed cell {}", handle.0),
        }
    }

    /// Free every unmarked cell and clear the mark bit on survivors.
    fn sweep(&mut self) {
        for idx in 0..self.slots.len() {
            let (marked, size) = match &self.slots[idx] {
                Slot::Live(cell) => (cell.marked, cell.size),
                Slot::Free(_) => continue,
            };
            if marked {
                if let Slot::Live(cell) = &mut self.slots[idx] {
                    cell.marked = false;
                }
            } else {
                trace!(handle = idx, "free");
                self.bytes_allocated -= size;
                self.slots[idx] = Slot::Free(self.free_head);
                self.free_head = Some(idx as u32);
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Live objects, counted by walking the arena. For tests and metrics.
    pub fn live_objects(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    // ----- display ---------------------------------------------------------

    /// Render a value the way `print` shows it. Strings are raw at top
    /// level and quoted inside aggregates.
    pub fn show_value(&self, value: Value) -> String {
        self.format_value(value, false)
    }

    fn format_value(&self, value: Value, nested: bool) -> String {
        if value.is_number() {
            return format_number(value.as_number());
        }
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_bool() {
            return if value.as_bool() { "true" } else { "false" }.to_string();
        }
        match self.object(value.as_handle()) {
            Object::String(s) => {
                if nested {
                    format!("\"{}\"", s.chars)
                } else {
                    s.chars.to_string()
                }
            }
            Object::Function(f) => self.format_function(f.name),
            Object::Closure(c) => self.format_function(self.function(c.function).name),
            Object::Upvalue(u) => match u.state {
                UpvalueState::Closed(v) => self.format_value(v, nested),
                UpvalueState::Open(idx) => format!("<upvalue @{idx}>"),
            },
            Object::Class(c) => format!("<class {}>", self.string(c.name).chars),
            Object::Instance(i) => self.format_map(&i.fields),
            Object::BoundMethod(b) => {
                self.format_function(self.function(self.closure(b.closure).function).name)
            }
            Object::Table(t) => self.format_map(&t.values),
            Object::Array(a) => {
                let items: Vec<String> = a
                    .values
                    .iter()
                    .map(|&v| self.format_value(v, true))
                    .collect();
                format!("[{}]", items.join(","))
            }
            Object::Native(_) => "<native fn>".to_string(),
        }
    }

    fn format_function(&self, name: Option<Handle>) -> String {
        match name {
            Some(n) => format!("<fn {}>", self.string(n).chars),
            None => "<script>".to_string(),
        }
    }

    fn format_map(&self, table: &Table) -> String {
        let mut items: Vec<String> = Vec::new();
        for i in 0..table.capacity() {
            if let Some((key, value)) = table.entry_at(i) {
                items.push(format!(
                    "\"{}\": {}",
                    self.string(key).chars,
                    self.format_value(value, true)
                ));
            }
        }
        format!("{{{}}}", items.join(", "))
    }
}

fn collect_table(table: &Table, out: &mut Vec<Value>) {
    for i in 0..table.capacity() {
        if let Some((key, value)) = table.entry_at(i) {
            out.push(Value::object(key));
            out.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let mut heap = Heap::new(false);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*heap.string(a).chars, "hello");
    }

    #[test]
    fn test_value_equality_via_interning() {
        let mut heap = Heap::new(false);
        let a = Value::object(heap.intern("abc"));
        let b = Value::object(heap.intern("abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_collect_frees_unrooted() {
        let mut heap = Heap::new(false);
        let baseline = heap.live_objects();
        heap.allocate(Object::Table(crate::object::TableObj {
            values: Table::new(),
        }));
        assert_eq!(heap.live_objects(), baseline + 1);
        heap.collect(&ExternalRoots::empty());
        assert_eq!(heap.live_objects(), baseline);
    }

    #[test]
    fn test_collect_keeps_temp_roots() {
        let mut heap = Heap::new(false);
        let h = heap.allocate(Object::Table(crate::object::TableObj {
            values: Table::new(),
        }));
        heap.push_root(Value::object(h));
        let baseline = heap.live_objects();
        heap.collect(&ExternalRoots::empty());
        assert_eq!(heap.live_objects(), baseline);
        heap.pop_root();
        heap.collect(&ExternalRoots::empty());
        assert_eq!(heap.live_objects(), baseline - 1);
    }

    #[test]
    fn test_collect_keeps_stack_roots() {
        let mut heap = Heap::new(false);
        let h = heap.intern("transient");
        let stack = [Value::object(h)];
        heap.collect(&ExternalRoots {
            stack: &stack,
            frames: &[],
            open_upvalues: None,
        });
        assert_eq!(heap.find_interned("transient"), Some(h));
    }

    #[test]
    fn test_sweep_removes_interned_string() {
        let mut heap = Heap::new(false);
        let h = heap.intern("doomed");
        assert_eq!(heap.find_interned("doomed"), Some(h));
        heap.collect(&ExternalRoots::empty());
        assert_eq!(heap.find_interned("doomed"), None);
        // Re-interning after the sweep builds a fresh object.
        let again = heap.intern("doomed");
        assert_eq!(heap.find_interned("doomed"), Some(again));
    }

    #[test]
    fn test_globals_are_rooted() {
        let mut heap = Heap::new(false);
        let name = heap.intern("answer");
        let hash = heap.string_hash(name);
        heap.globals.set(name, hash, Value::number(42.0));
        heap.collect(&ExternalRoots::empty());
        assert_eq!(heap.find_interned("answer"), Some(name));
        assert_eq!(heap.globals.get(name, hash), Some(Value::number(42.0)));
    }

    #[test]
    fn test_slot_reuse_after_free() {
        let mut heap = Heap::new(false);
        let doomed = heap.allocate(Object::Table(crate::object::TableObj {
            values: Table::new(),
        }));
        heap.collect(&ExternalRoots::empty());
        let replacement = heap.allocate(Object::Table(crate::object::TableObj {
            values: Table::new(),
        }));
        assert_eq!(doomed, replacement, "freed slot should be recycled first");
    }

    #[test]
    fn test_array_object_has_methods() {
        let heap = Heap::new(false);
        let array = heap.array_object();
        let push = heap.find_interned("push").unwrap();
        let hash = heap.string_hash(push);
        assert!(array.methods.get(push, hash).is_some());
    }
}
