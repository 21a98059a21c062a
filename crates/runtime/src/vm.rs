//! The dispatch loop and everything it leans on.
//!
//! One `Vm` owns the heap, the operand stack, the call-frame stack and the
//! open-upvalue list. The loop keeps a local copy of the top frame and
//! writes its `ip` back whenever a call, an error or a collection needs
//! the frame stack to be authoritative.
//!
//! GC discipline mirrors the allocator contract in `ember_core::heap`:
//! every allocation goes through `alloc`/`intern`, which collect first
//! with the full root set; transient objects are kept reachable from the
//! operand stack or the temp-root stack across those points.

use std::io::{self, Write};

use ember_compiler::compile;
use ember_core::debug::disassemble_instruction;
use ember_core::object::{BoundMethodObj, ClassObj, ClosureObj, InstanceObj, TableObj};
use ember_core::{
    CallFrame, ExternalRoots, Handle, Heap, Object, OpCode, Table, UpvalueObj, UpvalueState, Value,
};
use tracing::trace;

use crate::error::{InterpretError, RuntimeError, RuntimeErrorKind, TraceFrame};
use crate::natives;

/// Maximum call depth.
pub const FRAME_MAX: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Log every instruction and the stack beneath it at `trace!` level.
    pub trace_execution: bool,
    /// Collect on every allocation point.
    pub stress_gc: bool,
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by stack index descending.
    open_upvalues: Option<Handle>,
    options: VmOptions,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Vm {
        Vm::with_output(options, Box::new(io::stdout()))
    }

    /// A VM whose `print` output goes to the given sink. Tests use this to
    /// capture program output.
    pub fn with_output(options: VmOptions, out: Box<dyn Write>) -> Vm {
        let mut vm = Vm {
            heap: Heap::new(options.stress_gc),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: None,
            options,
            out,
        };
        natives::install(&mut vm);
        vm
    }

    /// Compile and run a source string.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        self.run_source(source, false)
    }

    /// REPL variant: expression statements print their value.
    pub fn interpret_repl(&mut self, source: &str) -> Result<(), InterpretError> {
        self.run_source(source, true)
    }

    fn run_source(&mut self, source: &str, repl: bool) -> Result<(), InterpretError> {
        let function = compile(&mut self.heap, source, repl)?;

        self.heap.push_root(Value::object(function));
        let closure = self.alloc(Object::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.pop_root();

        self.push(Value::object(closure));
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: 0,
        });

        self.run().map_err(InterpretError::from)
    }

    /// Register a native under a global name.
    pub fn define_native(&mut self, name: &str, function: ember_core::NativeFn) {
        let name_handle = self.intern(name);
        self.heap.push_root(Value::object(name_handle));
        let native = self.alloc(Object::Native(ember_core::NativeObj { function }));
        let hash = self.heap.string_hash(name_handle);
        self.heap.globals.set(name_handle, hash, Value::object(native));
        self.heap.pop_root();
    }

    // ----- stack -----------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("operand stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ----- allocation chokepoints ------------------------------------------

    fn collect_garbage(&mut self) {
        self.heap.collect(&ExternalRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        });
    }

    fn alloc(&mut self, object: Object) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(object)
    }

    fn intern(&mut self, chars: &str) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    // ----- errors ----------------------------------------------------------

    /// Build a runtime error with a stack trace (deepest frame first), then
    /// reset the machine. The frame stack must hold current `ip`s.
    fn build_error(&mut self, kind: RuntimeErrorKind, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(n) => self.heap.string(n).chars.to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame {
                line,
                function: name,
            });
        }
        self.reset_stack();
        RuntimeError {
            kind,
            message,
            trace,
        }
    }

    fn fail(
        &mut self,
        frame: &CallFrame,
        kind: RuntimeErrorKind,
        message: impl Into<String>,
    ) -> RuntimeError {
        self.sync_frame(frame);
        self.build_error(kind, message.into())
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ----- frames ----------------------------------------------------------

    fn sync_frame(&mut self, frame: &CallFrame) {
        let i = self.frames.len() - 1;
        self.frames[i] = *frame;
    }

    fn current_frame(&self) -> CallFrame {
        self.frames[self.frames.len() - 1]
    }

    // ----- bytecode reads --------------------------------------------------

    fn read_byte(&self, frame: &mut CallFrame) -> u8 {
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&self, frame: &mut CallFrame) -> u16 {
        let hi = self.read_byte(frame);
        let lo = self.read_byte(frame);
        (u16::from(hi) << 8) | u16::from(lo)
    }

    fn read_u32(&self, frame: &mut CallFrame) -> u32 {
        let mut value = 0u32;
        for _ in 0..4 {
            value = (value << 8) | u32::from(self.read_byte(frame));
        }
        value
    }

    fn read_long_constant(&self, frame: &mut CallFrame) -> Value {
        let idx = self.read_u32(frame);
        self.heap.function(frame.function).chunk.long_constant(idx)
    }

    fn read_string(&self, frame: &mut CallFrame) -> Handle {
        self.read_long_constant(frame).as_handle()
    }

    // ----- dispatch --------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        let mut frame = self.current_frame();

        loop {
            if self.options.trace_execution {
                self.trace_instruction(&frame);
            }

            let byte = self.read_byte(&mut frame);
            self.sync_frame(&frame);
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(b) => unreachable!("invalid opcode {b:#04x}"),
            };

            match op {
                OpCode::Return => {
                    let result = self.pop();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure is still in slot 0.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                    frame = self.current_frame();
                }

                OpCode::Constant => {
                    let idx = self.read_byte(&mut frame);
                    let value = self.heap.function(frame.function).chunk.constant(idx);
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_long_constant(&mut frame);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),

                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::TypeMismatch,
                            "operand must be number",
                        ));
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(-n));
                }
                OpCode::Bang => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsy()));
                }

                OpCode::Add => {
                    if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else if self.concatenable(self.peek(0)) && self.concatenable(self.peek(1)) {
                        self.concatenate();
                    } else {
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::TypeMismatch,
                            "operands must be numbers or strings",
                        ));
                    }
                }
                OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Greater
                | OpCode::Less => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::TypeMismatch,
                            "operand must be number",
                        ));
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    let result = match op {
                        OpCode::Subtract => Value::number(a - b),
                        OpCode::Multiply => Value::number(a * b),
                        OpCode::Divide => Value::number(a / b),
                        OpCode::Greater => Value::boolean(a > b),
                        OpCode::Less => Value::boolean(a < b),
                        _ => unreachable!("non-binary opcode in binary arm"),
                    };
                    self.push(result);
                }
                OpCode::EqualEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a == b));
                }
                OpCode::Ternary => {
                    let else_value = self.pop();
                    let then_value = self.pop();
                    let condition = self.pop();
                    self.push(if condition.is_falsy() {
                        else_value
                    } else {
                        then_value
                    });
                }

                OpCode::Len => {
                    let value = self.pop();
                    match self.len_of(value) {
                        Ok(result) => self.push(result),
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.show_value(value);
                    let _ = writeln!(self.out, "{text}");
                }
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GlobalVar => {
                    let name = self.read_string(&mut frame);
                    let hash = self.heap.string_hash(name);
                    let value = self.pop();
                    self.heap.globals.set(name, hash, value);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string(&mut frame);
                    let hash = self.heap.string_hash(name);
                    match self.heap.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!(
                                "undefined variable '{}'",
                                self.heap.string(name).chars
                            );
                            return Err(self.fail(
                                &frame,
                                RuntimeErrorKind::UndefinedVariable,
                                message,
                            ));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string(&mut frame);
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.heap.globals.set(name, hash, value) {
                        self.heap.globals.delete(name, hash);
                        let message = format!(
                            "cannot assign to undefined variable '{}'",
                            self.heap.string(name).chars
                        );
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::UndefinedVariable,
                            message,
                        ));
                    }
                }
                OpCode::GetLocal => {
                    let idx = self.read_u32(&mut frame) as usize;
                    self.push(self.stack[frame.slots + idx]);
                }
                OpCode::SetLocal => {
                    let idx = self.read_u32(&mut frame) as usize;
                    self.stack[frame.slots + idx] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_u32(&mut frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[idx];
                    let value = match self.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_u32(&mut frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[idx];
                    let value = self.peek(0);
                    match self.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                OpCode::Jump => {
                    let jump = self.read_u16(&mut frame);
                    frame.ip += jump as usize;
                }
                OpCode::JumpIfFalse => {
                    let jump = self.read_u16(&mut frame);
                    if self.peek(0).is_falsy() {
                        frame.ip += jump as usize;
                    }
                }
                OpCode::JumpIfTrue => {
                    let jump = self.read_u16(&mut frame);
                    if !self.peek(0).is_falsy() {
                        frame.ip += jump as usize;
                    }
                }
                OpCode::Loop => {
                    let jump = self.read_u16(&mut frame);
                    frame.ip -= jump as usize;
                }
                OpCode::MarkJump => {
                    frame.ip += 2;
                }

                OpCode::Switch => self.push(Value::FALSE),
                OpCode::CaseCompare => {
                    let case_value = self.pop();
                    let switch_value = self.peek(1);
                    let top = self.stack.len() - 1;
                    self.stack[top] = Value::boolean(switch_value == case_value);
                }
                OpCode::SwitchJump => {
                    let slot = self.read_byte(&mut frame) as usize;
                    let dist = i64::from(self.read_byte(&mut frame));
                    let code = &self.heap.function(frame.function).chunk.code;
                    let jump =
                        i64::from((u16::from(code[slot]) << 8) | u16::from(code[slot + 1]));
                    frame.ip = (frame.ip as i64 + jump - dist) as usize;
                }

                OpCode::Call => {
                    let argc = self.read_byte(&mut frame) as usize;
                    let callee = self.peek(argc);
                    self.sync_frame(&frame);
                    self.call_value(callee, argc)?;
                    frame = self.current_frame();
                }
                OpCode::Invoke => {
                    let argc = self.read_byte(&mut frame) as usize;
                    let name = self.read_string(&mut frame);
                    self.sync_frame(&frame);
                    self.invoke(name, argc)?;
                    frame = self.current_frame();
                }

                OpCode::Closure => {
                    let function_value = self.read_long_constant(&mut frame);
                    let function = function_value.as_handle();
                    let count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Object::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(count),
                    }));
                    // Rooted before upvalue capture can allocate.
                    self.push(Value::object(closure));
                    for _ in 0..count {
                        let is_local = self.read_byte(&mut frame) != 0;
                        let index = self.read_u32(&mut frame) as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(frame.slots + index)
                        } else {
                            self.heap.closure(frame.closure).upvalues[index]
                        };
                        match self.heap.object_mut(closure) {
                            Object::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure handle lost its type"),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Class => {
                    let name = self.read_string(&mut frame);
                    let class = self.alloc(Object::Class(ClassObj {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::object(class));
                }
                OpCode::Method => {
                    let name = self.read_string(&mut frame);
                    let hash = self.heap.string_hash(name);
                    let method = self.peek(0);
                    let class_value = self.peek(1);
                    match self.heap.object_mut(class_value.as_handle()) {
                        Object::Class(class) => {
                            class.methods.set(name, hash, method);
                        }
                        _ => unreachable!("OP_METHOD without a class beneath the closure"),
                    }
                    self.pop();
                }

                OpCode::DotGet => {
                    let key = self.read_long_constant(&mut frame);
                    let container = self.peek(0);
                    match self.get_field(container, key) {
                        Ok(value) => {
                            self.pop();
                            self.push(value);
                        }
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }
                OpCode::DotSet => {
                    let key = self.read_long_constant(&mut frame);
                    let value = self.peek(0);
                    let container = self.peek(1);
                    match self.set_field(container, key, value) {
                        Ok(()) => {
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }
                OpCode::SqrBracketGet => {
                    let key = self.peek(0);
                    let container = self.peek(1);
                    match self.get_field(container, key) {
                        Ok(value) => {
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }
                OpCode::SqrBracketSet => {
                    let value = self.peek(0);
                    let key = self.peek(1);
                    let container = self.peek(2);
                    match self.set_field(container, key, value) {
                        Ok(()) => {
                            self.pop();
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }
                OpCode::Del => {
                    let key = self.pop();
                    let container = self.pop();
                    match self.del_field(container, key) {
                        Ok(()) => {}
                        Err((kind, message)) => return Err(self.fail(&frame, kind, message)),
                    }
                }

                OpCode::Table => {
                    let table = self.alloc(Object::Table(TableObj {
                        values: Table::new(),
                    }));
                    self.push(Value::object(table));
                }
                OpCode::TableItems => {
                    let count = self.read_u32(&mut frame) as usize;
                    for i in 0..count {
                        let key = self.peek(1);
                        let value = self.peek(0);
                        let table_value = self.peek(count * 2 - i * 2);
                        let key_handle = key.as_handle();
                        let hash = self.heap.string_hash(key_handle);
                        match self.heap.object_mut(table_value.as_handle()) {
                            Object::Table(table) => {
                                table.values.set(key_handle, hash, value);
                            }
                            _ => unreachable!("OP_TABLE_ITEMS without a table on the stack"),
                        }
                        self.pop();
                        self.pop();
                    }
                }
                OpCode::Array => {
                    let object = self.heap.array_object();
                    let array = self.alloc(Object::Array(object));
                    self.push(Value::object(array));
                }
                OpCode::ArrayItems => {
                    let count = self.read_u32(&mut frame) as usize;
                    let array_value = self.peek(count);
                    for i in 0..count {
                        let value = self.peek(count - 1 - i);
                        match self.heap.object_mut(array_value.as_handle()) {
                            Object::Array(array) => array.values.push(value),
                            _ => unreachable!("OP_ARRAY_ITEMS without an array on the stack"),
                        }
                    }
                    let new_len = self.stack.len() - count;
                    self.stack.truncate(new_len);
                }
                OpCode::ArrayPush => {
                    let value = self.peek(0);
                    let target = self.peek(1);
                    if !self.is_array(target) {
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::TypeMismatch,
                            "can only push onto arrays",
                        ));
                    }
                    match self.heap.object_mut(target.as_handle()) {
                        Object::Array(array) => array.values.push(value),
                        _ => unreachable!("checked array target changed type"),
                    }
                }
                OpCode::ArrayPop => {
                    let target = self.peek(0);
                    if !self.is_array(target) {
                        return Err(self.fail(
                            &frame,
                            RuntimeErrorKind::TypeMismatch,
                            "can only pop from arrays",
                        ));
                    }
                    let popped = match self.heap.object_mut(target.as_handle()) {
                        Object::Array(array) => array.values.pop(),
                        _ => unreachable!("checked array target changed type"),
                    };
                    match popped {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.fail(
                                &frame,
                                RuntimeErrorKind::EmptyContainer,
                                "cannot pop from an empty array",
                            ));
                        }
                    }
                }
            }
        }
    }

    fn trace_instruction(&self, frame: &CallFrame) {
        let chunk = &self.heap.function(frame.function).chunk;
        let (text, _) = disassemble_instruction(&self.heap, chunk, frame.ip);
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|&v| self.heap.show_value(v))
            .collect();
        trace!(stack = %format!("[{}]", stack.join(",")), "{text}");
    }

    // ----- values ----------------------------------------------------------

    fn concatenable(&self, value: Value) -> bool {
        value.is_number() || self.is_string(value)
    }

    fn is_string(&self, value: Value) -> bool {
        value.is_object() && matches!(self.heap.object(value.as_handle()), Object::String(_))
    }

    fn is_array(&self, value: Value) -> bool {
        value.is_object() && matches!(self.heap.object(value.as_handle()), Object::Array(_))
    }

    fn upvalue(&self, handle: Handle) -> &UpvalueObj {
        match self.heap.object(handle) {
            Object::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    fn upvalue_mut(&mut self, handle: Handle) -> &mut UpvalueObj {
        match self.heap.object_mut(handle) {
            Object::Upvalue(u) => u,
            _ => unreachable!("expected upvalue"),
        }
    }

    /// Stringify-and-join the two operands on top of the stack. Both are
    /// known to be strings or numbers; they stay on the stack (and the
    /// intermediate strings on the temp-root stack) until the result
    /// exists, so a collection in the middle cannot reclaim them.
    fn concatenate(&mut self) {
        let b = self.stringify(self.peek(0));
        self.heap.push_root(Value::object(b));
        let a = self.stringify(self.peek(1));
        self.heap.push_root(Value::object(a));

        let combined = format!(
            "{}{}",
            self.heap.string(a).chars,
            self.heap.string(b).chars
        );
        let result = self.intern(&combined);

        self.heap.pop_root();
        self.heap.pop_root();
        self.pop();
        self.pop();
        self.push(Value::object(result));
    }

    fn stringify(&mut self, value: Value) -> Handle {
        if value.is_number() {
            let text = ember_core::value::format_number(value.as_number());
            return self.intern(&text);
        }
        if value.is_nil() {
            return self.intern("nil");
        }
        if value.is_bool() {
            return self.intern(if value.as_bool() { "true" } else { "false" });
        }
        match self.heap.object(value.as_handle()) {
            Object::String(_) => value.as_handle(),
            other => unreachable!("cannot stringify {}", other.kind_name()),
        }
    }

    fn len_of(&self, value: Value) -> Result<Value, (RuntimeErrorKind, String)> {
        if value.is_object() {
            match self.heap.object(value.as_handle()) {
                Object::String(s) => return Ok(Value::number(s.chars.len() as f64)),
                Object::Table(t) => return Ok(Value::number(t.values.len() as f64)),
                Object::Array(a) => return Ok(Value::number(a.values.len() as f64)),
                _ => {}
            }
        }
        Err((
            RuntimeErrorKind::TypeMismatch,
            "invalid operand to len".to_string(),
        ))
    }

    /// The handle of a string value, or `None` for anything else.
    fn key_string(&self, key: Value) -> Option<Handle> {
        if self.is_string(key) {
            Some(key.as_handle())
        } else {
            None
        }
    }

    /// Normalize an array index: negative values count from the end.
    fn array_index(
        &self,
        len: usize,
        key: Value,
    ) -> Result<usize, (RuntimeErrorKind, String)> {
        if !key.is_number() {
            return Err((
                RuntimeErrorKind::TypeMismatch,
                "array index must be a number".to_string(),
            ));
        }
        let raw = key.as_number() as i64;
        let idx = if raw < 0 { raw + len as i64 } else { raw };
        if idx < 0 || idx >= len as i64 {
            return Err((
                RuntimeErrorKind::IndexOutOfRange,
                format!("index {raw} out of range"),
            ));
        }
        Ok(idx as usize)
    }

    // ----- fields and subscripts -------------------------------------------

    fn get_field(
        &mut self,
        container: Value,
        key: Value,
    ) -> Result<Value, (RuntimeErrorKind, String)> {
        if !container.is_object() {
            return Err((
                RuntimeErrorKind::TypeMismatch,
                "only instances and tables have attributes".to_string(),
            ));
        }
        let handle = container.as_handle();

        if let Object::Instance(instance) = self.heap.object(handle) {
            let class = instance.class;
            let key_handle = match self.key_string(key) {
                Some(k) => k,
                None => {
                    return Err((
                        RuntimeErrorKind::KeyMustBeString,
                        "key must be a string".to_string(),
                    ));
                }
            };
            let hash = self.heap.string_hash(key_handle);
            if let Some(value) = self.instance_fields(handle).get(key_handle, hash) {
                return Ok(value);
            }
            let method = self.class_methods(class).get(key_handle, hash);
            let method = match method {
                Some(m) => m,
                None => {
                    return Err((
                        RuntimeErrorKind::UnknownAttribute,
                        format!(
                            "object has no attribute '{}'",
                            self.heap.string(key_handle).chars
                        ),
                    ));
                }
            };
            // Receiver is still rooted by the caller (it sits on the stack).
            let bound = self.alloc(Object::BoundMethod(BoundMethodObj {
                receiver: container,
                closure: method.as_handle(),
            }));
            return Ok(Value::object(bound));
        }

        if let Object::Table(table) = self.heap.object(handle) {
            let key_handle = match self.key_string(key) {
                Some(k) => k,
                None => {
                    return Err((
                        RuntimeErrorKind::KeyMustBeString,
                        "key must be a string".to_string(),
                    ));
                }
            };
            let hash = self.heap.string_hash(key_handle);
            return match table.values.get(key_handle, hash) {
                Some(value) => Ok(value),
                None => Err((
                    RuntimeErrorKind::UnknownAttribute,
                    format!(
                        "table has no attribute '{}'",
                        self.heap.string(key_handle).chars
                    ),
                )),
            };
        }

        if let Object::Array(array) = self.heap.object(handle) {
            if let Some(key_handle) = self.key_string(key) {
                let chars = &self.heap.string(key_handle).chars;
                if &**chars == "push" || &**chars == "pop" {
                    let hash = self.heap.string_hash(key_handle);
                    return match array.methods.get(key_handle, hash) {
                        Some(method) => Ok(method),
                        None => unreachable!("array methods map lost '{}'", chars),
                    };
                }
                return Err((
                    RuntimeErrorKind::UnknownAttribute,
                    format!("array has no attribute '{}'", chars),
                ));
            }
            let idx = self.array_index(array.values.len(), key)?;
            return Ok(array.values[idx]);
        }

        Err((
            RuntimeErrorKind::TypeMismatch,
            "only instances and tables have attributes".to_string(),
        ))
    }

    fn set_field(
        &mut self,
        container: Value,
        key: Value,
        value: Value,
    ) -> Result<(), (RuntimeErrorKind, String)> {
        if !container.is_object() {
            return Err((
                RuntimeErrorKind::TypeMismatch,
                "only instances and tables have fields".to_string(),
            ));
        }
        let handle = container.as_handle();

        match self.heap.object(handle) {
            Object::Instance(_) | Object::Table(_) => {
                let key_handle = match self.key_string(key) {
                    Some(k) => k,
                    None => {
                        return Err((
                            RuntimeErrorKind::KeyMustBeString,
                            "key must be a string".to_string(),
                        ));
                    }
                };
                let hash = self.heap.string_hash(key_handle);
                match self.heap.object_mut(handle) {
                    Object::Instance(instance) => {
                        instance.fields.set(key_handle, hash, value);
                    }
                    Object::Table(table) => {
                        table.values.set(key_handle, hash, value);
                    }
                    _ => unreachable!("container changed type mid-assignment"),
                }
                Ok(())
            }
            Object::Array(array) => {
                let idx = self.array_index(array.values.len(), key)?;
                match self.heap.object_mut(handle) {
                    Object::Array(array) => array.values[idx] = value,
                    _ => unreachable!("container changed type mid-assignment"),
                }
                Ok(())
            }
            _ => Err((
                RuntimeErrorKind::TypeMismatch,
                "only instances and tables have fields".to_string(),
            )),
        }
    }

    fn del_field(
        &mut self,
        container: Value,
        key: Value,
    ) -> Result<(), (RuntimeErrorKind, String)> {
        let key_handle = match self.key_string(key) {
            Some(k) => k,
            None => {
                return Err((
                    RuntimeErrorKind::KeyMustBeString,
                    "key must be a string".to_string(),
                ));
            }
        };
        if !container.is_object() {
            return Err((
                RuntimeErrorKind::TypeMismatch,
                "only instances have fields".to_string(),
            ));
        }
        let hash = self.heap.string_hash(key_handle);
        let deleted = match self.heap.object_mut(container.as_handle()) {
            Object::Instance(instance) => instance.fields.delete(key_handle, hash),
            Object::Table(table) => table.values.delete(key_handle, hash),
            _ => false,
        };
        if deleted {
            Ok(())
        } else {
            Err((
                RuntimeErrorKind::UnknownAttribute,
                format!(
                    "cannot delete field '{}'",
                    self.heap.string(key_handle).chars
                ),
            ))
        }
    }

    fn instance_fields(&self, handle: Handle) -> &Table {
        match self.heap.object(handle) {
            Object::Instance(instance) => &instance.fields,
            other => unreachable!("expected instance, found {}", other.kind_name()),
        }
    }

    fn class_methods(&self, handle: Handle) -> &Table {
        match self.heap.object(handle) {
            Object::Class(class) => &class.methods,
            other => unreachable!("expected class, found {}", other.kind_name()),
        }
    }

    // ----- calls -----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if callee.is_object() {
            match self.heap.object(callee.as_handle()) {
                Object::Closure(_) => return self.call_closure(callee.as_handle(), argc),
                Object::Native(native) => {
                    let function = native.function;
                    let base = self.stack.len() - argc;
                    let result = function(&mut self.heap, &self.stack[base..]);
                    return match result {
                        Ok(value) => {
                            self.stack.truncate(base - 1);
                            self.push(value);
                            Ok(())
                        }
                        Err(message) => {
                            Err(self.build_error(RuntimeErrorKind::Native, message))
                        }
                    };
                }
                Object::Class(_) => {
                    let class = callee.as_handle();
                    let instance = self.alloc(Object::Instance(InstanceObj {
                        class,
                        fields: Table::new(),
                    }));
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = Value::object(instance);

                    let init = self.heap.init_string;
                    let hash = self.heap.string_hash(init);
                    let initializer = self.class_methods(class).get(init, hash);
                    return match initializer {
                        Some(method) => self.call_closure(method.as_handle(), argc),
                        None if argc != 0 => {
                            let message = format!("expected 0 arguments but got {argc}");
                            Err(self.build_error(RuntimeErrorKind::ArityMismatch, message))
                        }
                        None => Ok(()),
                    };
                }
                Object::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let closure = bound.closure;
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(closure, argc);
                }
                _ => {}
            }
        }
        Err(self.build_error(
            RuntimeErrorKind::NotCallable,
            "attempted to call non-function value".to_string(),
        ))
    }

    fn call_closure(&mut self, closure: Handle, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            let message = format!("expected {arity} arguments but got {argc}");
            return Err(self.build_error(RuntimeErrorKind::ArityMismatch, message));
        }
        if self.frames.len() >= FRAME_MAX {
            return Err(
                self.build_error(RuntimeErrorKind::StackOverflow, "stack overflow".to_string())
            );
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// Fused `DOT_GET` + `CALL`. The receiver stays in the callee slot, so
    /// methods get it as `this` without a bound-method allocation; plain
    /// callables found in fields replace the slot like a normal call.
    fn invoke(&mut self, name: Handle, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        if !receiver.is_object() {
            return Err(self.build_error(
                RuntimeErrorKind::TypeMismatch,
                "only instances and tables have attributes".to_string(),
            ));
        }
        let hash = self.heap.string_hash(name);
        let handle = receiver.as_handle();

        if let Object::Instance(instance) = self.heap.object(handle) {
            let class = instance.class;
            if let Some(field) = instance.fields.get(name, hash) {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = field;
                return self.call_value(field, argc);
            }
            return match self.class_methods(class).get(name, hash) {
                Some(method) => self.call_closure(method.as_handle(), argc),
                None => {
                    let message =
                        format!("object has no attribute '{}'", self.heap.string(name).chars);
                    Err(self.build_error(RuntimeErrorKind::UnknownAttribute, message))
                }
            };
        }

        if let Object::Table(table) = self.heap.object(handle) {
            return match table.values.get(name, hash) {
                Some(value) => {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = value;
                    self.call_value(value, argc)
                }
                None => {
                    let message =
                        format!("table has no attribute '{}'", self.heap.string(name).chars);
                    Err(self.build_error(RuntimeErrorKind::UnknownAttribute, message))
                }
            };
        }

        if let Object::Array(array) = self.heap.object(handle) {
            return match array.methods.get(name, hash) {
                Some(method) => self.call_closure(method.as_handle(), argc),
                None => {
                    let message =
                        format!("array has no attribute '{}'", self.heap.string(name).chars);
                    Err(self.build_error(RuntimeErrorKind::UnknownAttribute, message))
                }
            };
        }

        Err(self.build_error(
            RuntimeErrorKind::TypeMismatch,
            "only instances and tables have attributes".to_string(),
        ))
    }

    // ----- upvalues --------------------------------------------------------

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted by stack index, descending, with no duplicates.
    fn capture_upvalue(&mut self, stack_idx: usize) -> Handle {
        let mut prev: Option<Handle> = None;
        let mut curr = self.open_upvalues;
        while let Some(handle) = curr {
            let upvalue = self.upvalue(handle);
            let idx = match upvalue.state {
                UpvalueState::Open(idx) => idx,
                UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if idx == stack_idx {
                return handle;
            }
            if idx < stack_idx {
                break;
            }
            prev = Some(handle);
            curr = upvalue.next;
        }

        let created = self.alloc(Object::Upvalue(UpvalueObj {
            state: UpvalueState::Open(stack_idx),
            next: curr,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.upvalue_mut(p).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack slot
    /// into the upvalue's own cell and drop it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let upvalue = self.upvalue(handle);
            let idx = match upvalue.state {
                UpvalueState::Open(idx) => idx,
                UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if idx < last {
                break;
            }
            let next = upvalue.next;
            let value = self.stack[idx];
            let cell = self.upvalue_mut(handle);
            cell.state = UpvalueState::Closed(value);
            cell.next = None;
            self.open_upvalues = next;
        }
    }
}
