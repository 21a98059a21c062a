//! Single-pass compiler: tokens in, bytecode out.
//!
//! Statements are parsed by recursive descent; expressions by a Pratt
//! table of `(prefix, infix, precedence)` handlers. Opcodes are emitted
//! inline as the parse advances — no AST is ever built.
//!
//! One `FunctionCtx` exists per function being compiled, stacked to mirror
//! lexical nesting; upvalue resolution walks that stack. Loop and break
//! targets are per-context stacks so `continue`/`break` can unwind locals
//! and jump through the reserved `MarkJump` patch slot of the innermost
//! loop or switch.
//!
//! GC discipline: the compiler allocates strings and functions while it
//! runs, so every object it creates is pinned on the heap's temp-root
//! stack until `compile` returns. Collections triggered mid-compile pass
//! `ExternalRoots::empty()` — there is no operand stack yet.

use std::collections::HashSet;
use std::fmt;

use ember_core::debug::disassemble_chunk;
use ember_core::{Chunk, ExternalRoots, FunctionObj, Handle, Heap, Object, OpCode, Value};
use tracing::debug;

use crate::lexer::Scanner;
use crate::token::{Token, TokenKind};

/// Most locals a single function may declare.
const LOCAL_LIMIT: usize = 2048;

/// Most upvalues a single function may capture.
const UPVALUE_LIMIT: usize = 256;

/// Compile the whole of `source` into a top-level script function.
///
/// The returned handle is not rooted: callers must pin it (temp root or
/// operand stack) before their next allocation point.
pub fn compile(heap: &mut Heap, source: &str, repl: bool) -> Result<Handle, CompileError> {
    let root_mark = heap.roots_mark();
    let (function, had_error, diagnostics) = {
        let mut compiler = Compiler::new(heap, source, repl);

        compiler.advance();
        while !compiler.match_token(TokenKind::Eof) {
            compiler.declaration();
        }

        let (function, _) = compiler.end_compiler();
        let diagnostics = std::mem::take(&mut compiler.parser.diagnostics);
        (function, compiler.parser.had_error, diagnostics)
    };
    heap.truncate_roots(root_mark);

    if had_error {
        Err(CompileError { diagnostics })
    } else {
        Ok(function)
    }
}

/// One reported compile-time problem.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
    /// Rendered location suffix: `" at 'x'"`, `" at end"`, or empty.
    pub location: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] error{}: {}", self.line, self.location, self.message)
    }
}

/// All diagnostics from one failed compile.
#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` while the initializer is still being compiled.
    depth: i32,
    is_assignable: bool,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct CompilerUpvalue {
    index: u32,
    is_local: bool,
}

/// A loop's `continue` target.
#[derive(Clone, Copy)]
struct LoopMark {
    offset: usize,
    depth: i32,
}

/// A loop's or switch's `break` patch slot (a `MarkJump` placeholder).
#[derive(Clone, Copy)]
struct JumpMark {
    idx: usize,
    depth: i32,
}

/// Per-function compile state.
struct FunctionCtx<'src> {
    locals: Vec<Local<'src>>,
    depth: i32,
    loops: Vec<LoopMark>,
    jumps: Vec<JumpMark>,
    upvalues: Vec<CompilerUpvalue>,
    fn_type: FunctionType,
    arity: usize,
    name: Option<Handle>,
    chunk: Chunk,
}

impl<'src> FunctionCtx<'src> {
    fn new(fn_type: FunctionType, name: Option<Handle>) -> FunctionCtx<'src> {
        // Slot 0 belongs to the callee: the receiver for methods, otherwise
        // a name no identifier can collide with.
        let slot_zero = Local {
            name: match fn_type {
                FunctionType::Method | FunctionType::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_assignable: false,
            is_captured: false,
        };
        FunctionCtx {
            locals: vec![slot_zero],
            depth: 0,
            loops: Vec::new(),
            jumps: Vec::new(),
            upvalues: Vec::new(),
            fn_type,
            arity: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}

struct ParserState<'src> {
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    parser: ParserState<'src>,
    heap: &'h mut Heap,
    ctxs: Vec<FunctionCtx<'src>>,
    /// Lexical class nesting; nonzero makes `this` legal.
    class_depth: usize,
    /// Names declared `const` at global scope in this compile.
    const_globals: HashSet<&'src str>,
    repl: bool,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(heap: &'h mut Heap, source: &'src str, repl: bool) -> Compiler<'src, 'h> {
        Compiler {
            scanner: Scanner::new(source),
            parser: ParserState {
                previous: Token::synthetic(TokenKind::Eof),
                current: Token::synthetic(TokenKind::Eof),
                had_error: false,
                panic_mode: false,
                diagnostics: Vec::new(),
            },
            heap,
            ctxs: vec![FunctionCtx::new(FunctionType::Script, None)],
            class_depth: 0,
            const_globals: HashSet::new(),
            repl,
        }
    }

    // ----- parser plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            let token = self.scanner.scan_token();
            self.parser.current = token;
            match token.kind {
                TokenKind::Comment => continue,
                TokenKind::Error => self.error_at_current(token.lexeme),
                _ => break,
            }
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.parser.diagnostics.push(Diagnostic {
            line: token.line,
            message: message.to_string(),
            location,
        });
    }

    /// Skip to the next statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.match_token(TokenKind::Semicolon) {
                return;
            }
            use TokenKind::*;
            match self.parser.current.kind {
                Print | LeftBrace | RightBrace | If | While | For | Switch | Return | Let
                | Const | Fun | Class | Break | Continue | Del => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ----- context access --------------------------------------------------

    fn ctx(&self) -> &FunctionCtx<'src> {
        &self.ctxs[self.ctxs.len() - 1]
    }

    fn ctx_mut(&mut self) -> &mut FunctionCtx<'src> {
        let i = self.ctxs.len() - 1;
        &mut self.ctxs[i]
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.ctx_mut().chunk
    }

    fn code_len(&self) -> usize {
        self.ctx().chunk.code_len()
    }

    // ----- allocation chokepoints ------------------------------------------

    /// Interning may need to allocate; give the collector a chance first.
    fn intern(&mut self, chars: &str) -> Handle {
        if self.heap.should_collect() {
            self.heap.collect(&ExternalRoots::empty());
        }
        self.heap.intern(chars)
    }

    fn alloc(&mut self, object: Object) -> Handle {
        if self.heap.should_collect() {
            self.heap.collect(&ExternalRoots::empty());
        }
        self.heap.allocate(object)
    }

    // ----- emission --------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_u32(&mut self, value: u32) {
        for byte in value.to_be_bytes() {
            self.emit_byte(byte);
        }
    }

    /// Opcode plus two placeholder bytes; returns the placeholder offset.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, idx: usize) {
        let jump = self.code_len() - idx - 2;
        if jump > u16::MAX as usize {
            self.error("too many jumps");
            return;
        }
        let chunk = self.chunk_mut();
        chunk.code[idx] = (jump >> 8) as u8;
        chunk.code[idx + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let jump = self.code_len() - start + 2;
        if jump > u16::MAX as usize {
            self.error("too many jumps");
            return;
        }
        self.emit_byte((jump >> 8) as u8);
        self.emit_byte((jump & 0xff) as u8);
    }

    /// Pin object constants on the temp-root stack for the rest of the
    /// compile: the in-progress chunk is not yet visible to the GC.
    fn make_long_constant(&mut self, value: Value) -> u32 {
        if value.is_object() {
            self.heap.push_root(value);
        }
        self.chunk_mut().add_long_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_long_constant(value);
        self.emit_op(OpCode::ConstantLong);
        self.emit_u32(idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u32 {
        let handle = self.intern(name);
        self.make_long_constant(Value::object(handle))
    }

    fn emit_return(&mut self) {
        if self.ctx().fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_u32(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Finish the current function: allocate its heap object and hand back
    /// the upvalue descriptors for the enclosing `OP_CLOSURE`.
    fn end_compiler(&mut self) -> (Handle, Vec<CompilerUpvalue>) {
        self.emit_return();

        let ctx = match self.ctxs.pop() {
            Some(ctx) => ctx,
            None => unreachable!("compiler context stack underflow"),
        };
        let upvalues = ctx.upvalues;
        let function = self.alloc(Object::Function(FunctionObj {
            arity: ctx.arity,
            upvalue_count: upvalues.len(),
            name: ctx.name,
            chunk: ctx.chunk,
        }));

        if !self.parser.had_error {
            let fun = self.heap.function(function);
            let name = match fun.name {
                Some(n) => self.heap.string(n).chars.to_string(),
                None => "<script>".to_string(),
            };
            debug!(function = %name, "\n{}", disassemble_chunk(self.heap, &fun.chunk, &name));
        }

        (function, upvalues)
    }

    // ----- scopes, locals, upvalues ----------------------------------------

    fn begin_scope(&mut self) {
        self.ctx_mut().depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().depth -= 1;
        let depth = self.ctx().depth;
        loop {
            let captured = match self.ctx().locals.last() {
                Some(local) if local.depth > depth => local.is_captured,
                _ => break,
            };
            self.ctx_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn declare_local(&mut self, name: &'src str, is_assignable: bool) {
        if self.ctx().locals.len() >= LOCAL_LIMIT {
            self.error("too many local variables");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            is_assignable,
            is_captured: false,
        });
    }

    /// Mark the most recent local as initialized at the current depth.
    fn define_local(&mut self) {
        let depth = self.ctx().depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.ctx_mut().locals.last_mut() {
            if local.depth == -1 {
                local.depth = depth;
            }
        }
    }

    /// Reject a duplicate name in the current scope, then declare.
    fn declare(&mut self, is_assignable: bool) {
        if self.ctx().depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let depth = self.ctx().depth;
        let duplicate = self
            .ctx()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth != -1 && l.depth >= depth)
            .any(|l| l.name == name);
        if duplicate {
            self.error("redeclaration of variable");
            return;
        }
        self.declare_local(name, is_assignable);
    }

    /// Consume a variable name. Locals are declared here and resolve by
    /// slot; globals get a constant-pool index for their name.
    fn parse_variable(&mut self, is_assignable: bool, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        if self.ctx().depth > 0 {
            self.declare(is_assignable);
            0
        } else {
            self.identifier_constant(self.parser.previous.lexeme)
        }
    }

    fn define_variable(&mut self, global_idx: u32) {
        if self.ctx().depth > 0 {
            self.define_local();
        } else {
            self.emit_op(OpCode::GlobalVar);
            self.emit_u32(global_idx);
        }
    }

    /// Reverse scan of a context's locals. Reading a local whose
    /// initializer is still open is an error.
    fn resolve_local(&mut self, ctx_i: usize, name: &str) -> Option<u32> {
        let found = self.ctxs[ctx_i]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| !l.name.is_empty() && l.name == name)
            .map(|(i, l)| (i, l.depth));
        match found {
            Some((i, depth)) => {
                if depth == -1 {
                    self.error("cannot read variable in its own initializer");
                }
                Some(i as u32)
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, ctx_i: usize, index: u32, is_local: bool) -> u32 {
        for (i, up) in self.ctxs[ctx_i].upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u32;
            }
        }
        if self.ctxs[ctx_i].upvalues.len() >= UPVALUE_LIMIT {
            self.error("too many captured variables");
            return 0;
        }
        self.ctxs[ctx_i]
            .upvalues
            .push(CompilerUpvalue { index, is_local });
        (self.ctxs[ctx_i].upvalues.len() - 1) as u32
    }

    /// Find `name` in an enclosing function. A hit marks the outer local
    /// captured and threads an upvalue through every frame in between.
    fn resolve_upvalue(&mut self, ctx_i: usize, name: &str) -> Option<u32> {
        if ctx_i == 0 {
            return None;
        }
        let enclosing = ctx_i - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.ctxs[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_i, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(ctx_i, upvalue, false));
        }
        None
    }

    /// Emit a read or (when `can_assign` and `=` follows) a write of a
    /// local, upvalue or global.
    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.ctxs.len() - 1;
        let local = self.resolve_local(top, name);
        let (get_op, set_op, idx, assignable) = if self.ctx().depth > 0 && local.is_some() {
            let i = local.unwrap_or(0);
            let assignable = self.ctx().locals[i as usize].is_assignable;
            (OpCode::GetLocal, OpCode::SetLocal, i, assignable)
        } else if let Some(i) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, i, true)
        } else {
            let idx = self.identifier_constant(name);
            let assignable = !self.const_globals.contains(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx, assignable)
        };

        if can_assign && self.check(TokenKind::Equal) {
            if !assignable {
                self.error("cannot assign to const");
            }
            self.advance();
            self.expression();
            self.emit_op(set_op);
            self.emit_u32(idx);
        } else {
            self.emit_op(get_op);
            self.emit_u32(idx);
        }
    }

    // ----- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.parser.previous.kind).prefix;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.error("syntax error");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.parser.current.kind).precedence {
            self.advance();
            match rule(self.parser.previous.kind).infix {
                Some(f) => f(self, can_assign),
                None => {
                    self.error("syntax error");
                    return;
                }
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern(chars);
        self.emit_constant(Value::object(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!("literal handler on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Bang),
            _ => unreachable!("unary handler on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        self.parse_precedence(rule(op).precedence.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::EqualEqual => self.emit_op(OpCode::EqualEqual),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Bang);
            }
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Bang);
            }
            TokenKind::BangEqual => {
                self.emit_op(OpCode::EqualEqual);
                self.emit_op(OpCode::Bang);
            }
            _ => unreachable!("binary handler on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::Colon, "expected ':' in ternary expression");
        self.expression();
        self.emit_op(OpCode::Ternary);
    }

    fn parse_args(&mut self) -> u8 {
        let mut arity: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arity == u8::MAX {
                    self.error("too many arguments");
                } else {
                    arity += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        arity
    }

    fn call(&mut self, _can_assign: bool) {
        let arity = self.parse_args();
        self.emit_op(OpCode::Call);
        self.emit_byte(arity);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name_idx = self.identifier_constant(self.parser.previous.lexeme);

        if self.match_token(TokenKind::LeftParen) {
            let arity = self.parse_args();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(arity);
            self.emit_u32(name_idx);
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::DotSet);
            self.emit_u32(name_idx);
        } else {
            self.emit_op(OpCode::DotGet);
            self.emit_u32(name_idx);
        }
    }

    fn sqr_bracket(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SqrBracketSet);
        } else {
            self.emit_op(OpCode::SqrBracketGet);
        }
    }

    fn array(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::Array);
        let mut count: u32 = 0;
        while !self.check(TokenKind::RightBracket) {
            self.expression();
            count += 1;
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
        self.emit_op(OpCode::ArrayItems);
        self.emit_u32(count);
    }

    fn table(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::Table);
        let mut count: u32 = 0;
        while !self.check(TokenKind::RightBrace) {
            if !self.check(TokenKind::String) {
                self.advance();
                self.error("table keys must be string literals");
                return;
            }
            self.expression();
            self.consume(TokenKind::Colon, "expected ':' after table key");
            self.expression();
            count += 1;
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after table entries");
        self.emit_op(OpCode::TableItems);
        self.emit_u32(count);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("'this' outside class");
            return;
        }
        self.named_variable("this", false);
    }

    fn len_(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'len'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
        self.emit_op(OpCode::Len);
    }

    // ----- statements ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Let) {
            self.var_declaration(true);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.block_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Del) {
            self.del_statement();
        } else {
            self.expression_statement();
        }
    }

    fn var_declaration(&mut self, is_assignable: bool) {
        let global_idx = self.parse_variable(is_assignable, "expected variable name");
        let name = self.parser.previous.lexeme;

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "expected ';' after variable declaration",
        );

        if self.ctx().depth == 0 {
            if is_assignable {
                self.const_globals.remove(name);
            } else {
                self.const_globals.insert(name);
            }
        }
        self.define_variable(global_idx);
    }

    fn function_declaration(&mut self) {
        let global_idx = self.parse_variable(false, "expected function name");
        self.function(FunctionType::Function);
        self.define_variable(global_idx);
    }

    /// Compile a function body (parameters through closing brace) in a new
    /// context, then emit the `OP_CLOSURE` that materializes it.
    fn function(&mut self, fn_type: FunctionType) {
        // Make the just-declared name visible inside the body so the
        // function can recurse.
        self.define_local();

        let name = self.intern(self.parser.previous.lexeme);
        self.heap.push_root(Value::object(name));
        self.ctxs.push(FunctionCtx::new(fn_type, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.ctx_mut().arity += 1;
                self.parse_variable(true, "expected parameter name");
                self.define_local();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");

        self.block_statement();

        let (function, upvalues) = self.end_compiler();
        let idx = self.make_long_constant(Value::object(function));
        self.emit_op(OpCode::Closure);
        self.emit_u32(idx);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_u32(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let class_name = self.parser.previous.lexeme;
        let name_idx = self.identifier_constant(class_name);
        self.declare(false);

        self.emit_op(OpCode::Class);
        self.emit_u32(name_idx);
        self.define_variable(name_idx);

        // Load the class back on the stack for the OP_METHOD writes.
        self.named_variable(class_name, false);

        self.class_depth += 1;
        self.consume(TokenKind::LeftBrace, "expected '{' after class name");
        self.begin_scope();

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "expected method name");
            let method_name = self.parser.previous.lexeme;
            let method_idx = self.identifier_constant(method_name);
            let fn_type = if method_name == "init" {
                FunctionType::Initializer
            } else {
                FunctionType::Method
            };
            self.function(fn_type);
            self.emit_op(OpCode::Method);
            self.emit_u32(method_idx);
        }

        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);
        self.end_scope();
        self.class_depth -= 1;
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        if self.repl {
            self.emit_op(OpCode::Print);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn block_statement(&mut self) {
        self.begin_scope();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
        self.end_scope();
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' before condition");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        // Reserve the break target before anything else in the loop.
        let while_jump = self.emit_jump(OpCode::MarkJump);
        let depth = self.ctx().depth;
        self.ctx_mut().jumps.push(JumpMark {
            idx: while_jump,
            depth,
        });
        let loop_start = self.code_len();
        self.ctx_mut().loops.push(LoopMark {
            offset: loop_start,
            depth,
        });

        self.consume(TokenKind::LeftParen, "expected '(' before condition");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.emit_op(OpCode::Pop);
        self.patch_jump(while_jump);
        self.ctx_mut().jumps.pop();
        self.ctx_mut().loops.pop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        let for_jump = self.emit_jump(OpCode::MarkJump);
        let depth = self.ctx().depth;
        self.ctx_mut().jumps.push(JumpMark {
            idx: for_jump,
            depth,
        });

        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenKind::RightParen) {
            // Run the body first, then the increment, then retest.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.consume(TokenKind::RightParen, "expected ')' after for clauses");

        let depth = self.ctx().depth;
        self.ctx_mut().loops.push(LoopMark {
            offset: loop_start,
            depth,
        });
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.patch_jump(for_jump);

        self.ctx_mut().jumps.pop();
        self.ctx_mut().loops.pop();
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        let switch_jump = self.emit_jump(OpCode::MarkJump);
        self.begin_scope();
        let depth = self.ctx().depth;
        self.ctx_mut().jumps.push(JumpMark {
            idx: switch_jump,
            depth,
        });

        self.consume(TokenKind::LeftParen, "expected '(' after 'switch'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after switch value");
        self.consume(TokenKind::LeftBrace, "expected '{' before switch body");

        // Two hidden locals cover the switch value and the match flag, so
        // scope exit pops both. "switch" is a keyword; no user identifier
        // can resolve to these.
        for _ in 0..2 {
            let depth = self.ctx().depth;
            self.ctx_mut().locals.push(Local {
                name: "switch",
                depth,
                is_assignable: false,
                is_captured: false,
            });
        }
        self.emit_op(OpCode::Switch);

        while !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::Eof)
        {
            self.case_statement();
        }
        if self.match_token(TokenKind::Default) {
            self.default_statement();
        }

        self.consume(TokenKind::RightBrace, "expected '}' after switch body");
        self.patch_jump(switch_jump);
        self.ctx_mut().jumps.pop();
        self.end_scope();
    }

    fn case_statement(&mut self) {
        self.consume(TokenKind::Case, "expected 'case'");

        // Once a previous case matched, skip the comparison entirely: the
        // flag is still true and execution falls through.
        let case_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.expression();
        self.emit_op(OpCode::CaseCompare);
        self.patch_jump(case_jump);

        let jump_false = self.emit_jump(OpCode::JumpIfFalse);
        self.consume(TokenKind::Colon, "expected ':' after case value");
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::Eof)
        {
            self.statement();
        }
        self.patch_jump(jump_false);
    }

    fn default_statement(&mut self) {
        self.consume(TokenKind::Colon, "expected ':' after 'default'");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.statement();
        }
    }

    fn return_statement(&mut self) {
        if !self.check(TokenKind::Semicolon) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }

        // An initializer always returns its receiver, whatever the
        // return expression said.
        if self.ctx().fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::GetLocal);
            self.emit_u32(0);
        }
        self.emit_op(OpCode::Return);
        self.consume(TokenKind::Semicolon, "expected ';' after return value");
    }

    fn continue_statement(&mut self) {
        if self.ctx().loops.is_empty() {
            self.error("'continue' outside loop");
            return;
        }
        let mark = self.ctx().loops[self.ctx().loops.len() - 1];
        self.emit_scope_pops(mark.depth);
        self.emit_loop(mark.offset);
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
    }

    fn break_statement(&mut self) {
        if self.ctx().jumps.is_empty() {
            self.error("'break' outside loop");
            return;
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");

        let mark = self.ctx().jumps[self.ctx().jumps.len() - 1];
        self.emit_scope_pops(mark.depth);

        let dist = self.code_len() - (mark.idx - 1);
        if mark.idx > u8::MAX as usize || dist > u8::MAX as usize {
            self.error("too many jumps");
            return;
        }
        self.emit_op(OpCode::SwitchJump);
        self.emit_byte(mark.idx as u8);
        self.emit_byte(dist as u8);
    }

    /// Pop the locals that would go out of scope when jumping out to
    /// `depth`, without forgetting them (the scope is still open).
    fn emit_scope_pops(&mut self, depth: i32) {
        let pops = self
            .ctx()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }
    }

    fn del_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected identifier after 'del'");
        self.named_variable(self.parser.previous.lexeme, false);
        self.consume(TokenKind::Dot, "expected '.' after identifier");
        loop {
            self.consume(TokenKind::Identifier, "expected field name");
            let name_idx = self.identifier_constant(self.parser.previous.lexeme);
            if self.check(TokenKind::Dot) {
                self.emit_op(OpCode::DotGet);
                self.emit_u32(name_idx);
            } else {
                self.emit_op(OpCode::ConstantLong);
                self.emit_u32(name_idx);
            }
            if !self.match_token(TokenKind::Dot) {
                break;
            }
        }
        self.emit_op(OpCode::Del);
        self.consume(TokenKind::Semicolon, "expected ';' after del target");
    }
}

fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind as T;

    fn make<'src, 'h>(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'h> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        T::LeftParen => make(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        T::LeftBrace => make(Some(Compiler::table), None, Precedence::None),
        T::LeftBracket => make(
            Some(Compiler::array),
            Some(Compiler::sqr_bracket),
            Precedence::Call,
        ),
        T::Dot => make(None, Some(Compiler::dot), Precedence::Call),
        T::Minus => make(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        T::Plus => make(None, Some(Compiler::binary), Precedence::Term),
        T::Star | T::Slash => make(None, Some(Compiler::binary), Precedence::Factor),
        T::Bang => make(Some(Compiler::unary), None, Precedence::None),
        T::Question => make(None, Some(Compiler::ternary), Precedence::Ternary),
        T::EqualEqual | T::BangEqual => make(None, Some(Compiler::binary), Precedence::Equality),
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
            make(None, Some(Compiler::binary), Precedence::Comparison)
        }
        T::And => make(None, Some(Compiler::and_), Precedence::And),
        T::Or => make(None, Some(Compiler::or_), Precedence::Or),
        T::Number => make(Some(Compiler::number), None, Precedence::Primary),
        T::String => make(Some(Compiler::string), None, Precedence::None),
        T::Identifier => make(Some(Compiler::variable), None, Precedence::None),
        T::This => make(Some(Compiler::this_), None, Precedence::None),
        T::Len => make(Some(Compiler::len_), None, Precedence::Call),
        T::Nil | T::True | T::False => make(Some(Compiler::literal), None, Precedence::None),
        _ => make(None, None, Precedence::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new(false);
        let function = compile(&mut heap, source, false).expect("compile failed");
        (heap, function)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut heap = Heap::new(false);
        match compile(&mut heap, source, false) {
            Ok(_) => panic!("expected compile error for: {source}"),
            Err(e) => e,
        }
    }

    fn has_op(heap: &Heap, function: Handle, op: OpCode) -> bool {
        let chunk = &heap.function(function).chunk;
        let mut offset = 0;
        while offset < chunk.code_len() {
            let (_, next) =
                ember_core::debug::disassemble_instruction(heap, chunk, offset);
            if chunk.code[offset] == op as u8 {
                return true;
            }
            offset = next;
        }
        false
    }

    #[test]
    fn test_arithmetic_emits_expected_ops() {
        let (heap, f) = compile_ok("print 1 + 2 * 3;");
        for op in [
            OpCode::ConstantLong,
            OpCode::Multiply,
            OpCode::Add,
            OpCode::Print,
            OpCode::Return,
        ] {
            assert!(has_op(&heap, f, op), "missing {op:?}");
        }
    }

    #[test]
    fn test_comparison_lowering_uses_bang() {
        let (heap, f) = compile_ok("print 1 >= 2;");
        assert!(has_op(&heap, f, OpCode::Less));
        assert!(has_op(&heap, f, OpCode::Bang));
        assert!(!has_op(&heap, f, OpCode::Greater));
    }

    #[test]
    fn test_top_level_let_is_global() {
        let (heap, f) = compile_ok("let x = 1; print x;");
        assert!(has_op(&heap, f, OpCode::GlobalVar));
        assert!(has_op(&heap, f, OpCode::GetGlobal));
    }

    #[test]
    fn test_block_locals_resolve_by_slot() {
        let (heap, f) = compile_ok("{ let x = 1; print x; }");
        assert!(has_op(&heap, f, OpCode::GetLocal));
        assert!(!has_op(&heap, f, OpCode::GetGlobal));
    }

    #[test]
    fn test_function_emits_closure_and_upvalue_count() {
        let (heap, script) = compile_ok(
            "fun make() { let i = 0; fun inc() { i = i + 1; return i; } return inc; }",
        );
        assert!(has_op(&heap, script, OpCode::Closure));
        // Find `make` in the constant pool and check `inc` captured one upvalue.
        let chunk = &heap.function(script).chunk;
        let mut found = false;
        for value in chunk.all_constants() {
            if !value.is_object() {
                continue;
            }
            if let Object::Function(make) = heap.object(value.as_handle()) {
                for inner in make.chunk.all_constants() {
                    if !inner.is_object() {
                        continue;
                    }
                    if let Object::Function(inc) = heap.object(inner.as_handle()) {
                        if inc.upvalue_count == 1 {
                            found = true;
                        }
                    }
                }
            }
        }
        assert!(found, "inner closure should capture exactly one upvalue");
    }

    #[test]
    fn test_class_with_init_and_method() {
        let (heap, f) = compile_ok(
            "class Pair { init(a, b) { this.a = a; this.b = b; } sum() { return this.a + this.b; } }",
        );
        assert!(has_op(&heap, f, OpCode::Class));
        assert!(has_op(&heap, f, OpCode::Method));
    }

    #[test]
    fn test_method_call_fuses_to_invoke() {
        let (heap, f) = compile_ok("let a = [1]; a.push(2);");
        assert!(has_op(&heap, f, OpCode::Invoke));
        assert!(!has_op(&heap, f, OpCode::DotGet));
    }

    #[test]
    fn test_switch_emits_case_compare() {
        let (heap, f) = compile_ok(
            "switch (1) { case 1: print 1; break; default: print 0; }",
        );
        assert!(has_op(&heap, f, OpCode::Switch));
        assert!(has_op(&heap, f, OpCode::CaseCompare));
        assert!(has_op(&heap, f, OpCode::SwitchJump));
        assert!(has_op(&heap, f, OpCode::MarkJump));
    }

    #[test]
    fn test_const_assignment_rejected() {
        let err = compile_err("{ const x = 1; x = 2; }");
        assert!(err.to_string().contains("cannot assign to const"));
    }

    #[test]
    fn test_const_global_assignment_rejected() {
        let err = compile_err("const x = 1; x = 2;");
        assert!(err.to_string().contains("cannot assign to const"));
    }

    #[test]
    fn test_redeclaration_rejected() {
        let err = compile_err("{ let x = 1; let x = 2; }");
        assert!(err.to_string().contains("redeclaration of variable"));
    }

    #[test]
    fn test_read_in_own_initializer_rejected() {
        let err = compile_err("{ let a = 1; { let a = a; } }");
        assert!(err.to_string().contains("own initializer"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = compile_err("1 + 2 = 3;");
        assert!(err.to_string().contains("invalid assignment target"));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let err = compile_err("break;");
        assert!(err.to_string().contains("'break' outside loop"));
    }

    #[test]
    fn test_continue_outside_loop_rejected() {
        let err = compile_err("continue;");
        assert!(err.to_string().contains("'continue' outside loop"));
    }

    #[test]
    fn test_this_outside_class_rejected() {
        let err = compile_err("print this;");
        assert!(err.to_string().contains("'this' outside class"));
    }

    #[test]
    fn test_table_key_must_be_string_literal() {
        let err = compile_err("let t = { 1: 2 };");
        assert!(err.to_string().contains("table keys must be string literals"));
    }

    #[test]
    fn test_error_recovery_reports_multiple_statements() {
        let err = compile_err("let = 1; let = 2;");
        assert!(err.diagnostics.len() >= 2, "synchronize should allow a second report");
    }

    #[test]
    fn test_repl_mode_prints_expression_statements() {
        let mut heap = Heap::new(false);
        let f = compile(&mut heap, "1 + 2;", true).expect("compile failed");
        assert!(has_op(&heap, f, OpCode::Print));
    }

    #[test]
    fn test_compound_assignment_tokens_rejected() {
        let err = compile_err("let x = 1; x += 2;");
        assert!(!err.diagnostics.is_empty());
    }

    #[test]
    fn test_jump_patching_round_trip() {
        // The whole if/else shape must decode to in-bounds jump targets.
        let (heap, f) = compile_ok("if (true) print 1; else print 2;");
        let chunk = &heap.function(f).chunk;
        let mut offset = 0;
        while offset < chunk.code_len() {
            let (text, next) =
                ember_core::debug::disassemble_instruction(&heap, chunk, offset);
            assert!(!text.contains("OP_UNKNOWN"), "undecodable byte at {offset}");
            offset = next;
        }
    }
}
