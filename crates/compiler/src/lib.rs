//! Ember compiler: source text straight to bytecode.
//!
//! A recursive-descent parser for statements and a Pratt parser for
//! expressions, emitting opcodes as it goes. There is no AST: `compile`
//! hands back a heap handle to the finished top-level function, ready for
//! the VM to wrap in a closure and run.

pub mod compiler;
pub mod lexer;
pub mod token;

pub use compiler::{CompileError, Diagnostic, compile};
pub use lexer::Scanner;
pub use token::{Token, TokenKind};
