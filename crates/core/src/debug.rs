//! Bytecode disassembler.
//!
//! Renders chunks for compiler debug logging, VM execution tracing and
//! tests. Output format, per instruction:
//!
//! ```text
//! 0004    2 OP_CONSTANT_LONG    1 'foo'
//! ```
//!
//! offset, source line (`|` when unchanged), opcode, operands, and the
//! resolved constant where one is referenced.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code_len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        let _ = writeln!(out, "{line}");
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the text and the offset of
/// the following instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.get_line(offset));
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(b) => {
            let _ = write!(out, "OP_UNKNOWN {b:#04x}");
            return (out, offset + 1);
        }
    };

    use OpCode::*;
    let next = match op {
        Return | Nil | True | False | Negate | Bang | Add | Subtract | Multiply | Divide
        | Greater | Less | EqualEqual | Ternary | Print | Pop | Switch | CaseCompare
        | CloseUpvalue | Del | Table | Array | ArrayPush | ArrayPop | Len | SqrBracketGet
        | SqrBracketSet => {
            let _ = write!(out, "{}", op_name(op));
            offset + 1
        }
        Constant => {
            let idx = chunk.code[offset + 1];
            let value = heap.show_value(chunk.constant(idx));
            let _ = write!(out, "{:<20} {idx} '{value}'", op_name(op));
            offset + 2
        }
        ConstantLong | GlobalVar | GetGlobal | SetGlobal | Class | Method | DotGet | DotSet => {
            let idx = read_u32(chunk, offset + 1);
            let value = heap.show_value(chunk.long_constant(idx));
            let _ = write!(out, "{:<20} {idx} '{value}'", op_name(op));
            offset + 5
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | TableItems | ArrayItems => {
            let idx = read_u32(chunk, offset + 1);
            let _ = write!(out, "{:<20} {idx}", op_name(op));
            offset + 5
        }
        Jump | JumpIfFalse | JumpIfTrue | MarkJump => {
            let jump = read_u16(chunk, offset + 1);
            let target = offset + 3 + jump as usize;
            let _ = write!(out, "{:<20} {offset} -> {target}", op_name(op));
            offset + 3
        }
        Loop => {
            let jump = read_u16(chunk, offset + 1);
            let target = offset + 3 - jump as usize;
            let _ = write!(out, "{:<20} {offset} -> {target}", op_name(op));
            offset + 3
        }
        SwitchJump => {
            let slot = chunk.code[offset + 1];
            let dist = chunk.code[offset + 2];
            let _ = write!(out, "{:<20} slot {slot} dist {dist}", op_name(op));
            offset + 3
        }
        Call => {
            let argc = chunk.code[offset + 1];
            let _ = write!(out, "{:<20} ({argc} args)", op_name(op));
            offset + 2
        }
        Invoke => {
            let argc = chunk.code[offset + 1];
            let idx = read_u32(chunk, offset + 2);
            let name = heap.show_value(chunk.long_constant(idx));
            let _ = write!(out, "{:<20} ({argc} args) '{name}'", op_name(op));
            offset + 6
        }
        Closure => {
            let idx = read_u32(chunk, offset + 1);
            let value = chunk.long_constant(idx);
            let _ = write!(out, "{:<20} {idx} {}", op_name(op), heap.show_value(value));
            let mut at = offset + 5;
            let count = heap.function(value.as_handle()).upvalue_count;
            for _ in 0..count {
                let is_local = chunk.code[at];
                let index = read_u32(chunk, at + 1);
                let which = if is_local == 1 { "local" } else { "upvalue" };
                let _ = write!(out, "\n{:04}    |   |- {which} {index}", at);
                at += 5;
            }
            at
        }
    };
    (out, next)
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    (u16::from(chunk.code[offset]) << 8) | u16::from(chunk.code[offset + 1])
}

fn read_u32(chunk: &Chunk, offset: usize) -> u32 {
    (u32::from(chunk.code[offset]) << 24)
        | (u32::from(chunk.code[offset + 1]) << 16)
        | (u32::from(chunk.code[offset + 2]) << 8)
        | u32::from(chunk.code[offset + 3])
}

fn op_name(op: OpCode) -> &'static str {
    use OpCode::*;
    match op {
        Return => "OP_RETURN",
        Constant => "OP_CONSTANT",
        ConstantLong => "OP_CONSTANT_LONG",
        Nil => "OP_NIL",
        True => "OP_TRUE",
        False => "OP_FALSE",
        Negate => "OP_NEGATE",
        Bang => "OP_BANG",
        Add => "OP_ADD",
        Subtract => "OP_SUBTRACT",
        Multiply => "OP_MULTIPLY",
        Divide => "OP_DIVIDE",
        Greater => "OP_GREATER",
        Less => "OP_LESS",
        EqualEqual => "OP_EQUAL_EQUAL",
        Ternary => "OP_TERNARY",
        Print => "OP_PRINT",
        Pop => "OP_POP",
        GlobalVar => "OP_GLOBAL_VAR",
        GetGlobal => "OP_GET_GLOBAL",
        SetGlobal => "OP_SET_GLOBAL",
        GetLocal => "OP_GET_LOCAL",
        SetLocal => "OP_SET_LOCAL",
        GetUpvalue => "OP_GET_UPVALUE",
        SetUpvalue => "OP_SET_UPVALUE",
        Jump => "OP_JUMP",
        JumpIfFalse => "OP_JUMP_IF_FALSE",
        JumpIfTrue => "OP_JUMP_IF_TRUE",
        Loop => "OP_LOOP",
        MarkJump => "OP_MARK_JUMP",
        Switch => "OP_SWITCH",
        CaseCompare => "OP_CASE_COMPARE",
        SwitchJump => "OP_SWITCH_JUMP",
        Call => "OP_CALL",
        Invoke => "OP_INVOKE",
        Closure => "OP_CLOSURE",
        CloseUpvalue => "OP_CLOSE_UPVALUE",
        Class => "OP_CLASS",
        Method => "OP_METHOD",
        DotGet => "OP_DOT_GET",
        DotSet => "OP_DOT_SET",
        SqrBracketGet => "OP_SQR_BRACKET_GET",
        SqrBracketSet => "OP_SQR_BRACKET_SET",
        Del => "OP_DEL",
        Table => "OP_TABLE",
        TableItems => "OP_TABLE_ITEMS",
        Array => "OP_ARRAY",
        ArrayItems => "OP_ARRAY_ITEMS",
        ArrayPush => "OP_ARRAY_PUSH",
        ArrayPop => "OP_ARRAY_POP",
        Len => "OP_LEN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_disassemble_simple_chunk() {
        let heap = Heap::new(false);
        let mut chunk = Chunk::new();
        let idx = chunk.add_long_constant(Value::number(7.0));
        chunk.write(OpCode::ConstantLong as u8, 1);
        for b in idx.to_be_bytes() {
            chunk.write(b, 1);
        }
        chunk.write(OpCode::Print as u8, 1);
        chunk.write(OpCode::Return as u8, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("OP_CONSTANT_LONG"));
        assert!(text.contains("'7'"));
        assert!(text.contains("OP_PRINT"));
        assert!(text.contains("OP_RETURN"));
    }

    #[test]
    fn test_missing_opcodes_not_dropped() {
        // SqrBracketGet has no operands; make sure the fallthrough group
        // advances exactly one byte.
        let heap = Heap::new(false);
        let mut chunk = Chunk::new();
        chunk.write(OpCode::SqrBracketGet as u8, 1);
        let (_, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 1);
    }
}
