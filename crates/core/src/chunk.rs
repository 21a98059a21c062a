//! Bytecode chunks: instruction stream, constant pools, line table.
//!
//! Instructions are variable length. Constant indices are big-endian 32-bit
//! (`OP_CONSTANT_LONG`); a deprecated 8-bit pool backs the legacy
//! `OP_CONSTANT`, which the VM still executes but the compiler no longer
//! emits. Jump offsets are big-endian 16-bit.

use crate::value::Value;

/// One-byte operation codes. Stack effects are documented where they are
/// not obvious from the name; the compiler depends on these being exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Pop the return value, close upvalues, tear down the frame, push the
    /// return value on the caller's stack.
    Return = 0,
    /// Legacy: push a constant from the 8-bit pool.
    Constant = 1,
    /// Push a constant from the 32-bit pool.
    ConstantLong = 2,
    Nil = 3,
    True = 4,
    False = 5,
    Negate = 6,
    Bang = 7,
    /// Numeric addition, or concatenation when either operand is a string.
    Add = 8,
    Subtract = 9,
    Multiply = 10,
    Divide = 11,
    Greater = 12,
    Less = 13,
    EqualEqual = 14,
    /// Pops else-value, then-value and condition; pushes the chosen branch.
    Ternary = 15,
    Print = 16,
    Pop = 17,
    /// Pop the initializer and bind it to a global name.
    GlobalVar = 18,
    GetGlobal = 19,
    SetGlobal = 20,
    GetLocal = 21,
    SetLocal = 22,
    GetUpvalue = 23,
    SetUpvalue = 24,
    Jump = 25,
    JumpIfFalse = 26,
    JumpIfTrue = 27,
    Loop = 28,
    /// Reserved patch slot shared by `break`; executes as a no-op skip.
    MarkJump = 29,
    /// Push the initial `false` match flag for a switch statement.
    Switch = 30,
    /// Pop the case value, compare against the switch expression two slots
    /// down, and overwrite the match flag with the result.
    CaseCompare = 31,
    /// `break`: indirect forward jump through a `MarkJump` patch slot.
    SwitchJump = 32,
    Call = 33,
    /// Fused property lookup + call for `obj.method(...)`.
    Invoke = 34,
    Closure = 35,
    CloseUpvalue = 36,
    Class = 37,
    /// Pop a closure and store it in the class two slots down.
    Method = 38,
    DotGet = 39,
    DotSet = 40,
    SqrBracketGet = 41,
    SqrBracketSet = 42,
    /// Pop key and container, delete the field.
    Del = 43,
    Table = 44,
    TableItems = 45,
    Array = 46,
    ArrayItems = 47,
    /// Append the value on top of the stack to the array beneath it.
    ArrayPush = 48,
    /// Remove the last element of the array on top and push it.
    ArrayPop = 49,
    Len = 50,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<OpCode, u8> {
        DECODE.get(byte as usize).copied().ok_or(byte)
    }
}

/// Decode table, in opcode order. A new opcode must be appended here too.
const DECODE: [OpCode; 51] = {
    use OpCode::*;
    [
        Return,
        Constant,
        ConstantLong,
        Nil,
        True,
        False,
        Negate,
        Bang,
        Add,
        Subtract,
        Multiply,
        Divide,
        Greater,
        Less,
        EqualEqual,
        Ternary,
        Print,
        Pop,
        GlobalVar,
        GetGlobal,
        SetGlobal,
        GetLocal,
        SetLocal,
        GetUpvalue,
        SetUpvalue,
        Jump,
        JumpIfFalse,
        JumpIfTrue,
        Loop,
        MarkJump,
        Switch,
        CaseCompare,
        SwitchJump,
        Call,
        Invoke,
        Closure,
        CloseUpvalue,
        Class,
        Method,
        DotGet,
        DotSet,
        SqrBracketGet,
        SqrBracketSet,
        Del,
        Table,
        TableItems,
        Array,
        ArrayItems,
        ArrayPush,
        ArrayPop,
        Len,
    ]
};

/// A run in the line table: all bytes from `offset` up to the next run's
/// offset were emitted for `line`.
#[derive(Clone, Copy)]
struct LineRun {
    offset: u32,
    line: u32,
}

/// Append-only bytecode buffer with its constant pools and line runs.
#[derive(Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// Deprecated 8-bit pool, retained for the legacy `OP_CONSTANT`.
    constants: Vec<Value>,
    /// 32-bit pool; everything new lands here.
    constants_long: Vec<Value>,
    lines: Vec<LineRun>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        let offset = self.code.len() as u32;
        self.code.push(byte);
        match self.lines.last() {
            Some(run) if run.line == line => {}
            _ => self.lines.push(LineRun { offset, line }),
        }
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Legacy pool. `None` once the 8-bit index space is exhausted.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if self.constants.len() >= u8::MAX as usize + 1 {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u8)
    }

    pub fn add_long_constant(&mut self, value: Value) -> u32 {
        self.constants_long.push(value);
        (self.constants_long.len() - 1) as u32
    }

    pub fn constant(&self, idx: u8) -> Value {
        self.constants[idx as usize]
    }

    pub fn long_constant(&self, idx: u32) -> Value {
        self.constants_long[idx as usize]
    }

    pub fn constants_len(&self) -> usize {
        self.constants.len() + self.constants_long.len()
    }

    /// Every constant in both pools; the GC traces these.
    pub fn all_constants(&self) -> impl Iterator<Item = Value> + '_ {
        self.constants
            .iter()
            .chain(self.constants_long.iter())
            .copied()
    }

    /// Source line for a bytecode offset: the last run starting at or
    /// before it, scanning from the end.
    pub fn get_line(&self, offset: usize) -> u32 {
        let offset = offset as u32;
        for run in self.lines.iter().rev() {
            if run.offset <= offset {
                return run.line;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0..=OpCode::Len as u8 {
            let op = OpCode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::try_from(OpCode::Len as u8 + 1).is_err());
        assert!(OpCode::try_from(255).is_err());
    }

    #[test]
    fn test_line_runs_collapse() {
        let mut chunk = Chunk::new();
        chunk.write(0, 1);
        chunk.write(1, 1);
        chunk.write(2, 1);
        chunk.write(3, 2);
        chunk.write(4, 5);
        assert_eq!(chunk.get_line(0), 1);
        assert_eq!(chunk.get_line(2), 1);
        assert_eq!(chunk.get_line(3), 2);
        assert_eq!(chunk.get_line(4), 5);
    }

    #[test]
    fn test_lines_monotonic() {
        let mut chunk = Chunk::new();
        for (i, line) in [1, 1, 2, 2, 2, 4, 7, 7].iter().enumerate() {
            chunk.write(i as u8, *line);
        }
        let mut last = 0;
        for offset in 0..chunk.code_len() {
            let line = chunk.get_line(offset);
            assert!(line >= last, "line table went backwards at {offset}");
            last = line;
        }
    }

    #[test]
    fn test_constant_pools() {
        let mut chunk = Chunk::new();
        let short = chunk.add_constant(Value::number(1.0)).unwrap();
        let long = chunk.add_long_constant(Value::number(2.0));
        assert_eq!(chunk.constant(short), Value::number(1.0));
        assert_eq!(chunk.long_constant(long), Value::number(2.0));
        assert_eq!(chunk.constants_len(), 2);
    }

    #[test]
    fn test_legacy_pool_is_bounded() {
        let mut chunk = Chunk::new();
        for i in 0..256 {
            assert!(chunk.add_constant(Value::number(f64::from(i))).is_some());
        }
        assert!(chunk.add_constant(Value::NIL).is_none());
    }
}
