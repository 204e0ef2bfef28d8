// Veld Bytecode Chunk
// Bytecode, line table and constants pool for one function.

use super::opcode::OpCode;
use crate::vm::heap::Heap;
use crate::vm::value::Value;

/// A chunk of compiled bytecode.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Raw bytecode.
    pub code: Vec<u8>,
    /// Constants pool; entries are runtime values (numbers, interned
    /// strings, function objects).
    pub constants: Vec<Value>,
    /// Source line for each byte, for error reporting.
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op as u8, line);
    }

    /// Write a u16 operand (big-endian).
    pub fn write_u16(&mut self, value: u16, line: usize) {
        self.write((value >> 8) as u8, line);
        self.write((value & 0xFF) as u8, line);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Patch a forward jump emitted earlier at `offset` to land here.
    pub fn patch_jump(&mut self, offset: usize) {
        let jump = self.code.len() - offset - 2;
        self.code[offset] = (jump >> 8) as u8;
        self.code[offset + 1] = (jump & 0xFF) as u8;
    }

    /// Drop everything from `offset` on (constant-folding rewrites).
    pub fn truncate(&mut self, offset: usize) {
        self.code.truncate(offset);
        self.lines.truncate(offset);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Disassemble the chunk for debugging (`veld -d asm`).
    pub fn disassemble(&self, name: &str, heap: &Heap) {
        println!("--- {} ---", name);
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(offset, heap);
        }
        println!();

        // Nested functions live in the constants pool.
        for constant in &self.constants {
            if let Value::Obj(handle) = constant {
                if let Some(function) = heap.try_function(*handle) {
                    let label = format!("<fn {}>", heap.function_name(*handle));
                    function.chunk.disassemble(&label, heap);
                }
            }
        }
    }

    fn format_constant(&self, index: usize, heap: &Heap) -> String {
        match self.constants.get(index) {
            Some(value) => heap.value_repr(*value),
            None => format!("???[{}]", index),
        }
    }

    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> usize {
        if offset > 0 && self.line_at(offset) == self.line_at(offset - 1) {
            print!("{:04}      ", offset);
        } else {
            print!("{:04} {:4} ", offset, self.line_at(offset));
        }

        let op = OpCode::from(self.code[offset]);
        match op {
            OpCode::Constant
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::ImportModule => {
                let index = self.read_u16(offset + 1) as usize;
                println!("{:<16}{}", op_name(op), self.format_constant(index, heap));
                offset + 3
            }
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::CloseFile
            | OpCode::UnpackList => {
                println!("{:<16}[{}]", op_name(op), self.code[offset + 1]);
                offset + 2
            }
            OpCode::Call => {
                println!("{:<16}({})", op_name(op), self.code[offset + 1]);
                offset + 2
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfNil => {
                let jump = self.read_u16(offset + 1) as usize;
                println!("{:<16}@{}", op_name(op), offset + 3 + jump);
                offset + 3
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1) as usize;
                println!("{:<16}@{}", op_name(op), offset + 3 - jump);
                offset + 3
            }
            OpCode::NewList | OpCode::NewDict => {
                println!("{:<16}{}", op_name(op), self.read_u16(offset + 1));
                offset + 3
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let index = self.read_u16(offset + 1) as usize;
                let argc = self.code[offset + 3];
                println!(
                    "{:<16}{} ({})",
                    op_name(op),
                    self.format_constant(index, heap),
                    argc
                );
                offset + 4
            }
            OpCode::Class | OpCode::Method | OpCode::ClassVar => {
                let index = self.read_u16(offset + 1) as usize;
                let flag = self.code[offset + 3];
                println!(
                    "{:<16}{} #{}",
                    op_name(op),
                    self.format_constant(index, heap),
                    flag
                );
                offset + 4
            }
            OpCode::Closure => {
                let index = self.read_u16(offset + 1) as usize;
                let mut next = offset + 3;
                println!("{:<16}{}", op_name(op), self.format_constant(index, heap));
                if let Some(Value::Obj(handle)) = self.constants.get(index) {
                    if let Some(function) = heap.try_function(*handle) {
                        for _ in 0..function.upvalue_count {
                            let is_local = self.code[next] == 1;
                            let slot = self.code[next + 1];
                            println!(
                                "{:04}      |  {} {}",
                                next,
                                if is_local { "local" } else { "upvalue" },
                                slot
                            );
                            next += 2;
                        }
                    }
                }
                next
            }
            _ => {
                println!("{}", op_name(op));
                offset + 1 + op.operand_bytes()
            }
        }
    }
}

fn op_name(op: OpCode) -> String {
    format!("{:?}", op).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_jump_writes_relative_offset() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        let jump = chunk.current_offset();
        chunk.write_u16(0xFFFF, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.patch_jump(jump);
        assert_eq!(chunk.read_u16(jump), 2);
    }

    #[test]
    fn lines_track_every_byte() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Constant, 3);
        chunk.write_u16(0, 3);
        chunk.write_op(OpCode::Return, 4);
        assert_eq!(chunk.line_at(0), 3);
        assert_eq!(chunk.line_at(3), 4);
    }
}
