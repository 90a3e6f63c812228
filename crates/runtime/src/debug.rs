//! Bytecode disassembler, driven by the CLI's `--disassemble` flag.
//!
//! Grounded directly in `debug.c`'s `disassembleInstruction`: one line per
//! instruction, `%04d` offset, the source line (or `|` when it repeats the
//! previous instruction's line), mnemonic, and operand(s).

use pd_core::{Chunk, Heap, OpCode, PointeeTag};
use std::fmt::Write as _;

pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
    }
    out
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        let _ = writeln!(out, "unknown opcode {byte}");
        return offset + 1;
    };

    match op {
        OpCode::ConstantInt
        | OpCode::ConstantDouble
        | OpCode::ConstantBool
        | OpCode::ConstantCharacter
        | OpCode::ConstantString => constant_instruction(&format!("{op:?}"), chunk, offset, heap, out),
        OpCode::GlobalDefine | OpCode::GlobalSet | OpCode::GlobalGet | OpCode::StructGet | OpCode::StructSet => {
            constant_instruction(&format!("{op:?}"), chunk, offset, heap, out)
        }
        OpCode::ObjectCast | OpCode::ObjectCastPtr => constant_instruction(&format!("{op:?}"), chunk, offset, heap, out),
        OpCode::LocalGet | OpCode::LocalSet | OpCode::Call => byte_instruction(&format!("{op:?}"), chunk, offset, out),
        OpCode::PointerCast => {
            let tag_byte = chunk.code[offset + 1];
            let tag = PointeeTag::from_u8(tag_byte).map(|t| t.to_string()).unwrap_or_else(|| "?".into());
            let _ = writeln!(out, "{:<20} {tag}", "PointerCast");
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => jump_instruction(&format!("{op:?}"), 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("Loop", -1, chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{op:?}");
            offset + 1
        }
    }
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{name:<20} {slot:4}");
    offset + 2
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let value = &chunk.constants[index as usize];
    let _ = writeln!(out, "{name:<20} {index:4} '{}'", crate::value_display::display(value, heap));
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i64 + 3 + sign as i64 * jump as i64;
    let _ = writeln!(out, "{name:<20} {offset:4} -> {target}");
    offset + 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::Value;

    #[test]
    fn disassembles_constant_and_return() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Integer(7)).unwrap();
        chunk.write_op(OpCode::ConstantInt, 1);
        chunk.write_byte(idx, 1);
        chunk.write_op(OpCode::Return, 1);
        let heap = Heap::new();
        let out = disassemble_chunk(&chunk, "test", &heap);
        assert!(out.contains("== test =="));
        assert!(out.contains("ConstantInt"));
        assert!(out.contains("Return"));
    }
}
