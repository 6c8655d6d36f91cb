//! Bytecode disassembler
//!
//! Renders chunks in a human-readable listing for the `print-code` and
//! `trace-execution` debug features and for tooling.

use std::fmt::Write;

use super::{Chunk, OpCode};
use crate::memory::Heap;
use crate::value::Value;

/// Disassemble a whole chunk under a header line
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    writeln!(out, "== {} ==", name).unwrap();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = instruction_at(chunk, offset, heap);
        writeln!(out, "{}", line).unwrap();
        offset = next;
    }
    out
}

/// Disassemble the single instruction at `offset`
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> String {
    instruction_at(chunk, offset, heap).0
}

fn instruction_at(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.line_for(offset) == chunk.line_for(offset - 1) {
        text.push_str("   | ");
    } else {
        write!(text, "{:4} ", chunk.line_for(offset)).unwrap();
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(_) => {
            write!(text, "<unknown opcode {}>", byte).unwrap();
            return (text, offset + 1);
        }
    };

    match op {
        // No operands
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return => {
            write!(text, "{:?}", op).unwrap();
            (text, offset + 1)
        }

        // One byte operand: a stack slot, upvalue index, or argument count
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            write!(text, "{:?} {}", op, operand).unwrap();
            (text, offset + 2)
        }

        // One constant operand
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Class
        | OpCode::Method => {
            let constant = chunk.code[offset + 1];
            write!(
                text,
                "{:?} {} '{}'",
                op,
                constant,
                constant_text(chunk, constant, heap)
            )
            .unwrap();
            (text, offset + 2)
        }

        // Constant operand plus argument count
        OpCode::Invoke => {
            let constant = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            write!(
                text,
                "{:?} {} '{}' ({} args)",
                op,
                constant,
                constant_text(chunk, constant, heap),
                arg_count
            )
            .unwrap();
            (text, offset + 3)
        }

        // 16-bit jump offsets, shown with their resolved targets
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = read_u16(chunk, offset + 1) as usize;
            write!(text, "{:?} {} -> {}", op, jump, offset + 3 + jump).unwrap();
            (text, offset + 3)
        }
        OpCode::Loop => {
            let jump = read_u16(chunk, offset + 1) as usize;
            write!(text, "{:?} {} -> {}", op, jump, offset + 3 - jump).unwrap();
            (text, offset + 3)
        }

        // Constant operand followed by (is_local, index) descriptor pairs
        OpCode::Closure => {
            let constant = chunk.code[offset + 1];
            write!(
                text,
                "{:?} {} '{}'",
                op,
                constant,
                constant_text(chunk, constant, heap)
            )
            .unwrap();
            let mut next = offset + 2;
            if let Some(Value::Obj(function)) = chunk.constants.get(constant as usize) {
                for _ in 0..heap.function(*function).upvalue_count {
                    let is_local = chunk.code[next] == 1;
                    let index = chunk.code[next + 1];
                    write!(
                        text,
                        "\n{:04}    |   {} {}",
                        next,
                        if is_local { "local" } else { "upvalue" },
                        index
                    )
                    .unwrap();
                    next += 2;
                }
            }
            (text, next)
        }
    }
}

fn constant_text(chunk: &Chunk, index: u8, heap: &Heap) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => value.display(heap),
        None => "<bad constant>".to_string(),
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}
