//! disasm.rs — Désassembleur lisible.
//!
//! Une ligne par instruction : `offset  ligne  MNEMONIQUE opérandes`, avec
//! les constantes résolues et les cibles de saut calculées. Utilisé par le
//! drapeau `--disasm` du binaire et par la trace d'exécution de la VM.

use std::fmt::Write as _;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::op::Op;
use crate::heap::Heap;
use crate::value::format_value;

/// Désassemble tout le chunk sous un titre.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
        out.push('\n');
    }
    out
}

/// Désassemble l'instruction à `offset` dans `out` et renvoie l'offset de
/// la suivante.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    let line = chunk.get_line(offset);
    if offset > 0 && line == chunk.get_line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = Op::from_byte(byte) else {
        let _ = write!(out, "opcode inconnu {byte}");
        return offset + 1;
    };

    match op {
        Op::Constant
        | Op::GetGlobal
        | Op::DefineGlobal
        | Op::SetGlobal
        | Op::GetProperty
        | Op::SetProperty
        | Op::Class
        | Op::Method => constant_instruction(heap, chunk, op, offset, out),
        Op::ConstantLong => {
            let index = read_u24(chunk, offset + 1);
            let _ = write!(out, "{:<16} {index:8} '{}'", op.mnemonic(), constant_text(heap, chunk, index));
            offset + 4
        }
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            let slot = chunk.code[offset + 1];
            let _ = write!(out, "{:<16} {slot:8}", op.mnemonic());
            offset + 2
        }
        Op::Invoke => {
            let index = usize::from(chunk.code[offset + 1]);
            let argc = chunk.code[offset + 2];
            let _ = write!(
                out,
                "{:<16} ({argc} args) {index:4} '{}'",
                op.mnemonic(),
                constant_text(heap, chunk, index)
            );
            offset + 3
        }
        Op::Jump | Op::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        Op::Loop => jump_instruction(chunk, op, -1, offset, out),
        Op::Closure => {
            let index = usize::from(chunk.code[offset + 1]);
            let _ = write!(out, "{:<16} {index:8} {}", op.mnemonic(), constant_text(heap, chunk, index));
            let mut next = offset + 2;
            let upvalue_count = match chunk.constants.get(index) {
                Some(&crate::value::Value::Obj(r)) => heap.function(r).upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let idx = chunk.code[next + 1];
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                let _ = write!(out, "\n{:04}    |   {kind} {idx}", next);
                next += 2;
            }
            next
        }
        _ => {
            let _ = write!(out, "{}", op.mnemonic());
            offset + 1
        }
    }
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, op: Op, offset: usize, out: &mut String) -> usize {
    let index = usize::from(chunk.code[offset + 1]);
    let _ = write!(out, "{:<16} {index:8} '{}'", op.mnemonic(), constant_text(heap, chunk, index));
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: Op, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = i64::from(u16::from(chunk.code[offset + 1]) << 8 | u16::from(chunk.code[offset + 2]));
    let target = offset as i64 + 3 + sign * jump;
    let _ = write!(out, "{:<16} {offset:8} -> {target}", op.mnemonic());
    offset + 3
}

fn read_u24(chunk: &Chunk, offset: usize) -> usize {
    usize::from(chunk.code[offset])
        | usize::from(chunk.code[offset + 1]) << 8
        | usize::from(chunk.code[offset + 2]) << 16
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(&v) => format_value(heap, v),
        None => "<invalide>".to_string(),
    }
}
