//! Bytecode disassembler.
//!
//! A pure function from a [`CodeObject`] to a human-readable listing: no I/O,
//! so `eva-cli`'s `--disassemble` flag (and any test) can just print the
//! returned `String`.

use crate::bytecode::{CompareOp, Opcode};
use crate::code::CodeObject;
use crate::value::EvaValue;
use std::fmt::Write as _;

/// Render `code`'s instruction stream as `OFFSET  MNEMONIC  operand  ; comment`
/// lines, one code object at a time (nested function/method/class bodies are
/// listed separately, after the unit that references them).
pub fn disassemble(code: &CodeObject) -> String {
    let mut out = String::new();
    let mut nested = Vec::new();
    disassemble_into(code, &mut out, &mut nested);
    for n in nested {
        out.push('\n');
        disassemble(&n).lines().for_each(|l| {
            out.push_str(l);
            out.push('\n');
        });
    }
    out
}

fn disassemble_into<'a>(code: &'a CodeObject, out: &mut String, nested: &mut Vec<&'a CodeObject>) {
    let _ = writeln!(out, "== {} (arity {}) ==", code.name, code.arity);
    let mut offset = 0usize;
    while offset < code.code.len() {
        offset = disassemble_instruction(code, offset, out, nested);
    }
}

fn disassemble_instruction<'a>(code: &'a CodeObject, offset: usize, out: &mut String, nested: &mut Vec<&'a CodeObject>) -> usize {
    let byte = code.code[offset];
    let Ok(opcode) = Opcode::try_from(byte) else {
        let _ = writeln!(out, "{offset:04}  <unknown 0x{byte:02x}>");
        return offset + 1;
    };

    match opcode {
        Opcode::Jmp | Opcode::JmpIfFalse => {
            let addr = u16::from_be_bytes([code.code[offset + 1], code.code[offset + 2]]);
            let _ = writeln!(out, "{offset:04}  {:<18}{addr:04}", opcode.mnemonic());
            offset + 3
        }
        Opcode::Compare => {
            let op_byte = code.code[offset + 1];
            let label = CompareOp::try_from(op_byte).map(CompareOp::symbol).unwrap_or("?");
            let _ = writeln!(out, "{offset:04}  {:<18}{op_byte} ; {label}", opcode.mnemonic());
            offset + 2
        }
        Opcode::Const => {
            let idx = code.code[offset + 1];
            let annotation = code
                .constants
                .get(idx as usize)
                .map(describe_const)
                .unwrap_or_else(|| "?".to_string());
            if let Some(EvaValue::Code(inner)) = code.constants.get(idx as usize) {
                nested.push(inner);
            }
            let _ = writeln!(out, "{offset:04}  {:<18}{idx} ; {annotation}", opcode.mnemonic());
            offset + 2
        }
        Opcode::Halt | Opcode::Pop | Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Return | Opcode::MakeFunction => {
            let _ = writeln!(out, "{offset:04}  {}", opcode.mnemonic());
            offset + 1
        }
        _ => {
            let operand = code.code[offset + 1];
            let annotation = match opcode {
                Opcode::GetCell | Opcode::SetCell | Opcode::MakeCell | Opcode::GetFree => {
                    code.cell_names.get(operand as usize).cloned().unwrap_or_default()
                }
                Opcode::GetLocal | Opcode::SetLocal => code
                    .locals
                    .get(operand as usize)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                _ => String::new(),
            };
            if annotation.is_empty() {
                let _ = writeln!(out, "{offset:04}  {:<18}{operand}", opcode.mnemonic());
            } else {
                let _ = writeln!(out, "{offset:04}  {:<18}{operand} ; {annotation}", opcode.mnemonic());
            }
            offset + 2
        }
    }
}

fn describe_const(value: &EvaValue) -> String {
    match value {
        EvaValue::Code(c) => format!("<code {}>", c.name),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::global::Global;
    use crate::reader::read_program;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn compile(src: &str) -> CodeObject {
        let global = Rc::new(RefCell::new(Global::new()));
        let program = read_program(src).unwrap();
        Compiler::compile(&program, global).unwrap()
    }

    #[test]
    fn disassembles_a_constant_and_halt() {
        let code = compile("42");
        let text = disassemble(&code);
        assert!(text.contains("OP_CONST"));
        assert!(text.contains("OP_HALT"));
    }

    #[test]
    fn lists_nested_function_code_objects() {
        let code = compile("(def square (x) (* x x))");
        let text = disassemble(&code);
        assert!(text.contains("== main"));
        assert!(text.contains("== square"));
    }

    #[test]
    fn annotates_jump_targets_and_compare_operators() {
        let code = compile("(if (> 1 2) 1 0)");
        let text = disassemble(&code);
        assert!(text.contains("OP_JMP_IF_FALSE"));
        assert!(text.contains("OP_COMPARE"));
        assert!(text.contains(">"));
    }
}
