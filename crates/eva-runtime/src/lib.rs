//! Eva Runtime - Core language implementation
//!
//! This library provides the complete Eva bytecode engine: a minimal
//! s-expression reader, the free-variable/closure-capture analysis, the
//! single-pass compiler, the stack-based virtual machine, and a pure
//! disassembler. No I/O, no CLI, no concurrency — `eva-cli` is the thin
//! driver built on top of [`VM`].

/// Eva runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod analysis;
pub mod bytecode;
pub mod code;
pub mod compiler;
pub mod disasm;
pub mod error;
pub mod expr;
pub mod global;
pub mod reader;
pub mod value;
pub mod vm;

pub use bytecode::{CompareOp, Opcode};
pub use code::CodeObject;
pub use compiler::Compiler;
pub use disasm::disassemble;
pub use error::EvaError;
pub use expr::Expr;
pub use global::Global;
pub use reader::{read_one, read_program};
pub use value::{ClassObject, EvaValue, FunctionObject, InstanceObject, NativeFunction};
pub use vm::Vm;

use std::cell::RefCell;
use std::rc::Rc;

/// Host-facing entry point: `VM::new()`, `VM::exec(source) → EvaValue`,
/// `VM::globals` for installing host functions/constants before a program
/// runs. Owns one [`Global`] table and
/// one [`Vm`], so repeated `exec` calls (a REPL's successive lines) see each
/// other's global definitions.
pub struct VM {
    global: Rc<RefCell<Global>>,
    vm: Vm,
}

impl VM {
    /// A fresh instance with an empty global table — no built-in natives are
    /// installed here, since the core is I/O-free; a host (`eva-cli`, a
    /// test) installs whatever it needs via [`VM::globals`].
    pub fn new() -> Self {
        let global = Rc::new(RefCell::new(Global::new()));
        let vm = Vm::new(global.clone());
        VM { global, vm }
    }

    /// Parse, compile, and run `source` to completion, returning the value
    /// left by its `HALT`. Globals defined by a previous `exec` call on this
    /// same instance remain visible (this is what lets a REPL build up state
    /// line by line).
    pub fn exec(&mut self, source: &str) -> Result<EvaValue, EvaError> {
        let program = read_program(source)?;
        let code = Compiler::compile(&program, self.global.clone())?;
        self.vm.exec(Rc::new(code))
    }

    /// Compile `source` and return its disassembly without executing it.
    pub fn disassemble(&self, source: &str) -> Result<String, EvaError> {
        let program = read_program(source)?;
        let code = Compiler::compile(&program, self.global.clone())?;
        Ok(disasm::disassemble(&code))
    }

    /// Mutable access to the global table, for installing host functions or
    /// constants before the first [`VM::exec`] call.
    pub fn globals(&self) -> &Rc<RefCell<Global>> {
        &self.global
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_test_executes_a_program() {
        let mut vm = VM::new();
        let result = vm.exec("(+ 1 2)").unwrap();
        assert_eq!(result.as_number().unwrap(), 3.0);
    }

    #[test]
    fn globals_persist_across_exec_calls() {
        let mut vm = VM::new();
        vm.exec("(var x 10)").unwrap();
        let result = vm.exec("(+ x 5)").unwrap();
        assert_eq!(result.as_number().unwrap(), 15.0);
    }

    #[test]
    fn host_can_install_a_native_function_before_exec() {
        let mut vm = VM::new();
        vm.globals()
            .borrow_mut()
            .add_native_function("double", 1, |args| Ok(EvaValue::Number(args[0].as_number()? * 2.0)));
        let result = vm.exec("(double 21)").unwrap();
        assert_eq!(result.as_number().unwrap(), 42.0);
    }
}
