//! Run command - execute Eva source files

use anyhow::{Context, Result};
use colored::Colorize;
use eva_runtime::VM;
use std::fs;
use std::io::{self, Read};

/// Run an Eva source file (or stdin, when `file_path` is `-`).
///
/// Compiles and executes the source, printing the result to stdout. If
/// `disassemble` is set, the compiled bytecode is printed to stdout first
/// and the program is not executed.
pub fn run(file_path: &str, disassemble: bool) -> Result<()> {
    let source = read_source(file_path)?;

    let mut vm = VM::new();
    install_builtins(&mut vm);

    if disassemble {
        let listing = vm
            .disassemble(&source)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("failed to compile {file_path}"))?;
        print!("{listing}");
        return Ok(());
    }

    match vm.exec(&source) {
        Ok(value) => {
            println!("{value}");
            Ok(())
        }
        Err(err) => {
            eprintln!("{}: {err}", "error".red().bold());
            Err(anyhow::anyhow!("failed to execute {file_path}"))
        }
    }
}

fn read_source(file_path: &str) -> Result<String> {
    if file_path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("failed to read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(file_path).with_context(|| format!("failed to read source file: {file_path}"))
}

/// Host-provided native functions — the core is I/O-free (`eva_runtime`'s
/// `no I/O` boundary), so `print` lives here, installed before every run.
pub fn install_builtins(vm: &mut VM) {
    vm.globals().borrow_mut().add_native_function("print", 1, |args| {
        println!("{}", args[0]);
        Ok(args[0].clone())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn runs_a_simple_expression() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "(+ 1 2)").unwrap();
        assert!(run(file.path().to_str().unwrap(), false).is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(run("does-not-exist.eva", false).is_err());
    }

    #[test]
    fn undefined_symbol_is_an_error_not_a_panic() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "undefined_name").unwrap();
        assert!(run(file.path().to_str().unwrap(), false).is_err());
    }

    #[test]
    fn disassemble_flag_does_not_execute() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "(/ 1 0)").unwrap();
        // Division by zero wouldn't error if executed (IEEE-754 Infinity);
        // this just confirms the disassemble path doesn't itself fail.
        assert!(run(file.path().to_str().unwrap(), true).is_ok());
    }
}
