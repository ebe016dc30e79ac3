//! REPL command - line-oriented interactive session
//!
//! Persists one [`VM`] (and therefore one global table) across lines, so a
//! `(def ...)` or `(var ...)` on one line is visible to the next — state
//! persists across calls the same way one `eval_line` call's effects stay
//! visible to the next.

use anyhow::Result;
use colored::Colorize;
use eva_runtime::VM;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

use crate::commands::run::install_builtins;

const PROMPT: &str = "eva> ";

/// Run an interactive REPL on stdin/stdout until EOF or `:quit`.
pub fn run() -> Result<()> {
    let mut vm = VM::new();
    install_builtins(&mut vm);

    let mut editor = DefaultEditor::new()?;
    let history_path = history_file();
    let _ = editor.load_history(&history_path);

    println!("Eva {} — type :quit or Ctrl-D to exit", eva_runtime::VERSION);

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if line == ":quit" || line == ":q" {
                    break;
                }
                match vm.exec(line) {
                    Ok(value) => println!("{value}"),
                    Err(err) => eprintln!("{}: {err}", "error".red().bold()),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{}: {err}", "error".red().bold());
                break;
            }
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = editor.save_history(&history_path);
    Ok(())
}

/// `dirs::data_dir()/eva/history`, falling back to `./.eva_history` when no
/// platform data directory is available.
fn history_file() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("eva").join("history"))
        .unwrap_or_else(|| PathBuf::from(".eva_history"))
}
