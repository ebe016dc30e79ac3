//! CLI subcommand implementations.

pub mod repl;
pub mod run;
