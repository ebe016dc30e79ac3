//! Thin CLI driver around `eva_runtime::VM`. Owns no language semantics.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "eva", version, about = "Eva bytecode VM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run an Eva source file (use `-` to read from stdin)
    Run {
        file: String,
        /// Print the compiled bytecode instead of running it
        #[arg(long)]
        disassemble: bool,
    },
    /// Start an interactive line-oriented REPL
    Repl,
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { file, disassemble } => commands::run::run(&file, disassemble),
        Command::Repl => commands::repl::run(),
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
