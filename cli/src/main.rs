//! brood CLI binary
//!
//! Starts programs with explicit descriptor mappings and reports how they end.

use brood_cli::{launch_file, run_program};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "brood")]
#[command(about = "Spawn child processes with explicit descriptor mappings")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one program and exit with its exit code
    Run {
        /// Descriptor mapping, SRC:DST or FD (repeatable)
        #[arg(long = "map", value_name = "SRC:DST")]
        maps: Vec<String>,
        /// Keep stdin, stdout and stderr
        #[arg(long)]
        inherit_stdio: bool,
        /// Program to execute
        program: String,
        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Start every process listed in a launch file and wait for them
    Launch {
        /// Path to a TOML launch file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = brood_core::utils::init_tracing(&cli.log_level) {
        eprintln!("{}", e);
    }

    let result = match &cli.command {
        Commands::Run {
            maps,
            inherit_stdio,
            program,
            args,
        } => run_program(program, args, maps, *inherit_stdio),
        Commands::Launch { config } => launch_file(config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Command failed: {} ({})", e, e.code());
            std::process::exit(1);
        }
    }
}
