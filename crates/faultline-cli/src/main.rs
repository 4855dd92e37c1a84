//! faultline command line.
//!
//! Runs a cluster of real node binaries and their clients under the
//! deterministic fault-injection harness.
//!
//! # Quick Start
//!
//! ```bash
//! # Explore with random decisions, recording the trace
//! faultline run --config faultline.toml --seed 7
//!
//! # Replay a recorded run decision for decision
//! faultline run --config faultline.toml --mode replay --trace trace_7
//!
//! # Inspect the coverage gathered by visited mode
//! faultline coverage visited.trie --window 10
//! ```

mod commands;
mod style;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// faultline - deterministic fault injection for distributed systems.
#[derive(Parser)]
#[command(name = "faultline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run the harness against a cluster. Exits with the harness exit code.
    Run(commands::run::RunArgs),

    /// Show the configuration a run would use.
    Config {
        /// Configuration file layered over the project files.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (text, toml).
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a visited-mode coverage file.
    Coverage {
        /// Path to the coverage file.
        path: PathBuf,

        /// Decision window the file was recorded with.
        #[arg(short, long, default_value = "10")]
        window: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    style::set_no_color(cli.no_color);

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Run(args) => {
            let code = commands::run::run(&args);
            std::process::exit(code);
        }
        Commands::Config { config, format } => commands::config::show(config.as_deref(), &format),
        Commands::Coverage { path, window } => commands::coverage::run(&path, window),
    }
}
