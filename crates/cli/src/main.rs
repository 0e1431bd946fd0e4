mod commands;
mod run_file;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// StateTree library validator and runner.
#[derive(Parser)]
#[command(name = "statetree", version, about = "StateTree library validator and runner")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log engine activity (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every tree of a JSON library and report its size
    Validate {
        /// Path to the library JSON file
        library: PathBuf,
    },

    /// Run a tree for a number of ticks
    Run {
        /// Path to the library JSON file
        library: PathBuf,
        /// Tree to run (default: the first tree of the library)
        #[arg(long)]
        tree: Option<String>,
        /// TOML run file with execution flags, parameters and scripted events
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of ticks to run
        #[arg(long)]
        ticks: Option<u32>,
        /// Delta time per tick, in seconds
        #[arg(long)]
        dt: Option<f32>,
        /// Seed for delayed transition variance
        #[arg(long)]
        seed: Option<u64>,
        /// Event to send before a tick, as TICK:TAG (repeatable)
        #[arg(long = "event", value_name = "TICK:TAG")]
        events: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Validate { library } => {
            commands::validate::cmd_validate(&library, cli.output, cli.quiet);
        }
        Commands::Run {
            library,
            tree,
            config,
            ticks,
            dt,
            seed,
            events,
        } => {
            let options = commands::run::RunOptions {
                library: &library,
                tree: tree.as_deref(),
                config: config.as_deref(),
                ticks,
                dt,
                seed,
                events: &events,
                output: cli.output,
                quiet: cli.quiet,
            };
            commands::run::cmd_run(options);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

/// Reports `msg` and exits with status 1.
pub(crate) fn fail(msg: &str, output: OutputFormat, quiet: bool) -> ! {
    report_error(msg, output, quiet);
    process::exit(1);
}
