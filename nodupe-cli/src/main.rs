use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;

use nodupe_cli::commands::*;
use nodupe_cli::config::load_config;
use nodupe_cli::errors;
use nodupe_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "nodupe")]
#[command(about = "Local file-deduplication engine with transactional apply and rollback")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human, global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directory trees into the catalog
    Scan(ScanArgs),
    /// Build a duplicate-resolution plan from the catalog
    Plan(PlanArgs),
    /// Apply a plan as one transaction
    Apply(ApplyArgs),
    /// Verify a transaction against the filesystem
    Verify(VerifyArgs),
    /// Roll a transaction back from its snapshots
    Rollback(RollbackArgs),
    /// Query or cluster the similarity index
    Similarity(SimilarityArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so JSON output stays clean.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(errors::exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = load_config(cli.config.as_deref())?;
    let context = nodupe_core::CoreContext::new(config)?;

    // Ctrl-C cancels the root token; a cancelled scan checkpoints and
    // exits cleanly.
    let cancel = context.cancel_token().clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, shutting down...");
        cancel.cancel();
    }) {
        debug!("Could not install signal handler: {}", e);
    }

    match cli.command {
        Commands::Scan(args) => handle_scan(&context, args, cli.format),
        Commands::Plan(args) => handle_plan(&context, args, cli.format),
        Commands::Apply(args) => handle_apply(&context, args, cli.format),
        Commands::Verify(args) => handle_verify(&context, args, cli.format),
        Commands::Rollback(args) => handle_rollback(&context, args, cli.format),
        Commands::Similarity(args) => handle_similarity(&context, args, cli.format),
    }
}
