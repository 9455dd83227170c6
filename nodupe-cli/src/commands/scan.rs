use std::path::PathBuf;

use nodupe_core::config::MediaProfile;
use nodupe_core::scan::{ScanOptions, ScanOrchestrator};
use nodupe_core::walker::WalkerOptions;
use nodupe_core::{CoreContext, Error};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct ScanArgs {
    /// Root paths to scan
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Media profile controlling parallelism: ssd, hdd, network, auto
    #[arg(long, value_name = "PROFILE")]
    media_profile: Option<String>,

    /// Resume from the last checkpoint
    #[arg(long)]
    resume: bool,

    /// Compute perceptual embeddings for matching files
    #[arg(long)]
    embed: bool,

    /// Hasher worker count (overrides the media profile)
    #[arg(long, value_name = "N")]
    workers: Option<u16>,

    /// Ignore glob, matched against relative paths (repeatable)
    #[arg(long = "ignore", value_name = "GLOB")]
    ignore: Vec<String>,

    /// Follow symbolic links while walking
    #[arg(long)]
    follow_symlinks: bool,

    /// Descend into directories on other devices
    #[arg(long)]
    cross_device: bool,
}

pub fn handle_scan(
    context: &CoreContext,
    args: ScanArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let media_profile_override = args
        .media_profile
        .as_deref()
        .map(|name| {
            MediaProfile::from_name(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown media profile: {name}")))
        })
        .transpose()?;

    let catalog = super::open_catalog(context)?;
    let orchestrator = ScanOrchestrator::new(context, &catalog);

    let outcome = orchestrator.scan(&ScanOptions {
        roots: args.roots,
        walker: WalkerOptions {
            ignore: args.ignore,
            follow_symlinks: args.follow_symlinks,
            cross_device: args.cross_device,
        },
        resume: args.resume,
        embed: args.embed,
        workers_override: args.workers,
        media_profile_override,
    })?;

    format.print(&outcome, || {
        let mut text = format!(
            "scan epoch {}: {} files visited, {} committed, {} full hashes, {} bytes hashed ({})",
            outcome.epoch,
            outcome.visited,
            outcome.committed,
            outcome.full_hashed,
            outcome.bytes_hashed,
            outcome.hash_algo.name(),
        );
        if outcome.entry_errors > 0 {
            text.push_str(&format!("\n{} entries had errors", outcome.entry_errors));
        }
        if outcome.cancelled {
            text.push_str("\ncancelled; progress checkpointed, rerun with --resume");
        }
        text
    })?;

    // A clean cancellation still exits 0.
    Ok(0)
}
