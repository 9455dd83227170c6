use std::path::PathBuf;

use nodupe_core::apply::ApplyExecutor;
use nodupe_core::planner::artifact;
use nodupe_core::snapshot::{NullSnapshotStore, SnapshotBackend};
use nodupe_core::{Catalog, CoreContext, Error};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct ApplyArgs {
    /// Plan artifact produced by `nodupe plan`
    plan_file: PathBuf,

    /// Snapshot and report without mutating anything
    #[arg(long)]
    dry_run: bool,

    /// Apply even when the catalog epoch has moved past the plan's
    #[arg(long)]
    force: bool,
}

pub fn handle_apply(
    context: &CoreContext,
    args: ApplyArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let json = std::fs::read_to_string(&args.plan_file).map_err(|e| {
        Error::InvalidInput(format!("cannot read plan {}: {e}", args.plan_file.display()))
    })?;
    let plan = artifact::from_json(&json)?;

    let catalog = super::open_catalog(context)?;

    let epoch = catalog.epoch()?;
    if epoch != plan.catalog_epoch && !args.force {
        return Err(Error::Drift(format!(
            "plan {} was built at epoch {} but the catalog is at {}; rescan and re-plan, \
             or pass --force",
            plan.plan_id, plan.catalog_epoch, epoch
        ))
        .into());
    }

    let null_store;
    let real_store;
    let snapshot: &dyn SnapshotBackend = if args.dry_run {
        null_store = NullSnapshotStore::new(context.config().snapshot.hash_algorithm);
        &null_store
    } else {
        real_store = super::open_snapshot_store(context)?;
        &real_store
    };

    let executor = ApplyExecutor::new(context, &catalog, snapshot);
    let outcome = executor.apply(&plan, args.dry_run)?;

    format.print(&outcome, || {
        let done = outcome
            .entries
            .iter()
            .filter(|e| e.post_state == nodupe_core::PostState::Done)
            .count();
        let skipped = outcome.entries.len() - done;
        match outcome.txn_id {
            Some(txn_id) => format!(
                "transaction {} committed: {} actions done, {} skipped",
                txn_id, done, skipped
            ),
            None => format!(
                "dry run: {} actions would execute, {} would be skipped",
                done, skipped
            ),
        }
    })?;
    Ok(0)
}
