use std::str::FromStr;

use nodupe_core::verify::Verifier;
use nodupe_core::{CoreContext, Error, TxnId};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct RollbackArgs {
    /// Transaction id (ULID)
    txn_id: String,

    /// Restore pre-images even over drifted files
    #[arg(long)]
    force: bool,

    /// Roll back only these entry sequence numbers (comma separated)
    #[arg(long, value_name = "SEQS", value_delimiter = ',')]
    only: Vec<u32>,
}

pub fn handle_rollback(
    context: &CoreContext,
    args: RollbackArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let txn_id = TxnId::from_str(&args.txn_id)
        .map_err(|e| Error::InvalidInput(format!("bad transaction id {}: {e}", args.txn_id)))?;

    let catalog = super::open_catalog(context)?;
    let snapshot = super::open_snapshot_store(context)?;
    let verifier = Verifier::new(context, &catalog, &snapshot);

    let scope = if args.only.is_empty() {
        None
    } else {
        Some(args.only.as_slice())
    };
    let report = verifier.rollback(txn_id, scope, args.force)?;

    format.print(&report, || {
        format!(
            "transaction {} -> {}: {} entries processed",
            report.txn_id,
            report.state_after.name(),
            report.entries.len()
        )
    })?;
    Ok(0)
}
