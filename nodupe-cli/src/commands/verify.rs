use std::str::FromStr;

use nodupe_core::verify::{EntryStatus, Verifier};
use nodupe_core::{Catalog, CoreContext, Error, TxnId};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct VerifyArgs {
    /// Transaction id (ULID) or a plan artifact file
    target: String,

    /// Roll back drifted entries from their pre-images
    #[arg(long)]
    fix: bool,
}

pub fn handle_verify(
    context: &CoreContext,
    args: VerifyArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let catalog = super::open_catalog(context)?;
    let snapshot = super::open_snapshot_store(context)?;
    let verifier = Verifier::new(context, &catalog, &snapshot);

    let txn_id = resolve_txn(&catalog, &args.target)?;

    if args.fix {
        let (report, rollback) = verifier.fix(txn_id)?;
        format.print(&(&report, &rollback), || {
            let fixed = rollback.as_ref().map_or(0, |r| r.entries.len());
            format!(
                "transaction {}: {} entries verified, {} drifted entries restored",
                txn_id,
                report.entries.len(),
                fixed
            )
        })?;
        return Ok(0);
    }

    let report = verifier.verify(txn_id)?;
    format.print(&report, || {
        let mut lines = vec![format!(
            "transaction {} ({}):",
            report.txn_id,
            report.txn_state.name()
        )];
        for entry in &report.entries {
            lines.push(format!(
                "  seq {} {} {} -> {}{}",
                entry.seq,
                entry.kind,
                entry.path.display(),
                match entry.status {
                    EntryStatus::Ok => "ok",
                    EntryStatus::Drifted => "drifted",
                    EntryStatus::Unverifiable => "unverifiable",
                },
                entry
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default(),
            ));
        }
        lines.join("\n")
    })?;

    Ok(u8::from(!report.all_ok))
}

/// Accept either a raw transaction id or a plan file whose most recent
/// transaction is meant.
fn resolve_txn(catalog: &impl Catalog, target: &str) -> anyhow::Result<TxnId> {
    if let Ok(txn_id) = TxnId::from_str(target) {
        return Ok(txn_id);
    }

    let path = std::path::Path::new(target);
    if !path.exists() {
        return Err(Error::InvalidInput(format!(
            "{target} is neither a transaction id nor a plan file"
        ))
        .into());
    }
    let json = std::fs::read_to_string(path)?;
    let plan = nodupe_core::planner::artifact::from_json(&json)?;

    let mut txns: Vec<_> = catalog
        .list_txns(None)?
        .into_iter()
        .filter(|t| t.plan_id == plan.plan_id)
        .collect();
    txns.sort_by_key(|t| t.started_at);
    txns.last()
        .map(|t| t.txn_id)
        .ok_or_else(|| {
            Error::InvalidInput(format!("plan {} has no recorded transaction", plan.plan_id))
                .into()
        })
}
