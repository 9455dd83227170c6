//! Two-phase plan executor.
//!
//! Every apply is one transaction: a prelude streams each victim's
//! pre-image into the snapshot store and appends a log entry *before* the
//! filesystem is touched, then mutations run in plan order, then the
//! transaction commits. Any non-ignorable error stops the run and leaves
//! the transaction `partial` with enough log to roll back what happened.
//!
//! Per-action state machine:
//!
//! ```text
//!     pending ── snapshot_ok ──▶ ready ── mutate_ok ──▶ done
//!         │                         │
//!         └──▶ snapshot_failed      └──▶ mutate_failed
//! ```

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::OnMissing;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::snapshot::SnapshotBackend;
use crate::types::{
    Action, LinkKind, Plan, PostState, SnapshotMeta, TxnEntry, TxnId, TxnState,
};

/// Per-entry result surfaced to the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub seq: u32,
    pub kind: &'static str,
    pub path: std::path::PathBuf,
    pub pre_image_ref: Option<String>,
    pub post_state: PostState,
    pub error: Option<String>,
}

/// Result of one apply run. `txn_id` is absent for dry runs.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub txn_id: Option<TxnId>,
    pub state: Option<TxnState>,
    pub dry_run: bool,
    pub entries: Vec<EntryOutcome>,
}

/// Executes a plan as a single transaction with at-most-once semantics
/// per action.
pub struct ApplyExecutor<'a> {
    context: &'a CoreContext,
    catalog: &'a dyn Catalog,
    snapshot: &'a dyn SnapshotBackend,
}

impl<'a> ApplyExecutor<'a> {
    pub fn new(
        context: &'a CoreContext,
        catalog: &'a dyn Catalog,
        snapshot: &'a dyn SnapshotBackend,
    ) -> Self {
        Self {
            context,
            catalog,
            snapshot,
        }
    }

    /// Apply a plan. With `dry_run` the prelude runs against whatever
    /// snapshot backend was supplied (a null store, normally) and nothing
    /// is mutated or logged.
    pub fn apply(&self, plan: &Plan, dry_run: bool) -> Result<ApplyOutcome> {
        let _guard = self.context.mutation_guard();
        let cancel = self.context.child_token();

        let catalog_epoch = self.catalog.epoch()?;
        if catalog_epoch != plan.catalog_epoch {
            warn!(
                "Plan {} was built at epoch {}, catalog is at {}; targets may have drifted",
                plan.plan_id, plan.catalog_epoch, catalog_epoch
            );
        }

        // A committed transaction is never re-run.
        for txn in self.catalog.list_txns(Some(TxnState::Committed))? {
            if txn.plan_id == plan.plan_id {
                return Err(Error::InvalidInput(format!(
                    "plan {} was already applied by transaction {}",
                    plan.plan_id, txn.txn_id
                )));
            }
        }

        if dry_run {
            return self.dry_run(plan, &cancel);
        }

        let txn_id = self.catalog.begin_txn(plan.plan_id)?;
        info!(
            "Applying plan {} as transaction {} ({} actions)",
            plan.plan_id,
            txn_id,
            plan.actions.len()
        );

        let mut entries: Vec<EntryOutcome> = Vec::with_capacity(plan.actions.len());

        // Prelude: snapshot every victim before touching anything.
        for plan_action in &plan.actions {
            if cancel.is_cancelled() {
                return self.finish_partial(txn_id, "cancelled during prelude");
            }
            match self.prelude_entry(txn_id, plan_action.seq, &plan_action.action) {
                Ok(outcome) => entries.push(outcome),
                Err(e) => {
                    warn!("Snapshot prelude failed for seq {}: {}", plan_action.seq, e);
                    return self.finish_partial(txn_id, &format!("snapshot failed: {e}"));
                }
            }
        }

        // Mutate in seq order; entries already carry their pre-image refs.
        for i in 0..entries.len() {
            if entries[i].post_state == PostState::Skipped {
                continue;
            }
            let seq = entries[i].seq;

            if cancel.is_cancelled() {
                self.catalog.set_txn_entry_state(
                    txn_id,
                    seq,
                    PostState::Failed,
                    Some("cancelled".into()),
                )?;
                return self.finish_partial(txn_id, "cancelled during mutation");
            }

            let action = plan
                .actions
                .iter()
                .find(|a| a.seq == seq)
                .map(|a| &a.action)
                .ok_or_else(|| Error::Internal("entry without plan action".into()))?;

            match self.mutate(action) {
                Ok(()) => {
                    entries[i].post_state = PostState::Done;
                    self.catalog
                        .set_txn_entry_state(txn_id, seq, PostState::Done, None)?;
                }
                Err(Error::NotFound(path))
                    if self.context.config().apply.policy_on_missing == OnMissing::Ignore =>
                {
                    debug!("Ignoring missing target {}", path.display());
                    entries[i].post_state = PostState::Skipped;
                    entries[i].error = Some("not_found".into());
                    self.catalog.set_txn_entry_state(
                        txn_id,
                        seq,
                        PostState::Skipped,
                        Some("not_found".into()),
                    )?;
                }
                Err(e) => {
                    entries[i].post_state = PostState::Failed;
                    entries[i].error = Some(e.to_string());
                    self.catalog.set_txn_entry_state(
                        txn_id,
                        seq,
                        PostState::Failed,
                        Some(e.code().to_string()),
                    )?;
                    return self.finish_partial(txn_id, &format!("mutation failed: {e}"));
                }
            }
        }

        self.catalog.finalize_txn(txn_id, TxnState::Committed)?;
        info!("Transaction {} committed", txn_id);
        Ok(ApplyOutcome {
            txn_id: Some(txn_id),
            state: Some(TxnState::Committed),
            dry_run: false,
            entries,
        })
    }

    /// Prelude for one action: snapshot the pre-image and append the log
    /// entry with `Pending` state.
    fn prelude_entry(&self, txn_id: TxnId, seq: u32, action: &Action) -> Result<EntryOutcome> {
        let path = action.path();

        let (pre_image_ref, post_state, error_code) = match self.snapshot_pre_image(path) {
            Ok((content_hash, _len)) => {
                self.catalog.snapshot_ref(&content_hash, 1)?;
                (Some(content_hash), PostState::Pending, None)
            }
            Err(Error::NotFound(_))
                if self.context.config().apply.policy_on_missing == OnMissing::Ignore =>
            {
                (None, PostState::Skipped, Some("not_found".to_string()))
            }
            Err(e) => return Err(e),
        };

        let link_target = match action {
            Action::ReplaceWithLink {
                keeper_path,
                link_kind: LinkKind::Sym,
                ..
            } => Some(keeper_path.display().to_string()),
            _ => None,
        };

        let entry = TxnEntry {
            txn_id,
            seq,
            action: action.clone(),
            pre_image_ref: pre_image_ref.clone(),
            link_target,
            post_state,
            error_code: error_code.clone(),
        };
        self.catalog.append_txn_entry(&entry)?;

        Ok(EntryOutcome {
            seq,
            kind: action.kind(),
            path: path.to_path_buf(),
            pre_image_ref,
            post_state,
            error: error_code,
        })
    }

    /// Stream one file into the snapshot store; returns (hash, length).
    fn snapshot_pre_image(&self, path: &Path) -> Result<(String, u64)> {
        let meta = fs::metadata(path).map_err(|e| Error::from_io(e, path))?;
        let snapshot_meta = SnapshotMeta {
            bytes_len: meta.len(),
            original_mode: meta.mode(),
            original_mtime_ns: meta.mtime().saturating_mul(1_000_000_000) + meta.mtime_nsec(),
        };
        let mut file = File::open(path).map_err(|e| Error::from_io(e, path))?;
        let content_hash = self
            .snapshot
            .put(&mut file, snapshot_meta, Some(meta.len()))?;
        Ok((content_hash, meta.len()))
    }

    /// One filesystem mutation, retried on transient errors.
    fn mutate(&self, action: &Action) -> Result<()> {
        let retry = RetryPolicy::with_config(RetryConfig {
            max_retries: u32::from(self.context.config().apply.retry_attempts),
            base_delay: Duration::from_millis(50),
            ..RetryConfig::default()
        });

        retry.execute(|| match action {
            Action::Delete { path, .. } => {
                fs::remove_file(path).map_err(|e| Error::from_io(e, path))
            }
            Action::Move { path, dest, .. } => {
                if dest.exists() {
                    return Err(Error::Drift(format!(
                        "move destination {} already exists",
                        dest.display()
                    )));
                }
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
                }
                if !path.exists() {
                    return Err(Error::NotFound(path.clone()));
                }
                // Same-device rename is atomic; EXDEV means the planner's
                // device constraints were violated out-of-band.
                fs::rename(path, dest).map_err(|e| Error::from_io(e, path))
            }
            Action::ReplaceWithLink {
                path,
                keeper_path,
                link_kind,
                ..
            } => self.replace_with_link(path, keeper_path, *link_kind),
        })
    }

    /// Create the new link under a temp name, then rename over the victim.
    fn replace_with_link(&self, path: &Path, keeper: &Path, kind: LinkKind) -> Result<()> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
        let temp = parent.join(format!(
            ".nodupe-link-{}-{}",
            std::process::id(),
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        match kind {
            LinkKind::Hard => {
                fs::hard_link(keeper, &temp).map_err(|e| Error::from_io(e, keeper))?;
            }
            LinkKind::Sym => {
                std::os::unix::fs::symlink(keeper, &temp)
                    .map_err(|e| Error::from_io(e, keeper))?;
            }
        }

        if let Err(e) = fs::rename(&temp, path) {
            fs::remove_file(&temp).ok();
            return Err(Error::from_io(e, path));
        }
        Ok(())
    }

    /// Prelude (against the provided sink) without logging or mutating.
    fn dry_run(&self, plan: &Plan, cancel: &crate::cancel::CancelToken) -> Result<ApplyOutcome> {
        let mut entries = Vec::with_capacity(plan.actions.len());
        for plan_action in &plan.actions {
            cancel.check()?;
            let path = plan_action.action.path();
            let (pre_image_ref, post_state, error) = match self.snapshot_pre_image(path) {
                Ok((content_hash, _)) => (Some(content_hash), PostState::Done, None),
                Err(Error::NotFound(p)) => (
                    None,
                    PostState::Skipped,
                    Some(format!("target missing: {}", p.display())),
                ),
                Err(e) => (None, PostState::Failed, Some(e.to_string())),
            };
            entries.push(EntryOutcome {
                seq: plan_action.seq,
                kind: plan_action.action.kind(),
                path: path.to_path_buf(),
                pre_image_ref,
                post_state,
                error,
            });
        }
        info!(
            "Dry run of plan {} covered {} actions",
            plan.plan_id,
            entries.len()
        );
        Ok(ApplyOutcome {
            txn_id: None,
            state: None,
            dry_run: true,
            entries,
        })
    }

    /// Stop the run and leave the transaction terminal `partial`; the
    /// caller gets an `ApplyFailed` referencing the transaction.
    fn finish_partial(&self, txn_id: TxnId, reason: &str) -> Result<ApplyOutcome> {
        self.catalog.finalize_txn(txn_id, TxnState::Partial)?;
        Err(Error::ApplyFailed {
            txn_id,
            state: "partial",
            reason: reason.to_string(),
        })
    }
}
