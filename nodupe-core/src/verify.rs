//! Post-hoc transaction verification and rollback.
//!
//! `verify` proves a transaction is fully applied (or reports where the
//! filesystem disagrees); `rollback` reverses entries in reverse sequence
//! order from their snapshot pre-images. Drift makes rollback refuse
//! unless forced, in which case the pre-image is restored anyway and the
//! entry is reported as overwritten.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotBackend;
use crate::types::{Action, LinkKind, PostState, TxnEntry, TxnId, TxnState};

/// Verification status of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Ok,
    Drifted,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryVerdict {
    pub seq: u32,
    pub kind: &'static str,
    pub path: std::path::PathBuf,
    pub status: EntryStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub txn_id: TxnId,
    pub txn_state: TxnState,
    pub all_ok: bool,
    pub entries: Vec<EntryVerdict>,
}

/// Outcome of one reversed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Restored,
    /// Drift was present but `force` promoted it; the pre-image was
    /// restored over the drifted state.
    Overwritten,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackEntry {
    pub seq: u32,
    pub kind: &'static str,
    pub status: RollbackStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub txn_id: TxnId,
    pub state_after: TxnState,
    pub entries: Vec<RollbackEntry>,
}

/// Re-reads filesystem and catalog to prove or reverse a transaction.
pub struct Verifier<'a> {
    context: &'a CoreContext,
    catalog: &'a dyn Catalog,
    snapshot: &'a dyn SnapshotBackend,
}

impl<'a> Verifier<'a> {
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

    /// Classify every entry of a transaction as ok, drifted or
    /// unverifiable.
    pub fn verify(&self, txn_id: TxnId) -> Result<VerifyReport> {
        let txn = self
            .catalog
            .get_txn(txn_id)?
            .ok_or_else(|| Error::InvalidInput(format!("unknown transaction {txn_id}")))?;

        let mut verdicts = Vec::new();
        for entry in self.catalog.txn_entries(txn_id)? {
            verdicts.push(self.verify_entry(&entry));
        }

        let all_ok = verdicts.iter().all(|v| v.status == EntryStatus::Ok);
        info!(
            "Verified transaction {}: {} entries, all_ok={}",
            txn_id,
            verdicts.len(),
            all_ok
        );
        Ok(VerifyReport {
            txn_id,
            txn_state: txn.state,
            all_ok,
            entries: verdicts,
        })
    }

    fn verify_entry(&self, entry: &TxnEntry) -> EntryVerdict {
        let path = entry.action.path().to_path_buf();
        let verdict = |status, detail: Option<String>| EntryVerdict {
            seq: entry.seq,
            kind: entry.action.kind(),
            path: path.clone(),
            status,
            detail,
        };

        match entry.post_state {
            PostState::Skipped => return verdict(EntryStatus::Ok, None),
            PostState::Pending | PostState::Failed => {
                return verdict(
                    EntryStatus::Unverifiable,
                    Some(format!("entry never completed (state {:?})", entry.post_state)),
                );
            }
            PostState::Done => {}
        }

        // The pre-image, when recorded, must still resolve and hash-match.
        if let Some(ref content_hash) = entry.pre_image_ref {
            if let Err(e) = self.snapshot.open_verified(content_hash) {
                return verdict(
                    EntryStatus::Unverifiable,
                    Some(format!("pre-image unavailable: {e}")),
                );
            }
        }

        match &entry.action {
            Action::Delete { path, .. } => {
                if path.exists() {
                    verdict(
                        EntryStatus::Drifted,
                        Some("deleted path exists again".into()),
                    )
                } else {
                    verdict(EntryStatus::Ok, None)
                }
            }
            Action::Move { path, dest, .. } => {
                if path.exists() {
                    verdict(EntryStatus::Drifted, Some("source path re-appeared".into()))
                } else if !dest.exists() {
                    verdict(
                        EntryStatus::Drifted,
                        Some(format!("moved file missing at {}", dest.display())),
                    )
                } else {
                    verdict(EntryStatus::Ok, None)
                }
            }
            Action::ReplaceWithLink {
                path,
                keeper_path,
                link_kind,
                ..
            } => match self.check_link(path, keeper_path, entry, *link_kind) {
                Ok(()) => verdict(EntryStatus::Ok, None),
                Err(detail) => verdict(EntryStatus::Drifted, Some(detail)),
            },
        }
    }

    fn check_link(
        &self,
        path: &Path,
        keeper: &Path,
        entry: &TxnEntry,
        kind: LinkKind,
    ) -> std::result::Result<(), String> {
        match kind {
            LinkKind::Sym => {
                let target = fs::read_link(path)
                    .map_err(|e| format!("{} is not a symlink: {e}", path.display()))?;
                let expected = entry
                    .link_target
                    .clone()
                    .unwrap_or_else(|| keeper.display().to_string());
                if target.display().to_string() == expected {
                    Ok(())
                } else {
                    Err(format!(
                        "symlink points at {}, expected {}",
                        target.display(),
                        expected
                    ))
                }
            }
            LinkKind::Hard => {
                let meta = fs::symlink_metadata(path)
                    .map_err(|e| format!("{} missing: {e}", path.display()))?;
                let keeper_meta = fs::symlink_metadata(keeper)
                    .map_err(|e| format!("keeper {} missing: {e}", keeper.display()))?;
                if meta.dev() == keeper_meta.dev() && meta.ino() == keeper_meta.ino() {
                    Ok(())
                } else {
                    Err("path no longer hardlinks the keeper".into())
                }
            }
        }
    }

    /// Reverse a transaction (or selected entries) in reverse `seq` order.
    ///
    /// Refuses on drift unless `force`; a full-scope success transitions
    /// the transaction to `rolled_back`.
    pub fn rollback(
        &self,
        txn_id: TxnId,
        only_seqs: Option<&[u32]>,
        force: bool,
    ) -> Result<RollbackReport> {
        let _guard = self.context.mutation_guard();

        let txn = self
            .catalog
            .get_txn(txn_id)?
            .ok_or_else(|| Error::InvalidInput(format!("unknown transaction {txn_id}")))?;
        if txn.state == TxnState::RolledBack {
            return Err(Error::InvalidInput(format!(
                "transaction {txn_id} is already rolled back"
            )));
        }

        let mut entries = self.catalog.txn_entries(txn_id)?;
        entries.sort_by_key(|e| std::cmp::Reverse(e.seq));

        let full_scope = only_seqs.is_none();
        let mut report_entries = Vec::new();

        for entry in &entries {
            if let Some(seqs) = only_seqs {
                if !seqs.contains(&entry.seq) {
                    continue;
                }
            }
            self.context.cancel_token().check()?;

            if entry.post_state != PostState::Done {
                report_entries.push(RollbackEntry {
                    seq: entry.seq,
                    kind: entry.action.kind(),
                    status: RollbackStatus::Skipped,
                    detail: Some(format!("nothing to reverse (state {:?})", entry.post_state)),
                });
                continue;
            }

            let status = self.reverse_entry(entry, force)?;
            report_entries.push(status);
        }

        let state_after = if full_scope {
            self.catalog.finalize_txn(txn_id, TxnState::RolledBack)?;
            TxnState::RolledBack
        } else {
            txn.state
        };

        info!(
            "Rolled back transaction {} ({} entries, state {})",
            txn_id,
            report_entries.len(),
            state_after.name()
        );
        Ok(RollbackReport {
            txn_id,
            state_after,
            entries: report_entries,
        })
    }

    /// Reverse one entry; errors abort the whole rollback.
    fn reverse_entry(&self, entry: &TxnEntry, force: bool) -> Result<RollbackEntry> {
        let made = |status, detail: Option<String>| RollbackEntry {
            seq: entry.seq,
            kind: entry.action.kind(),
            status,
            detail,
        };

        match &entry.action {
            Action::Delete { path, .. } => {
                let drifted = path.exists();
                if drifted && !force {
                    return Err(Error::Drift(format!(
                        "{} exists; refusing to restore over it (use --force)",
                        path.display()
                    )));
                }
                self.restore_pre_image(entry, path)?;
                Ok(if drifted {
                    made(RollbackStatus::Overwritten, Some("path existed".into()))
                } else {
                    made(RollbackStatus::Restored, None)
                })
            }
            Action::Move { path, dest, .. } => {
                let source_back = path.exists();
                if source_back && !force {
                    return Err(Error::Drift(format!(
                        "{} exists; refusing to move back over it (use --force)",
                        path.display()
                    )));
                }
                if dest.exists() {
                    if source_back {
                        fs::remove_file(path).map_err(|e| Error::from_io(e, path))?;
                    }
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
                    }
                    fs::rename(dest, path).map_err(|e| Error::from_io(e, dest))?;
                    Ok(if source_back {
                        made(RollbackStatus::Overwritten, Some("source existed".into()))
                    } else {
                        made(RollbackStatus::Restored, None)
                    })
                } else {
                    // Moved file vanished; fall back to the pre-image.
                    if !force {
                        return Err(Error::Drift(format!(
                            "moved file missing at {} (use --force to restore the pre-image)",
                            dest.display()
                        )));
                    }
                    self.restore_pre_image(entry, path)?;
                    Ok(made(
                        RollbackStatus::Overwritten,
                        Some("destination missing, restored pre-image".into()),
                    ))
                }
            }
            Action::ReplaceWithLink {
                path,
                keeper_path,
                link_kind,
                ..
            } => {
                let looks_intact = self.check_link(path, keeper_path, entry, *link_kind).is_ok();
                if !looks_intact && !force {
                    return Err(Error::Drift(format!(
                        "{} is no longer the link apply created (use --force)",
                        path.display()
                    )));
                }
                if path.exists() || fs::symlink_metadata(path).is_ok() {
                    fs::remove_file(path).map_err(|e| Error::from_io(e, path))?;
                }
                self.restore_pre_image(entry, path)?;
                Ok(if looks_intact {
                    made(RollbackStatus::Restored, None)
                } else {
                    made(RollbackStatus::Overwritten, Some("link drifted".into()))
                })
            }
        }
    }

    /// Copy the verified pre-image back to `dest`, restoring bytes, mode
    /// and mtime, via temp-file-plus-rename.
    fn restore_pre_image(&self, entry: &TxnEntry, dest: &Path) -> Result<()> {
        let content_hash = entry.pre_image_ref.as_ref().ok_or_else(|| {
            Error::SnapshotCorrupt(format!("entry {} has no pre-image", entry.seq))
        })?;
        let (mut reader, meta) = self.snapshot.open_verified(content_hash)?;

        let parent = dest
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent", dest.display())))?;
        fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
        let temp = parent.join(format!(
            ".nodupe-restore-{}-{}",
            std::process::id(),
            entry.seq
        ));

        use std::io::Write;
        let mut out = fs::File::create(&temp).map_err(|e| Error::from_io(e, &temp))?;
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|e| Error::from_io(e, &temp))?;
        }
        out.sync_all().map_err(|e| Error::from_io(e, &temp))?;
        drop(out);

        fs::set_permissions(&temp, fs::Permissions::from_mode(meta.original_mode))
            .map_err(|e| Error::from_io(e, &temp))?;
        let mtime = FileTime::from_unix_time(
            meta.original_mtime_ns.div_euclid(1_000_000_000),
            meta.original_mtime_ns.rem_euclid(1_000_000_000) as u32,
        );
        filetime::set_file_mtime(&temp, mtime).map_err(|e| Error::from_io(e, &temp))?;

        if let Err(e) = fs::rename(&temp, dest) {
            fs::remove_file(&temp).ok();
            return Err(Error::from_io(e, dest));
        }
        debug!("Restored {} from {}", dest.display(), content_hash);
        Ok(())
    }

    /// `verify --fix`: roll back drifted entries with force.
    pub fn fix(&self, txn_id: TxnId) -> Result<(VerifyReport, Option<RollbackReport>)> {
        let report = self.verify(txn_id)?;
        let drifted: Vec<u32> = report
            .entries
            .iter()
            .filter(|v| v.status == EntryStatus::Drifted)
            .map(|v| v.seq)
            .collect();

        if drifted.is_empty() {
            return Ok((report, None));
        }
        warn!(
            "Fixing {} drifted entries of transaction {}",
            drifted.len(),
            txn_id
        );
        let rollback = self.rollback(txn_id, Some(&drifted), true)?;
        Ok((report, Some(rollback)))
    }
}
