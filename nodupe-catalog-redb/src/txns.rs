//! Transaction log, plan storage and snapshot refcounts.
//!
//! The log is append-only: entries are inserted once with a pending
//! outcome and only their `post_state`/`error_code` are updated as the
//! executor progresses. External audit tools may read these rows
//! directly.

use chrono::Utc;
use redb::ReadableTable;
use tracing::{debug, info};

use nodupe_core::error::{Error, Result};
use nodupe_core::planner::artifact;
use nodupe_core::types::{Plan, PlanId, PostState, Transaction, TxnEntry, TxnId, TxnState};

use crate::tables::{PLANS_TABLE, SNAPSHOT_REFS_TABLE, TXN_ENTRIES_TABLE, TXNS_TABLE};
use crate::{decode, encode, RedbCatalog};

impl RedbCatalog {
    /// Open a transaction. Fails while any other transaction is
    /// non-terminal.
    pub(crate) fn begin_txn_impl(&self, plan_id: PlanId) -> Result<TxnId> {
        let write = self.begin_write()?;
        let txn_id = {
            let mut table = write
                .open_table(TXNS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;

            for item in table
                .iter()
                .map_err(|e| Error::Catalog(format!("Failed to iterate txns: {e}")))?
            {
                let (_, value) =
                    item.map_err(|e| Error::Catalog(format!("Failed to read txn row: {e}")))?;
                let existing: Transaction = decode("transaction", value.value())?;
                if existing.state == TxnState::Open {
                    return Err(Error::TransactionAlreadyOpen(existing.txn_id));
                }
            }

            let txn_id = ulid::Ulid::new();
            let txn = Transaction {
                txn_id,
                plan_id,
                started_at: Utc::now(),
                finished_at: None,
                state: TxnState::Open,
                reclaimed: false,
            };
            let bytes = encode("transaction", &txn)?;
            table
                .insert(txn_id.to_string().as_str(), bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to insert txn: {e}")))?;
            txn_id
        };
        Self::commit(write)?;
        info!("Opened transaction {} for plan {}", txn_id, plan_id);
        Ok(txn_id)
    }

    pub(crate) fn append_txn_entry_impl(&self, entry: &TxnEntry) -> Result<()> {
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(TXN_ENTRIES_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txn entries: {e}")))?;
            let key = entry.txn_id.to_string();
            let bytes = encode("txn entry", entry)?;
            table
                .insert((key.as_str(), entry.seq), bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to append txn entry: {e}")))?;
        }
        Self::commit(write)
    }

    pub(crate) fn set_txn_entry_state_impl(
        &self,
        txn_id: TxnId,
        seq: u32,
        post_state: PostState,
        error_code: Option<String>,
    ) -> Result<()> {
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(TXN_ENTRIES_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txn entries: {e}")))?;
            let key = txn_id.to_string();
            let entry: Option<TxnEntry> = table
                .get((key.as_str(), seq))
                .map_err(|e| Error::Catalog(format!("Failed to read txn entry: {e}")))?
                .map(|guard| decode("txn entry", guard.value()))
                .transpose()?;
            let mut entry = entry.ok_or_else(|| {
                Error::CatalogCorrupt(format!("txn {txn_id} has no entry {seq}"))
            })?;

            entry.post_state = post_state;
            entry.error_code = error_code;
            let bytes = encode("txn entry", &entry)?;
            table
                .insert((key.as_str(), seq), bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to update txn entry: {e}")))?;
        }
        Self::commit(write)
    }

    pub(crate) fn finalize_txn_impl(&self, txn_id: TxnId, state: TxnState) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot finalize transaction {txn_id} to non-terminal state {}",
                state.name()
            )));
        }

        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(TXNS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
            let key = txn_id.to_string();
            let txn: Option<Transaction> = table
                .get(key.as_str())
                .map_err(|e| Error::Catalog(format!("Failed to read txn: {e}")))?
                .map(|guard| decode("transaction", guard.value()))
                .transpose()?;
            let mut txn = txn
                .ok_or_else(|| Error::InvalidInput(format!("unknown transaction {txn_id}")))?;

            if txn.state == TxnState::RolledBack {
                return Err(Error::InvalidInput(format!(
                    "transaction {txn_id} is already rolled back"
                )));
            }

            txn.state = state;
            txn.finished_at = Some(Utc::now());
            let bytes = encode("transaction", &txn)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to update txn: {e}")))?;
        }
        Self::commit(write)?;
        info!("Transaction {} finalized as {}", txn_id, state.name());
        Ok(())
    }

    pub(crate) fn get_txn_impl(&self, txn_id: TxnId) -> Result<Option<Transaction>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(TXNS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
        table
            .get(txn_id.to_string().as_str())
            .map_err(|e| Error::Catalog(format!("Failed to read txn: {e}")))?
            .map(|guard| decode("transaction", guard.value()))
            .transpose()
    }

    /// Entries of one transaction in ascending `seq`.
    pub(crate) fn txn_entries_impl(&self, txn_id: TxnId) -> Result<Vec<TxnEntry>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(TXN_ENTRIES_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open txn entries: {e}")))?;
        let wanted = txn_id.to_string();
        let mut entries = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate txn entries: {e}")))?
        {
            let (key, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read txn entry: {e}")))?;
            let (entry_txn, _seq) = key.value();
            if entry_txn == wanted {
                entries.push(decode("txn entry", value.value())?);
            }
        }
        entries.sort_by_key(|e: &TxnEntry| e.seq);
        Ok(entries)
    }

    pub(crate) fn list_txns_impl(&self, state_filter: Option<TxnState>) -> Result<Vec<Transaction>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(TXNS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
        let mut txns = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate txns: {e}")))?
        {
            let (_, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read txn row: {e}")))?;
            let txn: Transaction = decode("transaction", value.value())?;
            if state_filter.is_none_or(|s| txn.state == s) {
                txns.push(txn);
            }
        }
        txns.sort_by_key(|t| t.started_at);
        Ok(txns)
    }

    // ========== Snapshot refcounts ==========

    pub(crate) fn snapshot_ref_impl(&self, content_hash: &str, delta: i64) -> Result<u64> {
        let write = self.begin_write()?;
        let new_count = {
            let mut table = write
                .open_table(SNAPSHOT_REFS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open snapshot refs: {e}")))?;
            let current = table
                .get(content_hash)
                .map_err(|e| Error::Catalog(format!("Failed to read snapshot ref: {e}")))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let new_count = if delta >= 0 {
                current.saturating_add(delta as u64)
            } else {
                current.saturating_sub(delta.unsigned_abs())
            };
            table
                .insert(content_hash, new_count)
                .map_err(|e| Error::Catalog(format!("Failed to update snapshot ref: {e}")))?;
            new_count
        };
        Self::commit(write)?;
        Ok(new_count)
    }

    pub(crate) fn snapshot_refcount_impl(&self, content_hash: &str) -> Result<u64> {
        let read = self.begin_read()?;
        let table = read
            .open_table(SNAPSHOT_REFS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open snapshot refs: {e}")))?;
        Ok(table
            .get(content_hash)
            .map_err(|e| Error::Catalog(format!("Failed to read snapshot ref: {e}")))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    /// Pre-images referenced by non-terminal transactions; never GC'd.
    pub(crate) fn pinned_snapshots_impl(&self) -> Result<Vec<String>> {
        let mut pinned = Vec::new();
        for txn in self.list_txns_impl(Some(TxnState::Open))? {
            for entry in self.txn_entries_impl(txn.txn_id)? {
                if let Some(content_hash) = entry.pre_image_ref {
                    pinned.push(content_hash);
                }
            }
        }
        pinned.sort();
        pinned.dedup();
        Ok(pinned)
    }

    /// Terminal, unreclaimed transactions past the retention window:
    /// older than `cutoff`, or beyond the newest `keep_latest`.
    pub(crate) fn list_reclaimable_txns_impl(
        &self,
        cutoff: chrono::DateTime<Utc>,
        keep_latest: u32,
    ) -> Result<Vec<TxnId>> {
        let mut terminal: Vec<Transaction> = self
            .list_txns_impl(None)?
            .into_iter()
            .filter(|t| t.state.is_terminal() && !t.reclaimed)
            .collect();
        terminal.sort_by_key(|t| std::cmp::Reverse(t.finished_at.unwrap_or(t.started_at)));

        Ok(terminal
            .into_iter()
            .enumerate()
            .filter(|(rank, txn)| {
                *rank >= keep_latest as usize
                    || txn.finished_at.unwrap_or(txn.started_at) < cutoff
            })
            .map(|(_, txn)| txn.txn_id)
            .collect())
    }

    pub(crate) fn mark_reclaimed_impl(&self, txn_id: TxnId) -> Result<()> {
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(TXNS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
            let key = txn_id.to_string();
            let txn: Option<Transaction> = table
                .get(key.as_str())
                .map_err(|e| Error::Catalog(format!("Failed to read txn: {e}")))?
                .map(|guard| decode("transaction", guard.value()))
                .transpose()?;
            let mut txn = txn
                .ok_or_else(|| Error::InvalidInput(format!("unknown transaction {txn_id}")))?;
            txn.reclaimed = true;
            let bytes = encode("transaction", &txn)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to update txn: {e}")))?;
        }
        Self::commit(write)?;
        debug!("Transaction {} marked reclaimed", txn_id);
        Ok(())
    }

    // ========== Plans ==========

    pub(crate) fn store_plan_impl(&self, plan: &Plan) -> Result<()> {
        let json = artifact::to_json(plan)?;
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(PLANS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open plans table: {e}")))?;
            table
                .insert(plan.plan_id.to_string().as_str(), json.as_bytes())
                .map_err(|e| Error::Catalog(format!("Failed to insert plan: {e}")))?;
        }
        Self::commit(write)?;
        debug!("Stored plan {}", plan.plan_id);
        Ok(())
    }

    pub(crate) fn get_plan_impl(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(PLANS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open plans table: {e}")))?;
        let Some(guard) = table
            .get(plan_id.to_string().as_str())
            .map_err(|e| Error::Catalog(format!("Failed to read plan: {e}")))?
        else {
            return Ok(None);
        };
        let json = std::str::from_utf8(guard.value())
            .map_err(|e| Error::CatalogCorrupt(format!("plan {plan_id} is not UTF-8: {e}")))?;
        artifact::from_json(json).map(Some)
    }
}
