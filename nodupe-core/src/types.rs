//! Core entity types shared across the scan pipeline, catalog, planner and
//! apply executor.
//!
//! All cross-entity references are by surrogate id; nothing here holds a
//! back-pointer. Digests are raw bytes end to end and hex-encode only at
//! the catalog index boundary and in JSON artifacts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::HashAlgo;

/// Surrogate id for a catalog file row; assigned monotonically by the catalog.
pub type FileId = u64;

/// Surrogate id for a stored embedding vector.
pub type EmbeddingId = u64;

/// Interned id of a scan root path.
pub type RootId = u32;

/// Plan identifier (ULID).
pub type PlanId = ulid::Ulid;

/// Transaction identifier (ULID).
pub type TxnId = ulid::Ulid;

/// Lifecycle state of a catalog file row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Seen by the most recent scan of its root.
    Present,
    /// A later scan of the root did not see this path.
    Missing,
    /// Hashing failed; `error_code` carries the reason.
    Stale,
}

/// Lightweight stat metadata captured by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStat {
    pub size: u64,
    pub mtime_ns: i64,
    pub inode: u64,
    pub device: u64,
    pub mode: u32,
}

/// A filesystem entry emitted by the walker, not yet hashed.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub root_id: RootId,
    pub stat: EntryStat,
}

/// One catalog row. Identity is `(root_id, relative_path)`; `file_id` is the
/// surrogate used by plans and transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub root_id: RootId,
    pub relative_path: String,
    pub size: u64,
    pub mtime_ns: i64,
    pub inode: u64,
    pub device: u64,
    pub mode: u32,
    pub mime: Option<String>,
    /// Short digest over a bounded prefix/suffix; prunes equality candidates.
    pub quick_hash: Option<Vec<u8>>,
    /// Whole-file digest; null iff full hashing was skipped for this file.
    pub full_hash: Option<Vec<u8>>,
    pub hash_algo: Option<HashAlgo>,
    pub embedding_id: Option<EmbeddingId>,
    pub scan_epoch: u64,
    pub state: FileState,
    /// Error code attached when hashing failed (`state == Stale`).
    pub error_code: Option<String>,
}

impl FileRecord {
    /// Build a fresh record from a walker entry; hashes come later.
    pub fn from_candidate(entry: &CandidateEntry, epoch: u64) -> Self {
        Self {
            file_id: 0,
            root_id: entry.root_id,
            relative_path: entry.relative_path.clone(),
            size: entry.stat.size,
            mtime_ns: entry.stat.mtime_ns,
            inode: entry.stat.inode,
            device: entry.stat.device,
            mode: entry.stat.mode,
            mime: None,
            quick_hash: None,
            full_hash: None,
            hash_algo: None,
            embedding_id: None,
            scan_epoch: epoch,
            state: FileState::Present,
            error_code: None,
        }
    }

    /// Whether a rescan of the same path must re-hash this file.
    pub fn content_changed(&self, stat: &EntryStat) -> bool {
        self.size != stat.size || self.mtime_ns != stat.mtime_ns || self.inode != stat.inode
    }
}

/// A stored embedding vector. Vectors are L2-normalized on insert; `norm`
/// keeps the pre-normalization magnitude.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub embedding_id: EmbeddingId,
    pub model_id: String,
    pub dim: u16,
    pub norm: f32,
    pub vector: Vec<f32>,
    /// Number of file rows referencing this vector; maintained by the catalog.
    pub refcount: u64,
}

/// Key identifying a duplicate class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassKey {
    /// Exact-content class: `(full_hash, hash_algo, size)`.
    Content {
        algo: HashAlgo,
        hash: Vec<u8>,
        size: u64,
    },
    /// Similarity cluster produced by the similarity index.
    Similarity { cluster: u64 },
}

impl ClassKey {
    /// Stable human-readable form used in conflict reports.
    pub fn describe(&self) -> String {
        match self {
            ClassKey::Content { algo, hash, size } => {
                format!("({}:{}, {})", algo.name(), hex::encode(hash), size)
            }
            ClassKey::Similarity { cluster } => format!("(similarity cluster {cluster})"),
        }
    }
}

/// A set of file rows judged equivalent. Derived at plan time, never stored.
#[derive(Debug, Clone)]
pub struct DuplicateClass {
    pub key: ClassKey,
    pub members: Vec<FileId>,
}

/// Link flavor for `ReplaceWithLink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    #[serde(rename = "hard")]
    Hard,
    /// Serialized as `symbolic` in artifacts; the CLI flag spells it `sym`.
    #[serde(rename = "symbolic", alias = "sym")]
    Sym,
}

impl LinkKind {
    pub fn name(self) -> &'static str {
        match self {
            LinkKind::Hard => "hard",
            LinkKind::Sym => "symbolic",
        }
    }
}

/// A single plan operation against one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Delete {
        file_id: FileId,
        path: PathBuf,
    },
    Move {
        file_id: FileId,
        path: PathBuf,
        dest: PathBuf,
    },
    ReplaceWithLink {
        file_id: FileId,
        path: PathBuf,
        keeper_file_id: FileId,
        keeper_path: PathBuf,
        link_kind: LinkKind,
    },
}

impl Action {
    pub fn file_id(&self) -> FileId {
        match self {
            Action::Delete { file_id, .. }
            | Action::Move { file_id, .. }
            | Action::ReplaceWithLink { file_id, .. } => *file_id,
        }
    }

    /// The path mutated by this action.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Action::Delete { path, .. }
            | Action::Move { path, .. }
            | Action::ReplaceWithLink { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Delete { .. } => "Delete",
            Action::Move { .. } => "Move",
            Action::ReplaceWithLink { .. } => "ReplaceWithLink",
        }
    }
}

/// An action with its position in the total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAction {
    pub seq: u32,
    pub action: Action,
}

/// Strategy descriptor as persisted in the plan artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub params: serde_json::Value,
}

/// Plan constraints, persisted verbatim in the artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Constraints {
    pub scope_root_ids: Vec<RootId>,
    pub must_keep: Vec<String>,
    pub must_not_delete: Vec<String>,
    pub allow_hardlink: bool,
    pub allow_symlink: bool,
    pub link_kind: Option<LinkKind>,
    pub retention_dir: Option<PathBuf>,
}

/// A reviewable, totally ordered description of mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub catalog_epoch: u64,
    pub strategy: StrategyDescriptor,
    pub constraints: Constraints,
    pub actions: Vec<PlanAction>,
}

/// Terminality: `Committed`, `RolledBack` and `Partial` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    Open,
    Committed,
    RolledBack,
    Partial,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxnState::Open)
    }

    pub fn name(self) -> &'static str {
        match self {
            TxnState::Open => "open",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled_back",
            TxnState::Partial => "partial",
        }
    }
}

/// One `apply` run, append-only, sufficient to drive verify and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub plan_id: PlanId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: TxnState,
    /// Set once snapshot GC has released this transaction's pre-images, so
    /// a second GC pass never double-decrements refcounts.
    #[serde(default)]
    pub reclaimed: bool,
}

/// Outcome of one transaction entry.
///
/// `Pending` is the in-flight marker between prelude and mutation; a crash
/// leaves pending entries behind and recovery marks the transaction
/// `Partial`. Terminal entries are always `Done`, `Skipped` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostState {
    Pending,
    Done,
    Skipped,
    Failed,
}

/// One persisted step of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnEntry {
    pub txn_id: TxnId,
    pub seq: u32,
    pub action: Action,
    /// Hex content hash of the pre-image in the snapshot store; present for
    /// every mutating entry before the filesystem is touched.
    pub pre_image_ref: Option<String>,
    /// Target text of a created symbolic link, recorded so reversal never
    /// depends on re-reading the filesystem.
    pub link_target: Option<String>,
    pub post_state: PostState,
    pub error_code: Option<String>,
}

/// Sidecar metadata stored next to each snapshot object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub bytes_len: u64,
    pub original_mode: u32,
    pub original_mtime_ns: i64,
}

/// Periodically persisted scan progress; consumed on `--resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub root_id: RootId,
    pub root_path: PathBuf,
    /// Highest relative path for which all prior entries are committed,
    /// in walker (sorted path component) order.
    pub last_completed_subpath: String,
    pub epoch: u64,
    pub visited_count: u64,
    pub bytes_hashed: u64,
    /// Algorithm the autotuner picked for this scan epoch.
    pub hash_algo: HashAlgo,
}

/// Catalog-wide counters for CLI summaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CatalogStatistics {
    pub file_count: u64,
    pub missing_count: u64,
    pub embedding_count: u64,
    pub txn_count: u64,
    pub epoch: u64,
}

/// What `compact()` removed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompactReport {
    pub files_removed: u64,
    pub embeddings_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_changed_tracks_identity_fields() {
        let stat = EntryStat {
            size: 10,
            mtime_ns: 1,
            inode: 7,
            device: 1,
            mode: 0o644,
        };
        let entry = CandidateEntry {
            absolute_path: PathBuf::from("/r/a"),
            relative_path: "a".into(),
            root_id: 1,
            stat,
        };
        let rec = FileRecord::from_candidate(&entry, 1);
        assert!(!rec.content_changed(&stat));

        let touched = EntryStat { mtime_ns: 2, ..stat };
        assert!(rec.content_changed(&touched));

        let grown = EntryStat { size: 11, ..stat };
        assert!(rec.content_changed(&grown));
    }

    #[test]
    fn txn_states_terminal_except_open() {
        assert!(!TxnState::Open.is_terminal());
        assert!(TxnState::Committed.is_terminal());
        assert!(TxnState::RolledBack.is_terminal());
        assert!(TxnState::Partial.is_terminal());
    }

    #[test]
    fn link_kind_accepts_both_spellings() {
        // The plan artifact spells the variant "symbolic"; the CLI flag "sym".
        let k: LinkKind = serde_json::from_str("\"symbolic\"").unwrap();
        assert_eq!(k, LinkKind::Sym);
        let k: LinkKind = serde_json::from_str("\"sym\"").unwrap();
        assert_eq!(k, LinkKind::Sym);
    }
}
