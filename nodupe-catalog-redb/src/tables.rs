//! Table definitions and schema constants.

use redb::TableDefinition;

/// Current schema version; bumped by forward-only migrations.
pub const SCHEMA_VERSION: u64 = 1;

/// Meta keys
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_EPOCH: &str = "catalog_epoch";
pub const META_NEXT_FILE_ID: &str = "next_file_id";
pub const META_NEXT_EMBEDDING_ID: &str = "next_embedding_id";
pub const META_NEXT_ROOT_ID: &str = "next_root_id";

/// Schema version, epoch and surrogate-id counters.
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// `root_id -> absolute path`
pub(crate) const ROOTS_TABLE: TableDefinition<u32, &str> = TableDefinition::new("roots");

/// `absolute path -> root_id` (unique)
pub(crate) const ROOTS_BY_PATH_TABLE: TableDefinition<&str, u32> =
    TableDefinition::new("roots_by_path");

/// `file_id -> postcard FileRecord`
pub(crate) const FILES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("files");

/// `(root_id, relative_path) -> file_id` (unique)
pub(crate) const FILES_BY_KEY_TABLE: TableDefinition<(u32, &str), u64> =
    TableDefinition::new("files_by_key");

/// `(size, file_id) -> ()`, the size bucket index
pub(crate) const SIZE_INDEX_TABLE: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("files_by_size");

/// `("algo:hex_full_hash", file_id) -> size`, the content class index
pub(crate) const HASH_INDEX_TABLE: TableDefinition<(&str, u64), u64> =
    TableDefinition::new("files_by_hash");

/// `embedding_id -> postcard EmbeddingRecord`
pub(crate) const EMBEDDINGS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");

/// `plan_id -> plan artifact JSON`
pub(crate) const PLANS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

/// `txn_id -> postcard Transaction`
pub(crate) const TXNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("txns");

/// `(txn_id, seq) -> postcard TxnEntry`
pub(crate) const TXN_ENTRIES_TABLE: TableDefinition<(&str, u32), &[u8]> =
    TableDefinition::new("txn_entries");

/// `root_id -> postcard ScanCheckpoint`
pub(crate) const CHECKPOINTS_TABLE: TableDefinition<u32, &[u8]> =
    TableDefinition::new("checkpoints");

/// `hex content hash -> refcount`
pub(crate) const SNAPSHOT_REFS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("snapshot_refs");

/// Key prefix for the hash index: `"{algo}:{hex}"`.
pub(crate) fn hash_index_key(algo: nodupe_core::HashAlgo, full_hash: &[u8]) -> String {
    format!("{}:{}", algo.name(), hex::encode(full_hash))
}
