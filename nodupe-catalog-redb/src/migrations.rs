//! Forward-only, transactional schema migrations.
//!
//! The schema version lives in the meta table. Opening a newer database
//! with an older binary is a hard error; every migration step runs inside
//! one write transaction and bumps the version as its last write.

use redb::ReadableTable;
use tracing::info;

use nodupe_core::error::{Error, Result};

use crate::tables::{
    CHECKPOINTS_TABLE, EMBEDDINGS_TABLE, FILES_BY_KEY_TABLE, FILES_TABLE, HASH_INDEX_TABLE,
    META_SCHEMA_VERSION, META_TABLE, PLANS_TABLE, ROOTS_BY_PATH_TABLE, ROOTS_TABLE, SCHEMA_VERSION,
    SIZE_INDEX_TABLE, SNAPSHOT_REFS_TABLE, TXN_ENTRIES_TABLE, TXNS_TABLE,
};
use crate::RedbCatalog;

pub(crate) fn migrate(catalog: &RedbCatalog) -> Result<()> {
    let mut version = current_version(catalog)?;
    if version > SCHEMA_VERSION {
        return Err(Error::CatalogCorrupt(format!(
            "catalog schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    while version < SCHEMA_VERSION {
        let next = version + 1;
        info!("Migrating catalog schema {} -> {}", version, next);
        match next {
            1 => initial_schema(catalog)?,
            other => {
                return Err(Error::Internal(format!(
                    "no migration step for schema version {other}"
                )));
            }
        }
        version = next;
    }
    Ok(())
}

fn current_version(catalog: &RedbCatalog) -> Result<u64> {
    // A freshly created database has no tables yet; treat that as v0.
    let read = catalog.begin_read()?;
    match read.open_table(META_TABLE) {
        Ok(table) => Ok(table
            .get(META_SCHEMA_VERSION)
            .map_err(|e| Error::Catalog(format!("Failed to read schema version: {e}")))?
            .map(|guard| guard.value())
            .unwrap_or(0)),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
        Err(e) => Err(Error::Catalog(format!("Failed to open meta table: {e}"))),
    }
}

/// v0 -> v1: create every table and stamp the version.
fn initial_schema(catalog: &RedbCatalog) -> Result<()> {
    let write = catalog.begin_write()?;
    {
        let open = |e: redb::TableError| Error::Catalog(format!("Failed to create table: {e}"));
        let mut meta = write.open_table(META_TABLE).map_err(open)?;
        let _ = write.open_table(ROOTS_TABLE).map_err(open)?;
        let _ = write.open_table(ROOTS_BY_PATH_TABLE).map_err(open)?;
        let _ = write.open_table(FILES_TABLE).map_err(open)?;
        let _ = write.open_table(FILES_BY_KEY_TABLE).map_err(open)?;
        let _ = write.open_table(SIZE_INDEX_TABLE).map_err(open)?;
        let _ = write.open_table(HASH_INDEX_TABLE).map_err(open)?;
        let _ = write.open_table(EMBEDDINGS_TABLE).map_err(open)?;
        let _ = write.open_table(PLANS_TABLE).map_err(open)?;
        let _ = write.open_table(TXNS_TABLE).map_err(open)?;
        let _ = write.open_table(TXN_ENTRIES_TABLE).map_err(open)?;
        let _ = write.open_table(CHECKPOINTS_TABLE).map_err(open)?;
        let _ = write.open_table(SNAPSHOT_REFS_TABLE).map_err(open)?;

        meta.insert(META_SCHEMA_VERSION, 1u64)
            .map_err(|e| Error::Catalog(format!("Failed to stamp schema version: {e}")))?;
    }
    RedbCatalog::commit(write)
}
