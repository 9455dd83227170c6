//! Root interning and meta counters.

use std::path::{Path, PathBuf};

use redb::ReadableTable;
use tracing::debug;

use nodupe_core::RootId;
use nodupe_core::error::{Error, Result};

use crate::tables::{
    META_EPOCH, META_NEXT_ROOT_ID, META_TABLE, ROOTS_BY_PATH_TABLE, ROOTS_TABLE,
};
use crate::RedbCatalog;

impl RedbCatalog {
    /// Read a meta counter; missing keys read as zero.
    pub(crate) fn meta_get(&self, key: &str) -> Result<u64> {
        let read = self.begin_read()?;
        let table = read
            .open_table(META_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open meta table: {e}")))?;
        Ok(table
            .get(key)
            .map_err(|e| Error::Catalog(format!("Failed to read meta key {key}: {e}")))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    /// Increment the scan epoch and return the new value.
    pub(crate) fn bump_epoch(&self) -> Result<u64> {
        let write = self.begin_write()?;
        let next = {
            let mut table = write
                .open_table(META_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open meta table: {e}")))?;
            let current = table
                .get(META_EPOCH)
                .map_err(|e| Error::Catalog(format!("Failed to read epoch: {e}")))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let next = current + 1;
            table
                .insert(META_EPOCH, next)
                .map_err(|e| Error::Catalog(format!("Failed to store epoch: {e}")))?;
            next
        };
        Self::commit(write)?;
        debug!("Catalog epoch advanced to {}", next);
        Ok(next)
    }

    /// Allocate the next surrogate id for `counter_key` inside an already
    /// open write transaction.
    pub(crate) fn allocate_id(
        table: &mut redb::Table<&str, u64>,
        counter_key: &str,
        first: u64,
    ) -> Result<u64> {
        let current = table
            .get(counter_key)
            .map_err(|e| Error::Catalog(format!("Failed to read counter {counter_key}: {e}")))?
            .map(|guard| guard.value())
            .unwrap_or(first);
        table
            .insert(counter_key, current + 1)
            .map_err(|e| Error::Catalog(format!("Failed to bump counter {counter_key}: {e}")))?;
        Ok(current)
    }

    pub(crate) fn intern_root_impl(&self, path: &Path) -> Result<RootId> {
        let key = path.to_string_lossy().into_owned();

        {
            let read = self.begin_read()?;
            let by_path = read
                .open_table(ROOTS_BY_PATH_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open roots index: {e}")))?;
            if let Some(guard) = by_path
                .get(key.as_str())
                .map_err(|e| Error::Catalog(format!("Failed to look up root: {e}")))?
            {
                return Ok(guard.value());
            }
        }

        let write = self.begin_write()?;
        let root_id = {
            let mut meta = write
                .open_table(META_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open meta table: {e}")))?;
            let mut by_path = write
                .open_table(ROOTS_BY_PATH_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open roots index: {e}")))?;
            let mut roots = write
                .open_table(ROOTS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open roots table: {e}")))?;

            // Re-check under the write lock; another thread may have
            // interned the same path meanwhile.
            if let Some(guard) = by_path
                .get(key.as_str())
                .map_err(|e| Error::Catalog(format!("Failed to look up root: {e}")))?
            {
                let existing = guard.value();
                drop(guard);
                existing
            } else {
                let id = Self::allocate_id(&mut meta, META_NEXT_ROOT_ID, 1)? as RootId;
                by_path
                    .insert(key.as_str(), id)
                    .map_err(|e| Error::Catalog(format!("Failed to insert root index: {e}")))?;
                roots
                    .insert(id, key.as_str())
                    .map_err(|e| Error::Catalog(format!("Failed to insert root: {e}")))?;
                debug!("Interned root {} as id {}", path.display(), id);
                id
            }
        };
        Self::commit(write)?;
        Ok(root_id)
    }

    pub(crate) fn root_path_impl(&self, root_id: RootId) -> Result<Option<PathBuf>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(ROOTS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open roots table: {e}")))?;
        Ok(table
            .get(root_id)
            .map_err(|e| Error::Catalog(format!("Failed to read root {root_id}: {e}")))?
            .map(|guard| PathBuf::from(guard.value())))
    }

    pub(crate) fn list_roots_impl(&self) -> Result<Vec<(RootId, PathBuf)>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(ROOTS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open roots table: {e}")))?;
        let mut roots = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate roots: {e}")))?
        {
            let (key, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read root row: {e}")))?;
            roots.push((key.value(), PathBuf::from(value.value())));
        }
        Ok(roots)
    }
}
