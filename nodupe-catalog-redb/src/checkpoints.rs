//! Scan checkpoints: written periodically and atomically during a scan,
//! consumed on resume, discarded on successful completion.

use redb::ReadableTable;
use tracing::debug;

use nodupe_core::error::{Error, Result};
use nodupe_core::types::{RootId, ScanCheckpoint};

use crate::tables::CHECKPOINTS_TABLE;
use crate::{decode, encode, RedbCatalog};

impl RedbCatalog {
    pub(crate) fn save_checkpoint_impl(&self, checkpoint: &ScanCheckpoint) -> Result<()> {
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(CHECKPOINTS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open checkpoints table: {e}")))?;
            let bytes = encode("checkpoint", checkpoint)?;
            table
                .insert(checkpoint.root_id, bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to insert checkpoint: {e}")))?;
        }
        Self::commit(write)?;
        debug!(
            "Checkpoint for root {} at {:?} ({} visited)",
            checkpoint.root_id, checkpoint.last_completed_subpath, checkpoint.visited_count
        );
        Ok(())
    }

    pub(crate) fn load_checkpoint_impl(&self, root_id: RootId) -> Result<Option<ScanCheckpoint>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(CHECKPOINTS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open checkpoints table: {e}")))?;
        table
            .get(root_id)
            .map_err(|e| Error::Catalog(format!("Failed to read checkpoint: {e}")))?
            .map(|guard| decode("checkpoint", guard.value()))
            .transpose()
    }

    pub(crate) fn clear_checkpoint_impl(&self, root_id: RootId) -> Result<()> {
        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(CHECKPOINTS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open checkpoints table: {e}")))?;
            table
                .remove(root_id)
                .map_err(|e| Error::Catalog(format!("Failed to remove checkpoint: {e}")))?;
        }
        Self::commit(write)
    }
}
