mod apply;
mod plan;
mod rollback;
mod scan;
mod similarity;
mod verify;

pub use apply::{ApplyArgs, handle_apply};
pub use plan::{PlanArgs, handle_plan};
pub use rollback::{RollbackArgs, handle_rollback};
pub use scan::{ScanArgs, handle_scan};
pub use similarity::{SimilarityArgs, handle_similarity};
pub use verify::{VerifyArgs, handle_verify};

use nodupe_catalog_redb::RedbCatalog;
use nodupe_core::{CoreContext, SnapshotStore};

pub(crate) fn open_catalog(context: &CoreContext) -> anyhow::Result<RedbCatalog> {
    let config = &context.config().catalog;
    Ok(RedbCatalog::open(&config.path, config.group_commit_ms)?)
}

pub(crate) fn open_snapshot_store(context: &CoreContext) -> anyhow::Result<SnapshotStore> {
    let config = &context.config().snapshot;
    Ok(SnapshotStore::open(&config.root, config.hash_algorithm)?)
}
