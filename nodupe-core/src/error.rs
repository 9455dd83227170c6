use std::path::PathBuf;
use std::time::Duration;

use crate::types::TxnId;

/// Result type alias for dedup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the deduplication core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Cross-device operation not permitted: {0}")]
    CrossDevice(PathBuf),

    #[error("No space left on device writing {0}")]
    NoSpace(PathBuf),

    #[error("Snapshot object corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Catalog corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Hashing failed for {path}: {code}")]
    HashFailed { path: PathBuf, code: String },

    #[error("Plan conflict: {0}")]
    PlanConflict(String),

    #[error("Plan invalid: {0}")]
    PlanInvalid(String),

    #[error("Apply failed, transaction {txn_id} is {state}: {reason}")]
    ApplyFailed {
        txn_id: TxnId,
        state: &'static str,
        reason: String,
    },

    #[error("Drift detected: {0}")]
    Drift(String),

    #[error("Transaction already open: {0}")]
    TransactionAlreadyOpen(TxnId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(e) => is_transient_io(e),
            Error::Timeout(_) => true,
            Error::Catalog(_) => true,
            Error::InvalidInput(_)
            | Error::AccessDenied(_)
            | Error::NotFound(_)
            | Error::CrossDevice(_)
            | Error::NoSpace(_)
            | Error::SnapshotCorrupt(_)
            | Error::CatalogCorrupt(_)
            | Error::HashFailed { .. }
            | Error::PlanConflict(_)
            | Error::PlanInvalid(_)
            | Error::ApplyFailed { .. }
            | Error::Drift(_)
            | Error::TransactionAlreadyOpen(_)
            | Error::Cancelled
            | Error::Serialization(_)
            | Error::Internal(_) => false,
        }
    }

    /// Classify a raw IO error against the path it touched.
    ///
    /// Maps the errno values the executor cares about onto the public
    /// taxonomy; everything else stays a plain `Io`.
    pub fn from_io(e: std::io::Error, path: &std::path::Path) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::PermissionDenied => Error::AccessDenied(path.to_path_buf()),
            ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
            _ => match e.raw_os_error() {
                Some(code) if code == libc::EXDEV => Error::CrossDevice(path.to_path_buf()),
                Some(code) if code == libc::ENOSPC => Error::NoSpace(path.to_path_buf()),
                _ => Error::Io(e),
            },
        }
    }

    /// Short machine-readable code stored on catalog rows and txn entries.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::AccessDenied(_) => "access_denied",
            Error::NotFound(_) => "not_found",
            Error::CrossDevice(_) => "cross_device",
            Error::NoSpace(_) => "no_space",
            Error::SnapshotCorrupt(_) => "snapshot_corrupt",
            Error::CatalogCorrupt(_) => "catalog_corrupt",
            Error::Catalog(_) => "catalog",
            Error::HashFailed { .. } => "hash_failed",
            Error::PlanConflict(_) => "plan_conflict",
            Error::PlanInvalid(_) => "plan_invalid",
            Error::ApplyFailed { .. } => "apply_failed",
            Error::Drift(_) => "drift",
            Error::TransactionAlreadyOpen(_) => "txn_already_open",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

/// EAGAIN and EBUSY are retried by the apply executor; everything else is
/// surfaced on first failure.
fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::EAGAIN || code == libc::EBUSY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_recoverable() {
        let eagain = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(Error::Io(eagain).is_recoverable());

        let ebusy = std::io::Error::from_raw_os_error(libc::EBUSY);
        assert!(Error::Io(ebusy).is_recoverable());

        let enoent = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert!(!Error::Io(enoent).is_recoverable());
    }

    #[test]
    fn integrity_errors_never_retry() {
        assert!(!Error::SnapshotCorrupt("x".into()).is_recoverable());
        assert!(!Error::CatalogCorrupt("x".into()).is_recoverable());
    }

    #[test]
    fn io_classification_maps_errno() {
        let path = std::path::Path::new("/tmp/x");
        let e = Error::from_io(std::io::Error::from_raw_os_error(libc::EXDEV), path);
        assert!(matches!(e, Error::CrossDevice(_)));

        let e = Error::from_io(std::io::Error::from_raw_os_error(libc::ENOSPC), path);
        assert!(matches!(e, Error::NoSpace(_)));
    }
}
