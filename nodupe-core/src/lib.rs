#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::float_cmp)]

//! # NoDupe Core
//!
//! Core engines for the NoDupeLabs local file-deduplication system.
//!
//! This crate provides the four tightly coupled subsystems behind the CLI:
//!
//! ## Core Concepts
//!
//! - **Scan pipeline**: a parallel, cancellable, resumable walker + hasher
//!   feeding a content catalog, with auto-tuned algorithm selection and
//!   progressive hashing (size → quick hash → full hash, only as needed)
//! - **Planner**: deterministic duplicate resolution: classes, keeper
//!   selection under a strategy, a totally ordered action plan
//! - **Snapshot store**: content-addressable pre-images shared by all
//!   transactions
//! - **Apply + rollback**: a two-phase executor producing a transaction
//!   log sufficient to reverse any subset of operations
//!
//! ## Module Organization
//!
//! ### Primary APIs
//! - [`scan`]: the scan orchestrator (Walker → hashers → catalog writer)
//! - [`planner`]: duplicate classes, strategies, the plan artifact
//! - [`apply`]: transactional plan execution
//! - [`verify`]: post-hoc verification and rollback
//!
//! ### Support Modules
//! - [`catalog`]: the storage seam implemented by `nodupe-catalog-redb`
//! - [`snapshot`]: the content-addressable pre-image store
//! - [`hash`] / [`hasher`]: algorithm registry and fingerprinting
//! - [`similarity`]: the brute-force reference nearest-neighbor index
//! - [`context`] / [`registry`]: explicit dependency wiring, no globals
//!
//! ## Quick Start
//!
//! ```no_run
//! use nodupe_core::config::CoreConfig;
//! use nodupe_core::context::CoreContext;
//! use nodupe_core::scan::{ScanOptions, ScanOrchestrator};
//!
//! # fn example(catalog: &dyn nodupe_core::catalog::Catalog) -> nodupe_core::Result<()> {
//! let context = CoreContext::new(CoreConfig::default())?;
//! let orchestrator = ScanOrchestrator::new(&context, catalog);
//! let outcome = orchestrator.scan(&ScanOptions {
//!     roots: vec!["/data/photos".into()],
//!     ..ScanOptions::default()
//! })?;
//! println!("scanned {} files", outcome.committed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every public boundary returns [`Result<T>`]; per-file failures during a
//! scan are recorded on the catalog row and never abort the run, while
//! apply fails fast and leaves a `partial` transaction for diagnosis.

pub mod apply;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod context;
pub mod embed;
pub mod error;
pub mod hash;
pub mod hasher;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod scan;
pub mod similarity;
pub mod snapshot;
pub mod types;
pub mod verify;
pub mod walker;

// Re-export commonly used types
pub use apply::{ApplyExecutor, ApplyOutcome};
pub use cancel::CancelToken;
pub use catalog::Catalog;
pub use config::{CoreConfig, MediaProfile, OnMissing};
pub use context::CoreContext;
pub use embed::{EmbeddingModel, PseudoEmbeddingModel};
pub use error::{Error, Result};
pub use hash::{HashAlgo, HashAlgorithm};
pub use hasher::{BufferPool, Hasher};
pub use planner::{Planner, PlannerOptions, Strategy};
pub use registry::BackendRegistry;
pub use retry::{RetryConfig, RetryPolicy};
pub use scan::{ScanOptions, ScanOrchestrator, ScanOutcome};
pub use similarity::{BruteForceIndex, SimilarityBackend};
pub use snapshot::{NullSnapshotStore, SnapshotBackend, SnapshotStore};
pub use types::{
    Action, CandidateEntry, CatalogStatistics, ClassKey, Constraints, DuplicateClass,
    EmbeddingId, EmbeddingRecord, EntryStat, FileId, FileRecord, FileState, LinkKind, Plan,
    PlanAction, PlanId, PostState, RootId, ScanCheckpoint, SnapshotMeta, StrategyDescriptor,
    Transaction, TxnEntry, TxnId, TxnState,
};
pub use verify::{VerifyReport, Verifier};
pub use walker::{WalkItem, Walker, WalkerOptions};
