//! # Test Utilities
//!
//! Shared test fixtures for the NoDupeLabs workspace.
//!
//! Provides:
//! - A disposable environment (data root + catalog + snapshot store)
//! - Deterministic file tree builders
//! - Convenience wrappers over scan and plan

use std::path::{Path, PathBuf};

use filetime::FileTime;
use nodupe_catalog_redb::RedbCatalog;
use nodupe_core::config::CoreConfig;
use nodupe_core::planner::{Planner, PlannerOptions, Strategy};
use nodupe_core::scan::{ScanOptions, ScanOrchestrator, ScanOutcome};
use nodupe_core::snapshot::SnapshotStore;
use nodupe_core::types::{Constraints, Plan};
use nodupe_core::{Catalog, CoreContext};

/// A disposable on-disk environment: `data/` to scan, a catalog and a
/// snapshot store, all under one temp directory.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub context: CoreContext,
    pub catalog: RedbCatalog,
    pub snapshot: SnapshotStore,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(mut config: CoreConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("data")).expect("create data root");

        config.catalog.path = dir.path().join("catalog.redb");
        config.snapshot.root = dir.path().join("snapshots");

        let snapshot = SnapshotStore::open(&config.snapshot.root, config.snapshot.hash_algorithm)
            .expect("open snapshot store");
        let catalog =
            RedbCatalog::open(&config.catalog.path, config.catalog.group_commit_ms)
                .expect("open catalog");
        let context = CoreContext::new(config).expect("build context");

        Self {
            dir,
            context,
            catalog,
            snapshot,
        }
    }

    /// The directory scans run against.
    pub fn data_root(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn abs(&self, relative: &str) -> PathBuf {
        self.data_root().join(relative)
    }

    /// Write a file under the data root, creating parents.
    pub fn write_file(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.abs(relative);
        write_file(&path, content);
        path
    }

    /// Write a file and pin its mtime (seconds since the epoch).
    pub fn write_file_with_mtime(&self, relative: &str, content: &[u8], mtime_secs: i64) -> PathBuf {
        let path = self.write_file(relative, content);
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0))
            .expect("set mtime");
        path
    }

    pub fn read_file(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.abs(relative)).expect("read file")
    }

    /// Scan the data root with default options.
    pub fn scan(&self) -> ScanOutcome {
        self.scan_with(ScanOptions {
            roots: vec![self.data_root()],
            ..ScanOptions::default()
        })
    }

    pub fn scan_with(&self, options: ScanOptions) -> ScanOutcome {
        ScanOrchestrator::new(&self.context, &self.catalog)
            .scan(&options)
            .expect("scan")
    }

    /// Build a plan over the whole catalog with the given strategy.
    pub fn plan(&self, strategy: Strategy) -> nodupe_core::Result<Plan> {
        self.plan_with(strategy, Constraints::default())
    }

    pub fn plan_with(
        &self,
        strategy: Strategy,
        constraints: Constraints,
    ) -> nodupe_core::Result<Plan> {
        Planner::new(&self.catalog).build_plan(&PlannerOptions {
            strategy,
            constraints,
            similarity_threshold: None,
        })
    }

    /// Relative paths of all present records, sorted.
    pub fn present_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .catalog
            .list_files(None)
            .expect("list files")
            .into_iter()
            .filter(|r| r.state == nodupe_core::FileState::Present)
            .map(|r| r.relative_path)
            .collect();
        paths.sort();
        paths
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `content` at `path`, creating parent directories.
pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parents");
    }
    std::fs::write(path, content).expect("write file");
}

/// A buffer of `len` bytes all equal to `byte`.
pub fn bytes_of(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}
