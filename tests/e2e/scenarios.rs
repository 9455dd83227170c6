//! End-to-end scenarios: scan → plan → apply → verify → rollback against
//! real directory trees.

use nodupe_core::apply::ApplyExecutor;
use nodupe_core::planner::Strategy;
use nodupe_core::scan::ScanOptions;
use nodupe_core::snapshot::SnapshotBackend;
use nodupe_core::types::{Constraints, PostState, TxnState};
use nodupe_core::verify::{EntryStatus, RollbackStatus, Verifier};
use nodupe_core::{Catalog, Error};
use test_utils::{TestEnv, bytes_of};

/// S1: delete strategy round trip: scan, plan, apply, rollback, re-scan.
#[test]
fn s1_scan_plan_apply_rollback_delete_strategy() {
    let env = TestEnv::new();
    env.write_file_with_mtime("a.bin", &bytes_of(0x41, 1024), 1_000);
    env.write_file_with_mtime("b.bin", &bytes_of(0x41, 1024), 2_000);
    env.write_file_with_mtime("c.bin", &bytes_of(0x42, 1024), 1_500);

    let outcome = env.scan();
    assert_eq!(outcome.committed, 3);
    assert!(!outcome.cancelled);

    // Full hashes for the quick-collision pair only; c shares the size
    // but not the quick hash.
    let a = env.catalog.find_by_key(1, "a.bin").unwrap().unwrap();
    let b = env.catalog.find_by_key(1, "b.bin").unwrap().unwrap();
    let c = env.catalog.find_by_key(1, "c.bin").unwrap().unwrap();
    assert!(a.full_hash.is_some());
    assert!(b.full_hash.is_some());
    assert!(c.full_hash.is_none());

    let plan = env.plan(Strategy::KeepNewestMtime).unwrap();
    assert_eq!(plan.actions.len(), 1);
    // b is newer, so a is the loser.
    assert_eq!(plan.actions[0].action.file_id(), a.file_id);

    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let applied = executor.apply(&plan, false).unwrap();
    let txn_id = applied.txn_id.unwrap();
    assert_eq!(applied.state, Some(TxnState::Committed));
    assert!(!env.abs("a.bin").exists());
    assert!(env.abs("b.bin").exists());

    // One snapshot object, content-addressed to the deleted bytes.
    let pre_image = applied.entries[0].pre_image_ref.clone().unwrap();
    let (mut reader, meta) = env.snapshot.open_verified(&pre_image).unwrap();
    let mut restored = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut restored).unwrap();
    assert_eq!(restored, bytes_of(0x41, 1024));
    assert_eq!(meta.bytes_len, 1024);

    let verifier = Verifier::new(&env.context, &env.catalog, &env.snapshot);
    let report = verifier.rollback(txn_id, None, false).unwrap();
    assert_eq!(report.state_after, TxnState::RolledBack);
    assert_eq!(env.read_file("a.bin"), bytes_of(0x41, 1024));

    // Restored mtime matches the original (second precision pinned above).
    let restored_mtime = std::fs::metadata(env.abs("a.bin"))
        .unwrap()
        .modified()
        .unwrap();
    let expected = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000);
    assert_eq!(restored_mtime, expected);

    // Re-scan sees the original three records again.
    env.scan();
    assert_eq!(env.present_paths(), vec!["a.bin", "b.bin", "c.bin"]);
}

/// S2: cancellation mid-scan checkpoints; resume finishes the walk with
/// no duplicate rows per (root, relative_path).
#[test]
fn s2_resume_after_cancellation() {
    let env = TestEnv::new();
    const TOTAL: usize = 10_000;
    for i in 0..TOTAL {
        env.write_file(&format!("d{:02}/f{:05}.bin", i % 100, i), format!("{i}").as_bytes());
    }

    // Cancel once a few thousand rows have committed. The watcher polls
    // through the same catalog handle (redb holds the file lock).
    let cancel = env.context.cancel_token().clone();
    let first = std::thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if env.catalog.statistics().unwrap().file_count >= 3_000 {
                    cancel.cancel();
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        });
        let outcome = env.scan();
        cancel.cancel();
        let _ = watcher.join();
        outcome
    });

    if first.cancelled {
        let checkpoint = env.catalog.load_checkpoint(1).unwrap().expect("checkpoint");
        assert!(!checkpoint.last_completed_subpath.is_empty());
        assert!(first.committed < TOTAL as u64);

        // The first context's token is spent; resume reuses the same
        // catalog under a fresh context.
        let context = nodupe_core::CoreContext::new(env.context.config().clone()).unwrap();
        let second = nodupe_core::ScanOrchestrator::new(&context, &env.catalog)
            .scan(&ScanOptions {
                roots: vec![env.data_root()],
                resume: true,
                ..ScanOptions::default()
            })
            .unwrap();
        assert!(!second.cancelled);
        assert_eq!(second.committed, TOTAL as u64);
    }

    let records = env.catalog.list_files(None).unwrap();
    assert_eq!(records.len(), TOTAL);

    let mut keys: Vec<(u32, String)> = records
        .iter()
        .map(|r| (r.root_id, r.relative_path.clone()))
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), TOTAL, "no duplicate rows per key");

    let mut ids: Vec<u64> = records.iter().map(|r| r.file_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), TOTAL, "no duplicate file ids");
}

/// S3: a must-keep file that the strategy would remove rejects the plan.
#[test]
fn s3_plan_conflict_on_must_keep_violation() {
    let env = TestEnv::new();
    env.write_file("x.bin", &bytes_of(0x33, 2048));
    env.write_file("keep/y.bin", &bytes_of(0x33, 2048));
    env.scan();

    // Shortest path keeps x; y would be removed but is protected.
    let result = env.plan_with(
        Strategy::KeepShortestPath,
        Constraints {
            must_keep: vec!["keep/**".into()],
            ..Constraints::default()
        },
    );

    match result {
        Err(Error::PlanConflict(message)) => {
            assert!(message.contains("must_keep_would_be_removed"), "{message}");
        }
        other => panic!("expected PlanConflict, got {other:?}"),
    }
}

/// S4: post-apply drift is detected by verify and repaired by --fix.
#[test]
fn s4_drift_detected_at_verify_and_fixed() {
    let env = TestEnv::new();
    env.write_file_with_mtime("d.bin", &bytes_of(0x44, 512), 1_000);
    env.write_file_with_mtime("keeper.bin", &bytes_of(0x44, 512), 2_000);
    env.scan();

    let plan = env.plan(Strategy::KeepNewestMtime).unwrap();
    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let applied = executor.apply(&plan, false).unwrap();
    let txn_id = applied.txn_id.unwrap();
    assert!(!env.abs("d.bin").exists());

    // A user recreates the deleted path with different bytes.
    env.write_file("d.bin", b"something else entirely");

    let verifier = Verifier::new(&env.context, &env.catalog, &env.snapshot);
    let report = verifier.verify(txn_id).unwrap();
    assert!(!report.all_ok);
    assert_eq!(report.entries[0].status, EntryStatus::Drifted);

    // --fix restores the pre-image over the drifted file.
    let (_, rollback) = verifier.fix(txn_id).unwrap();
    let rollback = rollback.expect("drift should trigger rollback");
    assert_eq!(rollback.entries[0].status, RollbackStatus::Overwritten);
    assert_eq!(env.read_file("d.bin"), bytes_of(0x44, 512));
}

/// S5: progressive hashing: only collision-group members are ever
/// full-hashed; unique sizes never are.
#[test]
fn s5_progressive_hashing_correctness() {
    let env = TestEnv::new();

    // 100 files with unique sizes.
    for i in 0..100u64 {
        env.write_file(&format!("unique/u{i:03}.bin"), &bytes_of(0x55, 200 + i as usize));
    }
    // 10 groups of 10 identical files, all the same size.
    for group in 0..10u8 {
        for member in 0..10 {
            env.write_file(
                &format!("dup/g{group}/m{member}.bin"),
                &bytes_of(0x60 + group, 8192),
            );
        }
    }

    let outcome = env.scan();
    assert_eq!(outcome.committed, 200);
    assert_eq!(outcome.full_hashed, 100, "exactly the group members");

    for record in env.catalog.list_files(None).unwrap() {
        if record.relative_path.starts_with("unique/") {
            assert!(
                record.full_hash.is_none(),
                "{} has a unique size and must not be full-hashed",
                record.relative_path
            );
        } else {
            assert!(record.full_hash.is_some(), "{}", record.relative_path);
        }
    }

    let algo = outcome.hash_algo;
    let buckets = env.catalog.iter_hash_buckets(algo, 2).unwrap();
    assert_eq!(buckets.len(), 10);
    assert!(buckets.iter().all(|(_, _, members)| members.len() == 10));
}

/// S6: byte-identical victims deduplicate into one snapshot object whose
/// refcount counts every reference.
#[test]
fn s6_snapshot_deduplication() {
    let env = TestEnv::new();
    for name in ["one.bin", "two.bin", "three.bin", "keeper.bin"] {
        env.write_file(name, &bytes_of(0x77, 4096));
    }
    // Make keeper.bin newest so the other three are losers.
    env.write_file_with_mtime("keeper.bin", &bytes_of(0x77, 4096), 4_000_000_000);
    env.scan();

    let plan = env.plan(Strategy::KeepNewestMtime).unwrap();
    assert_eq!(plan.actions.len(), 3);

    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let applied = executor.apply(&plan, false).unwrap();
    assert_eq!(applied.state, Some(TxnState::Committed));
    assert!(applied
        .entries
        .iter()
        .all(|e| e.post_state == PostState::Done));

    // All three pre-images share one content hash.
    let hashes: Vec<String> = applied
        .entries
        .iter()
        .map(|e| e.pre_image_ref.clone().unwrap())
        .collect();
    assert!(hashes.iter().all(|h| h == &hashes[0]));

    // Exactly one object on disk, refcount 3.
    let mut objects = 0usize;
    for shard in std::fs::read_dir(env.snapshot.root().join("content")).unwrap() {
        for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
            let name = entry.unwrap().file_name();
            if !name.to_string_lossy().ends_with(".meta") {
                objects += 1;
            }
        }
    }
    assert_eq!(objects, 1);
    assert_eq!(env.catalog.snapshot_refcount(&hashes[0]).unwrap(), 3);
}
