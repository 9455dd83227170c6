//! Action-level coverage: link replacement, retention moves, and
//! similarity-augmented planning.

use std::os::unix::fs::MetadataExt;

use nodupe_core::apply::ApplyExecutor;
use nodupe_core::planner::Strategy;
use nodupe_core::scan::ScanOptions;
use nodupe_core::types::{Action, Constraints, LinkKind, TxnState};
use nodupe_core::verify::{EntryStatus, Verifier};
use nodupe_core::{Catalog, Error};
use test_utils::{TestEnv, bytes_of};

fn scan_embedded(env: &TestEnv) {
    env.scan_with(ScanOptions {
        roots: vec![env.data_root()],
        embed: true,
        ..ScanOptions::default()
    });
}

#[test]
fn replace_with_hardlink_round_trip() {
    let env = TestEnv::new();
    env.write_file_with_mtime("loser.bin", &bytes_of(0x11, 2048), 100);
    env.write_file_with_mtime("keeper.bin", &bytes_of(0x11, 2048), 200);
    env.scan();

    let plan = env
        .plan_with(
            Strategy::KeepNewestMtime,
            Constraints {
                link_kind: Some(LinkKind::Hard),
                allow_hardlink: true,
                ..Constraints::default()
            },
        )
        .unwrap();
    assert!(matches!(
        plan.actions[0].action,
        Action::ReplaceWithLink {
            link_kind: LinkKind::Hard,
            ..
        }
    ));

    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let applied = executor.apply(&plan, false).unwrap();
    let txn_id = applied.txn_id.unwrap();

    // The loser's path now hardlinks the keeper.
    let loser_meta = std::fs::metadata(env.abs("loser.bin")).unwrap();
    let keeper_meta = std::fs::metadata(env.abs("keeper.bin")).unwrap();
    assert_eq!(loser_meta.ino(), keeper_meta.ino());

    let verifier = Verifier::new(&env.context, &env.catalog, &env.snapshot);
    assert!(verifier.verify(txn_id).unwrap().all_ok);

    // Rollback restores an independent file with the original bytes.
    verifier.rollback(txn_id, None, false).unwrap();
    let restored_meta = std::fs::metadata(env.abs("loser.bin")).unwrap();
    assert_ne!(restored_meta.ino(), keeper_meta.ino());
    assert_eq!(env.read_file("loser.bin"), bytes_of(0x11, 2048));
}

#[test]
fn replace_with_symlink_records_target_and_detects_drift() {
    let env = TestEnv::new();
    env.write_file_with_mtime("loser.bin", &bytes_of(0x22, 512), 100);
    env.write_file_with_mtime("keeper.bin", &bytes_of(0x22, 512), 200);
    env.scan();

    let plan = env
        .plan_with(
            Strategy::KeepNewestMtime,
            Constraints {
                link_kind: Some(LinkKind::Sym),
                allow_symlink: true,
                ..Constraints::default()
            },
        )
        .unwrap();

    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let txn_id = executor.apply(&plan, false).unwrap().txn_id.unwrap();

    let target = std::fs::read_link(env.abs("loser.bin")).unwrap();
    assert_eq!(target, env.abs("keeper.bin"));

    // The symlink target is recorded in the log, not re-derived.
    let entries = env.catalog.txn_entries(txn_id).unwrap();
    assert_eq!(
        entries[0].link_target.as_deref(),
        Some(env.abs("keeper.bin").display().to_string().as_str())
    );

    let verifier = Verifier::new(&env.context, &env.catalog, &env.snapshot);
    assert!(verifier.verify(txn_id).unwrap().all_ok);

    // Repoint the link: that is drift.
    std::fs::remove_file(env.abs("loser.bin")).unwrap();
    std::os::unix::fs::symlink("/etc/hosts", env.abs("loser.bin")).unwrap();

    let report = verifier.verify(txn_id).unwrap();
    assert_eq!(report.entries[0].status, EntryStatus::Drifted);

    // Rollback refuses without force, then restores with it.
    assert!(matches!(
        verifier.rollback(txn_id, None, false),
        Err(Error::Drift(_))
    ));
    verifier.rollback(txn_id, None, true).unwrap();
    assert_eq!(env.read_file("loser.bin"), bytes_of(0x22, 512));
}

#[test]
fn retention_dir_moves_instead_of_deleting() {
    let env = TestEnv::new();
    env.write_file_with_mtime("old.bin", &bytes_of(0x33, 1000), 100);
    env.write_file_with_mtime("new.bin", &bytes_of(0x33, 1000), 200);
    env.scan();

    let retention = env.dir.path().join("trash");
    let plan = env
        .plan_with(
            Strategy::KeepNewestMtime,
            Constraints {
                retention_dir: Some(retention.clone()),
                ..Constraints::default()
            },
        )
        .unwrap();

    let Action::Move { ref dest, .. } = plan.actions[0].action else {
        panic!("expected a Move action, got {:?}", plan.actions[0].action);
    };
    assert!(dest.starts_with(&retention));

    let executor = ApplyExecutor::new(&env.context, &env.catalog, &env.snapshot);
    let txn_id = executor.apply(&plan, false).unwrap().txn_id.unwrap();
    assert!(!env.abs("old.bin").exists());
    assert_eq!(std::fs::read(dest).unwrap(), bytes_of(0x33, 1000));

    let verifier = Verifier::new(&env.context, &env.catalog, &env.snapshot);
    assert!(verifier.verify(txn_id).unwrap().all_ok);

    let report = verifier.rollback(txn_id, None, false).unwrap();
    assert_eq!(report.state_after, TxnState::RolledBack);
    assert_eq!(env.read_file("old.bin"), bytes_of(0x33, 1000));
    assert!(!dest.exists());
}

#[test]
fn must_not_delete_conflicts_and_retention_resolves_it() {
    let env = TestEnv::new();
    env.write_file_with_mtime("keep-me/a.bin", &bytes_of(0x44, 300), 100);
    env.write_file_with_mtime("b.bin", &bytes_of(0x44, 300), 200);
    env.scan();

    let result = env.plan_with(
        Strategy::KeepNewestMtime,
        Constraints {
            must_not_delete: vec!["keep-me/**".into()],
            ..Constraints::default()
        },
    );
    assert!(matches!(result, Err(Error::PlanConflict(_))));

    // With a retention dir the loser is moved, which the constraint allows.
    let plan = env
        .plan_with(
            Strategy::KeepNewestMtime,
            Constraints {
                must_not_delete: vec!["keep-me/**".into()],
                retention_dir: Some(env.dir.path().join("trash")),
                ..Constraints::default()
            },
        )
        .unwrap();
    assert!(matches!(plan.actions[0].action, Action::Move { .. }));
}

#[test]
fn scan_embed_stores_refcounted_vectors() {
    let env = TestEnv::new();
    env.write_file("one.dat", &bytes_of(1, 64));
    env.write_file("two.dat", &bytes_of(2, 64));
    scan_embedded(&env);

    let embeddings = env.catalog.list_embeddings().unwrap();
    assert_eq!(embeddings.len(), 2);
    assert!(embeddings.iter().all(|(_, v)| v.len() == 384));

    for record in env.catalog.list_files(None).unwrap() {
        let embedding_id = record.embedding_id.expect("embedded during scan");
        let stored = env.catalog.get_embedding(embedding_id).unwrap().unwrap();
        assert_eq!(stored.refcount, 1);
        let magnitude: f32 = stored.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.001);
    }

    // A rescan reuses the stored vectors instead of inserting new rows.
    scan_embedded(&env);
    assert_eq!(env.catalog.list_embeddings().unwrap().len(), 2);
}

#[test]
fn similarity_clusters_augment_the_plan() {
    let env = TestEnv::new();
    // Distinct contents: no exact-content classes at all.
    env.write_file_with_mtime("x.dat", &bytes_of(7, 128), 100);
    env.write_file_with_mtime("y.dat", &bytes_of(8, 256), 200);
    scan_embedded(&env);

    // Without similarity the plan is empty.
    let plain = env.plan(Strategy::KeepNewestMtime).unwrap();
    assert!(plain.actions.is_empty());

    // A floor threshold puts every vector in one cluster, which becomes a
    // duplicate class with one keeper.
    let plan = nodupe_core::Planner::new(&env.catalog)
        .build_plan(&nodupe_core::PlannerOptions {
            strategy: Strategy::KeepNewestMtime,
            constraints: Constraints::default(),
            similarity_threshold: Some(-1.0),
        })
        .unwrap();
    assert_eq!(plan.actions.len(), 1);
    // y is newer, so x is the loser.
    let loser = env.catalog.find_by_key(1, "x.dat").unwrap().unwrap();
    assert_eq!(plan.actions[0].action.file_id(), loser.file_id);
}
