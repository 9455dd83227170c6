//! CLI surface tests: exit codes and the full scan → plan → apply →
//! verify → rollback workflow through the binary.

use assert_cmd::Command;
use predicates::prelude::*;

struct CliEnv {
    dir: tempfile::TempDir,
}

impl CliEnv {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(
            dir.path().join("nodupe.toml"),
            format!(
                "[catalog]\npath = \"{}\"\n\n[snapshot]\nroot = \"{}\"\n",
                dir.path().join("catalog.redb").display(),
                dir.path().join("snapshots").display(),
            ),
        )
        .unwrap();
        Self { dir }
    }

    fn write(&self, relative: &str, content: &[u8], mtime_secs: i64) {
        let path = self.dir.path().join("data").join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        filetime::set_file_mtime(
            &path,
            filetime::FileTime::from_unix_time(mtime_secs, 0),
        )
        .unwrap();
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("nodupe").unwrap();
        cmd.arg("--config")
            .arg(self.dir.path().join("nodupe.toml"));
        cmd
    }

    fn data(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }
}

#[test]
fn missing_required_arguments_exit_2() {
    Command::cargo_bin("nodupe")
        .unwrap()
        .assert()
        .failure()
        .code(2);

    Command::cargo_bin("nodupe")
        .unwrap()
        .arg("scan")
        .assert()
        .failure()
        .code(2);

    Command::cargo_bin("nodupe")
        .unwrap()
        .arg("plan")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_strategy_exits_2() {
    let env = CliEnv::new();
    env.cmd()
        .args(["plan", "keep_everything_forever"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown strategy"));
}

#[test]
fn scan_reports_summary() {
    let env = CliEnv::new();
    env.write("a.bin", &[0x41; 1024], 1_000);
    env.write("b.bin", &[0x41; 1024], 2_000);

    env.cmd()
        .arg("scan")
        .arg(env.data())
        .assert()
        .success()
        .stdout(predicate::str::contains("2 files visited"));
}

#[test]
fn full_workflow_scan_plan_apply_verify_rollback() {
    let env = CliEnv::new();
    env.write("a.bin", &[0x41; 1024], 1_000);
    env.write("b.bin", &[0x41; 1024], 2_000);
    env.write("c.bin", &[0x42; 1024], 1_500);

    env.cmd().arg("scan").arg(env.data()).assert().success();

    let plan_path = env.dir.path().join("plan.json");
    env.cmd()
        .args(["plan", "keep_newest_mtime", "--out"])
        .arg(&plan_path)
        .assert()
        .success();

    // The artifact is stable JSON with one Delete for the older twin.
    let plan_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&plan_path).unwrap()).unwrap();
    assert_eq!(plan_json["actions"].as_array().unwrap().len(), 1);
    assert_eq!(plan_json["actions"][0]["kind"], "Delete");

    // Dry run mutates nothing.
    env.cmd()
        .args(["apply", "--dry-run"])
        .arg(&plan_path)
        .assert()
        .success();
    assert!(env.data().join("a.bin").exists());

    let output = env
        .cmd()
        .args(["--format", "json", "apply"])
        .arg(&plan_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let outcome: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let txn_id = outcome["txn_id"].as_str().unwrap().to_string();
    assert!(!env.data().join("a.bin").exists());

    env.cmd()
        .arg("verify")
        .arg(&txn_id)
        .assert()
        .success();

    env.cmd()
        .arg("rollback")
        .arg(&txn_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("rolled_back"));
    assert_eq!(std::fs::read(env.data().join("a.bin")).unwrap(), vec![0x41; 1024]);
}

#[test]
fn verify_detects_drift_with_exit_1() {
    let env = CliEnv::new();
    env.write("d.bin", &[0x44; 512], 1_000);
    env.write("e.bin", &[0x44; 512], 2_000);

    env.cmd().arg("scan").arg(env.data()).assert().success();

    let plan_path = env.dir.path().join("plan.json");
    env.cmd()
        .args(["plan", "keep_newest_mtime", "--out"])
        .arg(&plan_path)
        .assert()
        .success();
    env.cmd().arg("apply").arg(&plan_path).assert().success();

    // Recreate the deleted file with different bytes.
    env.write("d.bin", b"drifted", 3_000);

    env.cmd()
        .arg("verify")
        .arg(&plan_path)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("drifted"));
}

#[test]
fn apply_refuses_stale_plan_without_force() {
    let env = CliEnv::new();
    env.write("a.bin", &[1u8; 256], 1_000);
    env.write("b.bin", &[1u8; 256], 2_000);

    env.cmd().arg("scan").arg(env.data()).assert().success();

    let plan_path = env.dir.path().join("plan.json");
    env.cmd()
        .args(["plan", "keep_newest_mtime", "--out"])
        .arg(&plan_path)
        .assert()
        .success();

    // A fresh scan bumps the epoch past the plan's.
    env.cmd().arg("scan").arg(env.data()).assert().success();

    env.cmd()
        .arg("apply")
        .arg(&plan_path)
        .assert()
        .failure()
        .code(1);
    assert!(env.data().join("a.bin").exists());
}

#[test]
fn similarity_requires_query_or_cluster() {
    let env = CliEnv::new();
    env.cmd()
        .arg("similarity")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn plan_conflict_exits_1_without_writing_a_plan() {
    let env = CliEnv::new();
    env.write("x.bin", &[0x33; 2048], 1_000);
    env.write("keep/y.bin", &[0x33; 2048], 1_000);

    env.cmd().arg("scan").arg(env.data()).assert().success();

    let plan_path = env.dir.path().join("plan.json");
    env.cmd()
        .args(["plan", "keep_shortest_path", "--keep", "keep/**", "--out"])
        .arg(&plan_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("must_keep_would_be_removed"));
    assert!(!plan_path.exists());
}
