//! CLI contract tests for `loopguard-verify`: exit codes and output shape
//! against a small fixture run built directly with `loopguard-core`, not by
//! shelling out to a harness binary that does not exist in this crate.

use assert_cmd::Command;
use loopguard_core::audit::AuditLog;
use loopguard_core::indicators::{build_and_sign, IndicatorConfig, IndicatorPayload};
use loopguard_core::keys::{ensure_keys, KeyPaths};
use loopguard_core::lreg::Derived;
use predicates::prelude::*;
use serde_json::json;
use std::io::Write as _;
use tempfile::TempDir;

fn fixture() -> (TempDir, std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let key_paths = KeyPaths::new(dir.path().join("priv.pem"), dir.path().join("pub.pem"));
    let (signing_key, _) = ensure_keys(&key_paths).expect("generate keys");

    let audit_path = dir.path().join("audit.jsonl");
    let mut audit = AuditLog::with_path(&audit_path).expect("open audit log");
    audit.append("run_header", json!({"profile_id": 0})).expect("append run_header");
    let last = audit.append("window_measured", json!({"m_db": 6.0})).expect("append window_measured");

    let ind_dir = dir.path().join("indicators");
    std::fs::create_dir_all(&ind_dir).expect("create indicator dir");
    let derived = Derived { nc1: true, m_db: 6.0, counter: 1, invalidated: false };
    let payload = IndicatorPayload::build(&derived, &last.hash, IndicatorConfig::default(), true);
    let (cbor, bundle) = build_and_sign(&signing_key, payload).expect("sign payload");
    let jsonl_path = ind_dir.join("ind_1.jsonl");
    let mut file = std::fs::File::create(&jsonl_path).expect("create indicator file");
    writeln!(file, "{}", serde_json::to_string(&bundle).unwrap()).unwrap();
    std::fs::write(ind_dir.join("ind_1.cbor"), &cbor).unwrap();

    (dir, key_paths.pub_path, ind_dir, audit_path)
}

#[test]
fn clean_run_exits_success_and_prints_summary() {
    let (_dir, pub_path, ind_dir, audit_path) = fixture();

    Command::cargo_bin("loopguard-verify")
        .expect("loopguard-verify binary should be built")
        .arg("--pub-key")
        .arg(&pub_path)
        .arg("--ind-dir")
        .arg(&ind_dir)
        .arg("--audit")
        .arg(&audit_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("sigs 1/1"));
}

#[test]
fn json_output_reports_pass_true() {
    let (_dir, pub_path, ind_dir, audit_path) = fixture();

    Command::cargo_bin("loopguard-verify")
        .expect("loopguard-verify binary should be built")
        .arg("--pub-key")
        .arg(&pub_path)
        .arg("--ind-dir")
        .arg(&ind_dir)
        .arg("--audit")
        .arg(&audit_path)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pass\":true"));
}

#[test]
fn missing_audit_file_exits_failure() {
    let (dir, pub_path, ind_dir, _audit_path) = fixture();
    let missing = dir.path().join("does-not-exist.jsonl");

    Command::cargo_bin("loopguard-verify")
        .expect("loopguard-verify binary should be built")
        .arg("--pub-key")
        .arg(&pub_path)
        .arg("--ind-dir")
        .arg(&ind_dir)
        .arg("--audit")
        .arg(&missing)
        .assert()
        .failure()
        .stdout(predicate::str::contains("BROKEN"));
}

#[test]
fn wrong_public_key_exits_failure() {
    let (dir, _pub_path, ind_dir, audit_path) = fixture();
    let other = KeyPaths::new(dir.path().join("other_priv.pem"), dir.path().join("other_pub.pem"));
    ensure_keys(&other).expect("generate other keypair");

    Command::cargo_bin("loopguard-verify")
        .expect("loopguard-verify binary should be built")
        .arg("--pub-key")
        .arg(&other.pub_path)
        .arg("--ind-dir")
        .arg(&ind_dir)
        .arg("--audit")
        .arg(&audit_path)
        .assert()
        .failure();
}
