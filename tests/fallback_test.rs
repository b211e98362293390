use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[cfg(not(feature = "storage-rocksdb"))]
#[test]
fn test_rocksdb_fallback_warning() {
    let mut cmd = Command::new(cargo_bin!("payroll-engine"));
    cmd.env("RUST_LOG", "warn")
        .arg("--db-path")
        .arg("some_db")
        .arg("history");

    cmd.assert()
        .success()
        .stderr(predicate::str::contains(
            "built without storage-rocksdb; falling back to in-memory ledger",
        ));
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_rocksdb_no_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    let mut cmd = Command::new(cargo_bin!("payroll-engine"));
    cmd.env("RUST_LOG", "warn")
        .arg("--db-path")
        .arg(&db_path)
        .arg("history");

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("falling back").not());
}
