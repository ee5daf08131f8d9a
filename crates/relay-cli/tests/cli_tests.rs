//! End-to-end tests for the relay binary
//!
//! Each test points the binary at a fresh store file through
//! `RELAY_DB_PATH` and seeds data with the library directly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use relay_repo::{NewItem, ProxyRepo, RepoConfig};
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn store() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.db");
    (dir, path)
}

/// `relay` with a clean environment rooted in the temp dir
fn relay(dir: &TempDir, db: &Path, destinations: &str) -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.current_dir(dir.path())
        .env("RELAY_DB_PATH", db)
        .env("RELAY_FORWARD_DESTINATIONS", destinations)
        .env_remove("RELAY_FORWARD_DIRECT")
        .env_remove("RELAY_MAX_ITEMS_PER_AGGREGATE")
        .env_remove("RELAY_LOG_OUTPUT");
    cmd
}

/// Receive and split one source of `count` items
fn seed(db: &Path, count: usize) {
    seed_with(db, &[], count);
}

fn seed_with(db: &Path, destinations: &[&str], count: usize) -> ProxyRepo {
    let mut config = RepoConfig::at(db);
    config.database.maintenance_interval_secs = None;
    config.forwarding.destinations = destinations.iter().map(|d| d.to_string()).collect();
    let repo = ProxyRepo::open(config).unwrap();

    let id = repo
        .sources()
        .add_source(1, Some("TEST-FEED"), Some("Raw Events"))
        .unwrap()
        .id();
    let source = repo.sources().get_new_source().unwrap().unwrap();
    assert_eq!(source.id, id);

    let items: Vec<NewItem> = (1..=count)
        .map(|i| NewItem::new(format!("{:03}", i)).entry(".dat", 100))
        .collect();
    repo.sources().add_items(id, &items).unwrap();
    repo
}

fn status_json(dir: &TempDir, db: &Path, destinations: &str) -> serde_json::Value {
    let output = relay(dir, db, destinations)
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

// ============================================================================
// Argument handling
// ============================================================================

#[test]
fn test_no_arguments_prints_help() {
    Command::cargo_bin("relay")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_clear_requires_confirmation() {
    let (dir, db) = store();

    relay(&dir, &db, "")
        .arg("clear")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_status_json_on_empty_store() {
    let (dir, db) = store();

    let stats = status_json(&dir, &db, "");
    assert_eq!(stats["sources"], 0);
    assert_eq!(stats["aggregates"], 0);
    assert!(db.exists());
}

#[test]
fn test_status_table() {
    let (dir, db) = store();
    seed(&db, 2);

    relay(&dir, &db, "")
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Aggregate forwards"))
        .stdout(predicate::str::contains("Sources"));
}

#[test]
fn test_destinations_lists_configured() {
    let (dir, db) = store();
    drop(seed_with(&db, &["http://a/datafeed", "http://b/datafeed"], 1));

    relay(&dir, &db, "http://a/datafeed")
        .arg("destinations")
        .assert()
        .success()
        .stdout(predicate::str::contains("http://a/datafeed"))
        .stdout(predicate::str::contains("http://b/datafeed"))
        .stdout(predicate::str::contains("active"))
        .stdout(predicate::str::contains("retired"));
}

#[test]
fn test_destinations_without_configuration_retires_nothing() {
    let (dir, db) = store();
    drop(seed_with(&db, &["http://a/datafeed"], 1));

    relay(&dir, &db, "")
        .arg("destinations")
        .assert()
        .success()
        .stdout(predicate::str::contains("unconfigured"))
        .stdout(predicate::str::contains("retired").not());
}

#[test]
fn test_status_does_not_reconcile_destinations() {
    let (dir, db) = store();
    {
        let repo = seed_with(&db, &["http://a/datafeed", "http://b/datafeed"], 2);
        repo.aggregate_new_items().unwrap();
        repo.close_all_aggregates().unwrap();
        assert_eq!(repo.create_forward_records().unwrap(), 2);
    }

    // Only A configured: a mutating open would drop B's row.
    let stats = status_json(&dir, &db, "http://a/datafeed");
    assert_eq!(stats["aggregates"], 1);
    assert_eq!(stats["forward_aggregates"], 2);
    assert_eq!(stats["items"], 2);

    let stats = status_json(&dir, &db, "http://elsewhere/datafeed");
    assert_eq!(stats["forward_aggregates"], 2);
    assert_eq!(stats["forward_dests"], 2);
}

#[test]
fn test_close_all_fans_out() {
    let (dir, db) = store();
    seed(&db, 3);

    relay(&dir, &db, "http://a/datafeed")
        .args(["close", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Aggregated 3 item(s)"))
        .stdout(predicate::str::contains("Closed 1 aggregate(s)"));

    let stats = status_json(&dir, &db, "http://a/datafeed");
    assert_eq!(stats["open_aggregates"], 0);
    assert_eq!(stats["forward_aggregates"], 1);
    assert_eq!(stats["forward_aggregates_new"], 1);
}

#[test]
fn test_run_once_reports_pass() {
    let (dir, db) = store();
    seed(&db, 1);

    relay(&dir, &db, "")
        .args(["run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Items aggregated:        1"));
}

#[test]
fn test_clear_with_yes_empties_store() {
    let (dir, db) = store();
    seed(&db, 2);

    relay(&dir, &db, "")
        .args(["clear", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared"));

    let stats = status_json(&dir, &db, "");
    assert_eq!(stats["sources"], 0);
    assert_eq!(stats["items"], 0);
}

#[test]
fn test_maintain_and_sweep() {
    let (dir, db) = store();

    relay(&dir, &db, "")
        .arg("maintain")
        .assert()
        .success()
        .stdout(predicate::str::contains("maintenance statement"));

    relay(&dir, &db, "")
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 0 source(s)"));
}
