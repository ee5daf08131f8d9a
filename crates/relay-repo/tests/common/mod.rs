//! Shared helpers for staging store integration tests
//!
//! Every test gets its own store file inside a [`TempDir`] so tests can run
//! in parallel and reopen the same file to simulate a restart.

#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::Result;
use relay_repo::{NewItem, ProxyRepo, RepoConfig};
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_repo=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A store file that outlives individual [`ProxyRepo`] instances
pub struct TestStore {
    dir: TempDir,
}

impl TestStore {
    pub fn new() -> Result<Self> {
        init_tracing();
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("repo.db")
    }

    /// Config with maintenance disabled and the given destinations
    pub fn config(&self, destinations: &[&str]) -> RepoConfig {
        let mut config = RepoConfig::at(self.path());
        config.database.maintenance_interval_secs = None;
        config.forwarding.destinations = destinations.iter().map(|d| d.to_string()).collect();
        config
    }

    pub fn open(&self, destinations: &[&str]) -> Result<ProxyRepo> {
        Ok(ProxyRepo::open(self.config(destinations))?)
    }

    pub fn open_with(&self, config: RepoConfig) -> Result<ProxyRepo> {
        Ok(ProxyRepo::open(config)?)
    }
}

/// Items named `001`, `002`, ... each with a `.meta` and a `.dat` entry
pub fn items(count: usize) -> Vec<NewItem> {
    (1..=count)
        .map(|i| {
            NewItem::new(format!("{:03}", i))
                .entry(".meta", 10)
                .entry(".dat", 100)
        })
        .collect()
}

/// Receive and split one source of `count` items
pub fn receive(repo: &ProxyRepo, file_store_id: i64, feed: &str, count: usize) -> Result<i64> {
    let id = repo
        .sources()
        .add_source(file_store_id, Some(feed), Some("Raw Events"))?
        .id();
    let source = repo
        .sources()
        .get_new_source()?
        .ok_or_else(|| anyhow::anyhow!("source {} was not queued", id))?;
    repo.sources().add_items(source.id, &items(count))?;
    Ok(id)
}
