//! Command implementations
//!
//! The store is synchronous; every command opens it and does its work on
//! the blocking pool. Commands that only look use [`inspect_repo`], which
//! leaves the store exactly as it found it.

pub mod clear;
pub mod close;
pub mod destinations;
pub mod maintain;
pub mod reset_failed;
pub mod run;
pub mod status;
pub mod sweep;

use relay_repo::{ProxyRepo, RepoConfig};

use crate::error::Result;

/// Open the store and run `f` against it off the async runtime
pub(crate) async fn with_repo<T, F>(config: RepoConfig, f: F) -> Result<T>
where
    F: FnOnce(&ProxyRepo) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let repo = ProxyRepo::open(config)?;
        f(&repo)
    })
    .await?
}

/// Like [`with_repo`] but opens with [`ProxyRepo::inspect`]
pub(crate) async fn inspect_repo<T, F>(config: RepoConfig, f: F) -> Result<T>
where
    F: FnOnce(&ProxyRepo) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let repo = ProxyRepo::inspect(config)?;
        f(&repo)
    })
    .await?
}
