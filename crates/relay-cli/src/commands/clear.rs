//! `relay clear` command implementation
//!
//! Deletes every row in the store. Destinations from the configuration are
//! registered again afterwards.

use colored::Colorize;
use relay_repo::RepoConfig;

use super::with_repo;
use crate::error::{CliError, Result};

pub async fn run(config: RepoConfig, yes: bool) -> Result<()> {
    if !yes {
        return Err(CliError::not_confirmed(format!(
            "Refusing to clear {}",
            config.database.path.display()
        )));
    }

    with_repo(config, |repo| Ok(repo.clear()?)).await?;

    println!("{} Cleared staging store", "✓".green());
    Ok(())
}
