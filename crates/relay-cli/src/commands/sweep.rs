//! `relay sweep` command implementation

use colored::Colorize;
use relay_repo::RepoConfig;

use super::with_repo;
use crate::error::Result;

pub async fn run(config: RepoConfig) -> Result<()> {
    let (orphaned, sources) = with_repo(config, |repo| Ok(repo.sweep_sources()?)).await?;

    println!("{} Deleted {} source(s)", "✓".green(), sources);
    println!("  Orphaned items removed: {}", orphaned);
    Ok(())
}
