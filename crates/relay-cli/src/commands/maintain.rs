//! `relay maintain` command implementation

use colored::Colorize;
use relay_repo::RepoConfig;

use super::with_repo;
use crate::error::Result;

/// Run the configured maintenance statements once
pub async fn run(config: RepoConfig) -> Result<()> {
    let statements = config.database.maintenance_statements.len();
    with_repo(config, |repo| Ok(repo.run_maintenance()?)).await?;

    println!(
        "{} Ran {} maintenance statement(s)",
        "✓".green(),
        statements
    );
    Ok(())
}
