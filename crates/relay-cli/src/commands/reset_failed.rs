//! `relay reset-failed` command implementation

use colored::Colorize;
use relay_repo::RepoConfig;

use super::with_repo;
use crate::error::Result;

/// Delete failed forward records; their subjects are fanned out again
pub async fn run(config: RepoConfig) -> Result<()> {
    let deleted = with_repo(config, |repo| {
        let deleted = repo.delete_failed_forwards()?;
        repo.create_forward_records()?;
        Ok(deleted)
    })
    .await?;

    if deleted == 0 {
        println!("No failed forwards.");
    } else {
        println!("{} Reset {} failed forward(s)", "✓".green(), deleted);
    }
    Ok(())
}
