//! `relay close` command implementation
//!
//! Aggregates queued items, then closes aggregates that are due (or all
//! of them) so they can be forwarded.

use colored::Colorize;
use relay_repo::RepoConfig;

use super::with_repo;
use crate::error::Result;

pub async fn run(config: RepoConfig, all: bool) -> Result<()> {
    let (aggregated, closed, created) = with_repo(config, move |repo| {
        let aggregated = if repo.sources().is_direct() {
            0
        } else {
            repo.aggregate_new_items()?
        };
        let closed = if all {
            repo.close_all_aggregates()?
        } else {
            repo.close_old_aggregates()?
        };
        Ok((aggregated, closed, repo.create_forward_records()?))
    })
    .await?;

    println!("{} Aggregated {} item(s)", "✓".green(), aggregated);
    println!("{} Closed {} aggregate(s)", "✓".green(), closed);
    println!("  Forward records created: {}", created);
    Ok(())
}
