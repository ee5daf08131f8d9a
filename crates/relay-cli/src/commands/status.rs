//! `relay status` command implementation
//!
//! Shows row counts and queue depths.

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use relay_repo::{RepoConfig, RepoStats};

use super::inspect_repo;
use crate::error::Result;

pub async fn run(config: RepoConfig, json: bool) -> Result<()> {
    let path = config.database.path.clone();
    let stats = inspect_repo(config, |repo| Ok(repo.stats()?)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{} {}", "Staging store:".cyan().bold(), path.display());
    println!("{}", render(&stats));
    Ok(())
}

fn render(stats: &RepoStats) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["", "Total", "Queued", "Retry", "Failed"]);

    let dash = || "-".to_string();
    table.add_row(vec![
        "Sources".to_string(),
        stats.sources.to_string(),
        stats.sources_awaiting_examination.to_string(),
        dash(),
        dash(),
    ]);
    table.add_row(vec![
        "Items".to_string(),
        stats.items.to_string(),
        stats.items_awaiting_aggregation.to_string(),
        dash(),
        dash(),
    ]);
    table.add_row(vec![
        "Entries".to_string(),
        stats.entries.to_string(),
        dash(),
        dash(),
        dash(),
    ]);
    table.add_row(vec![
        format!("Aggregates ({} open)", stats.open_aggregates),
        stats.aggregates.to_string(),
        stats.aggregates_awaiting_forward.to_string(),
        dash(),
        dash(),
    ]);
    table.add_row(vec![
        "Aggregate forwards".to_string(),
        stats.forward_aggregates.to_string(),
        stats.forward_aggregates_new.to_string(),
        stats.forward_aggregates_retry.to_string(),
        stats.forward_aggregates_failed.to_string(),
    ]);
    table.add_row(vec![
        "Source forwards".to_string(),
        stats.forward_sources.to_string(),
        stats.forward_sources_new.to_string(),
        stats.forward_sources_retry.to_string(),
        stats.forward_sources_failed.to_string(),
    ]);
    table.add_row(vec![
        "Destinations".to_string(),
        stats.forward_dests.to_string(),
        dash(),
        dash(),
        dash(),
    ]);
    table
}
