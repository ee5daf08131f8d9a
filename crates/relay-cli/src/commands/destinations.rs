//! `relay destinations` command implementation
//!
//! Lists every registered destination and whether it is still configured.

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use relay_repo::RepoConfig;

use super::inspect_repo;
use crate::error::Result;

/// How a registered destination relates to the current configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestState {
    Active,
    Retired,
    /// No destinations are configured, so nothing has been retired
    Unconfigured,
}

impl DestState {
    fn of(configured_any: bool, active: bool) -> Self {
        match (configured_any, active) {
            (false, _) => DestState::Unconfigured,
            (true, true) => DestState::Active,
            (true, false) => DestState::Retired,
        }
    }

    fn label(self) -> String {
        match self {
            DestState::Active => "active".green().to_string(),
            DestState::Retired => "retired".yellow().to_string(),
            DestState::Unconfigured => "unconfigured".dimmed().to_string(),
        }
    }
}

pub async fn run(config: RepoConfig) -> Result<()> {
    let configured_any = !config.forwarding.destinations.is_empty();
    let (active, registered) = inspect_repo(config, |repo| {
        Ok((repo.destinations(), repo.dests().get_forward_dests()?))
    })
    .await?;

    if registered.is_empty() {
        println!("No destinations registered.");
        println!("Set RELAY_FORWARD_DESTINATIONS to start forwarding.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Id", "Name", "State"]);

    for dest in &registered {
        let state = DestState::of(configured_any, active.contains(dest));
        table.add_row(vec![dest.id.to_string(), dest.name.clone(), state.label()]);
    }

    println!("{}", "Forward destinations:".cyan().bold());
    println!("{}", table);
    if !configured_any {
        println!("No destinations configured; forwarding is paused and data is held.");
    }
    Ok(())
}
