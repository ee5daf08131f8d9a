//! `relay run` command implementation
//!
//! Runs housekeeping passes on a timer until Ctrl-C. Each pass aggregates
//! queued items, closes due aggregates, fans out forward records and sweeps
//! finished sources.

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use relay_repo::{HousekeepingReport, ProxyRepo, RepoConfig};
use tracing::{error, info};

use crate::error::Result;

pub async fn run(config: RepoConfig, interval_secs: u64, once: bool) -> Result<()> {
    let repo = Arc::new(tokio::task::spawn_blocking(move || ProxyRepo::open(config)).await??);

    if once {
        let report = pass(Arc::clone(&repo)).await?;
        print_report(&report);
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs, "Housekeeping started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match pass(Arc::clone(&repo)).await {
                    Ok(report) if report != HousekeepingReport::default() => {
                        info!(
                            items_aggregated = report.items_aggregated,
                            aggregates_closed = report.aggregates_closed,
                            forward_records_created = report.forward_records_created,
                            sources_deleted = report.sources_deleted,
                            "Housekeeping pass"
                        );
                    },
                    Ok(_) => {},
                    Err(e) => error!(error = %e, "Housekeeping pass failed"),
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping housekeeping");
                break;
            },
        }
    }

    // Joins the maintenance thread on the blocking pool
    tokio::task::spawn_blocking(move || drop(repo)).await?;
    Ok(())
}

async fn pass(repo: Arc<ProxyRepo>) -> Result<HousekeepingReport> {
    Ok(tokio::task::spawn_blocking(move || repo.housekeeping()).await??)
}

fn print_report(report: &HousekeepingReport) {
    println!("{}", "Housekeeping:".cyan().bold());
    println!("  Items aggregated:        {}", report.items_aggregated);
    println!("  Aggregates closed:       {}", report.aggregates_closed);
    println!("  Forward records created: {}", report.forward_records_created);
    println!("  Orphaned items deleted:  {}", report.orphaned_items_deleted);
    println!("  Sources deleted:         {}", report.sources_deleted);
}
