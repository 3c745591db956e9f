//! `refresh` subcommand: force a CISA KEV catalog re-download

use anyhow::Result;
use colored::Colorize;

use crate::coordinator::Coordinator;
use crate::sources::AppThreatClient;

pub fn run(coordinator: &Coordinator) -> Result<()> {
    println!("Refreshing CISA KEV catalog...");
    let count = coordinator.refresh_kev()?;
    println!(
        "{} {} known exploited vulnerabilities",
        "Loaded".green().bold(),
        count
    );

    // The offline vuln DB refresh is best-effort; it needs the external
    // vdb CLI and a large download.
    let config = coordinator.config();
    let vulndb_dir = config.vulndb_dir();
    match AppThreatClient::ensure_fresh(&vulndb_dir, config.cache.vulndb_max_age_hours) {
        Ok(()) => {
            if let Some(age) = AppThreatClient::age_hours(&vulndb_dir) {
                println!("Offline vulnerability database is {}h old", age);
            }
        }
        Err(e) => {
            tracing::warn!("offline vuln DB refresh skipped: {}", e);
        }
    }

    Ok(())
}
