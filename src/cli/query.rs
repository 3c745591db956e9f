//! `query` subcommand: one product's MSV with scoring and compliance

use anyhow::Result;
use colored::Colorize;

use crate::coordinator::{Coordinator, MsvResult, QueryOptions};
use crate::scoring::{Action, RiskLevel};

use super::OutputFormat;

pub fn run(
    coordinator: &Coordinator,
    name: &str,
    version: Option<&str>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let options = QueryOptions {
        installed_version: version.map(String::from),
        force,
    };
    let result = coordinator.query_msv(name, &options)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Markdown => print_markdown(&result),
        OutputFormat::Text => print_text(&result, 0),
    }
    Ok(())
}

fn print_text(result: &MsvResult, indent: usize) {
    let pad = "  ".repeat(indent);

    println!(
        "{}{} ({})",
        pad,
        result.display_name.bold(),
        result.product_id
    );
    println!("{}  Minimum Safe Version: {}", pad, result.msv.bold());
    if let Some(recommended) = &result.recommended {
        println!("{}  Recommended:          {}", pad, recommended);
    }
    println!(
        "{}  Rating:               {} ({})",
        pad, result.rating.rating, result.rating.description
    );
    println!(
        "{}  Risk:                 {}/100 {}",
        pad,
        result.risk.score,
        colored_level(result.risk.level)
    );
    println!(
        "{}  Action:               {} {}",
        pad,
        colored_action(result.action.action),
        result.action.headline
    );
    if let Some(installed) = &result.installed_version {
        println!("{}  Installed:            {}", pad, installed);
    }
    if result.from_cache {
        println!("{}  (served from cache)", pad);
    }

    if !result.branches.is_empty() {
        println!("{}  Branches:", pad);
        for branch in &result.branches {
            let flag = if branch.no_safe_version {
                " NO SAFE VERSION".red().to_string()
            } else {
                String::new()
            };
            println!(
                "{}    {:<10} msv {:<12} latest {}{}",
                pad, branch.branch, branch.msv, branch.latest, flag
            );
        }
    }

    if !result.findings.is_empty() {
        let kev = result.findings.iter().filter(|f| f.in_kev).count();
        println!(
            "{}  CVEs considered:      {} ({} in KEV, max severity {})",
            pad,
            result.findings.len(),
            kev,
            crate::sources::max_severity(&result.findings)
        );
    }

    if !result.sources.is_empty() {
        println!("{}  Sources:", pad);
        for source in &result.sources {
            let mark = if source.queried { "[x]" } else { "[ ]" };
            let note = source
                .note
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default();
            println!(
                "{}    {} {} {} CVEs{}",
                pad, mark, source.source, source.cve_count, note
            );
        }
    }

    for variant in &result.variants {
        println!();
        print_text(variant, indent + 1);
    }
}

fn print_markdown(result: &MsvResult) {
    println!("## {} ({})", result.display_name, result.product_id);
    println!();
    println!("| Field | Value |");
    println!("|-------|-------|");
    println!("| Minimum Safe Version | {} |", result.msv);
    if let Some(recommended) = &result.recommended {
        println!("| Recommended | {} |", recommended);
    }
    println!(
        "| Rating | {} ({}) |",
        result.rating.rating, result.rating.description
    );
    println!("| Risk | {}/100 {} |", result.risk.score, result.risk.level);
    println!(
        "| Action | {} {} |",
        result.action.action, result.action.headline
    );
    if let Some(installed) = &result.installed_version {
        println!("| Installed | {} |", installed);
    }

    if !result.branches.is_empty() {
        println!();
        println!("| Branch | MSV | Latest |");
        println!("|--------|-----|--------|");
        for branch in &result.branches {
            println!("| {} | {} | {} |", branch.branch, branch.msv, branch.latest);
        }
    }

    for variant in &result.variants {
        println!();
        print_markdown(variant);
    }
}

fn colored_level(level: RiskLevel) -> String {
    match level {
        RiskLevel::Critical => "CRITICAL".red().bold().to_string(),
        RiskLevel::High => "HIGH".red().to_string(),
        RiskLevel::Medium => "MEDIUM".yellow().to_string(),
        RiskLevel::Low => "LOW".green().to_string(),
        RiskLevel::Info => "INFO".normal().to_string(),
    }
}

fn colored_action(action: Action) -> String {
    match action {
        Action::UpgradeCritical => "UPGRADE_CRITICAL".red().bold().to_string(),
        Action::UpgradeRecommended => "UPGRADE_RECOMMENDED".yellow().to_string(),
        Action::Investigate => "INVESTIGATE".yellow().to_string(),
        Action::Monitor => "MONITOR".cyan().to_string(),
        Action::NoAction => "NO_ACTION".green().to_string(),
    }
}
