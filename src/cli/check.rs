//! `check` subcommand: batch compliance over a software inventory

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::{self, BatchItem, BatchOptions, ComplianceStatus, ProgressSink, SilentProgress};
use crate::cancel::CancelToken;
use crate::coordinator::Coordinator;

use super::OutputFormat;

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn tick(&self, label: &str) {
        self.bar.set_message(label.to_string());
        self.bar.inc(1);
    }
}

pub fn run(
    coordinator: &Coordinator,
    input: &str,
    concurrency: Option<usize>,
    no_parallel: bool,
    force: bool,
    format: OutputFormat,
    cancel: &CancelToken,
) -> Result<()> {
    let items = parse_input(input)?;
    if items.is_empty() {
        anyhow::bail!("No items to check in: {}", input);
    }

    let options = BatchOptions {
        concurrency: if no_parallel {
            1
        } else {
            concurrency.unwrap_or(coordinator.config().batch.concurrency)
        },
        force,
    };

    let results = if format == OutputFormat::Text {
        let progress = BarProgress::new(items.len() as u64);
        let results = batch::check(coordinator, items, &options, &progress, cancel);
        progress.bar.finish_and_clear();
        results
    } else {
        batch::check(coordinator, items, &options, &SilentProgress, cancel)
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        OutputFormat::Markdown => print_markdown(&results),
        OutputFormat::Text => print_text(&results),
    }
    Ok(())
}

/// An input file (lines or a JSON array) or an inline `a@1.0,b` list
fn parse_input(input: &str) -> Result<Vec<BatchItem>> {
    let path = Path::new(input);
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?;
        if content.trim_start().starts_with('[') {
            return serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON inventory: {}", path.display()));
        }
        return Ok(content.lines().filter_map(BatchItem::parse_line).collect());
    }

    Ok(input
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|token| {
            let token = token.trim();
            match token.split_once('@') {
                Some((name, version)) => BatchItem::new(name.trim(), Some(version.trim())),
                None => BatchItem::new(token, None),
            }
        })
        .collect())
}

fn print_text(results: &[batch::ComplianceResult]) {
    let width = results
        .iter()
        .map(|r| r.software.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<width$}  {:<12}  {:<12}  {:<14}  DETAIL",
        "SOFTWARE",
        "INSTALLED",
        "MSV",
        "STATUS",
        width = width
    );
    for row in results {
        let status = colored_status(row.status);
        let detail = row
            .detail
            .as_deref()
            .or(row.action.as_ref().map(|a| a.headline.as_str()))
            .unwrap_or("");
        println!(
            "{:<width$}  {:<12}  {:<12}  {}  {}",
            row.software,
            row.installed_version.as_deref().unwrap_or("-"),
            row.msv.as_deref().unwrap_or("-"),
            status,
            detail,
            width = width
        );
    }

    let non_compliant = results
        .iter()
        .filter(|r| r.status == ComplianceStatus::NonCompliant)
        .count();
    if non_compliant > 0 {
        println!();
        println!(
            "{}",
            format!("{} of {} items below their MSV", non_compliant, results.len())
                .red()
                .bold()
        );
    }
}

fn print_markdown(results: &[batch::ComplianceResult]) {
    println!("| Software | Installed | MSV | Status | Action |");
    println!("|----------|-----------|-----|--------|--------|");
    for row in results {
        println!(
            "| {} | {} | {} | {} | {} |",
            row.software,
            row.installed_version.as_deref().unwrap_or("-"),
            row.msv.as_deref().unwrap_or("-"),
            row.status,
            row.action
                .as_ref()
                .map(|a| a.action.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn colored_status(status: ComplianceStatus) -> String {
    let text = format!("{:<14}", status.to_string());
    match status {
        ComplianceStatus::Compliant => text.green().to_string(),
        ComplianceStatus::Outdated => text.yellow().to_string(),
        ComplianceStatus::NonCompliant => text.red().bold().to_string(),
        ComplianceStatus::Unknown => text.cyan().to_string(),
        ComplianceStatus::NotFound | ComplianceStatus::Error => text.red().to_string(),
    }
}
