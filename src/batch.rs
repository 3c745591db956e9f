//! Batch compliance checking with a bounded worker pool
//!
//! Items are consumed from a shared queue in input order by a fixed number
//! of workers. One item's failure becomes its ERROR row and never stops
//! the pool. Output is re-sorted to input order regardless of completion
//! order. Cancellation is cooperative: workers finish the item in hand and
//! exit; unstarted items get a cancelled ERROR row.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::coordinator::{Coordinator, QueryOptions};
use crate::error::SafeverError;
use crate::scoring::ActionPlan;
use crate::version;

/// Default worker count
pub const DEFAULT_CONCURRENCY: usize = 5;

/// One item to check: a software name and optionally its installed version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub software: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl BatchItem {
    pub fn new(software: &str, version: Option<&str>) -> Self {
        Self {
            software: software.to_string(),
            version: version.map(String::from),
        }
    }

    /// Parse a `name` or `name,version` line
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.split_once(',') {
            Some((name, version)) => Some(Self::new(name.trim(), Some(version.trim()))),
            None => Some(Self::new(line, None)),
        }
    }
}

/// Compliance verdict for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    /// Installed version meets or exceeds the MSV
    Compliant,
    /// Installed version is below the MSV (or the product is unsupported)
    NonCompliant,
    /// Safe, but a newer recommended release exists
    Outdated,
    /// No comparable MSV or no installed version supplied
    Unknown,
    /// Name did not resolve against the catalog
    NotFound,
    /// The query itself failed
    Error,
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceStatus::Compliant => write!(f, "COMPLIANT"),
            ComplianceStatus::NonCompliant => write!(f, "NON_COMPLIANT"),
            ComplianceStatus::Outdated => write!(f, "OUTDATED"),
            ComplianceStatus::Unknown => write!(f, "UNKNOWN"),
            ComplianceStatus::NotFound => write!(f, "NOT_FOUND"),
            ComplianceStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// One output row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceResult {
    pub software: String,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub msv: Option<String>,
    #[serde(default)]
    pub recommended: Option<String>,
    pub status: ComplianceStatus,
    #[serde(default)]
    pub action: Option<ActionPlan>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Progress reporting abstraction; the CLI plugs indicatif in here
pub trait ProgressSink: Send + Sync {
    /// Called once per completed item
    fn tick(&self, label: &str);
}

/// No-op sink for machine output and tests
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn tick(&self, _label: &str) {}
}

/// Options for one batch run
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub force: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            force: false,
        }
    }
}

/// Check every item through the coordinator with bounded parallelism
pub fn check(
    coordinator: &Coordinator,
    items: Vec<BatchItem>,
    options: &BatchOptions,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Vec<ComplianceResult> {
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let queue: Arc<Mutex<VecDeque<(usize, BatchItem)>>> =
        Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
    let completed: Arc<Mutex<Vec<(usize, ComplianceResult)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(total)));

    let workers = options.concurrency.max(1).min(total);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let completed = Arc::clone(&completed);
            scope.spawn(move || loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = queue.lock().unwrap().pop_front();
                let Some((index, item)) = next else {
                    break;
                };
                let result = check_one(coordinator, &item, options.force);
                progress.tick(&item.software);
                completed.lock().unwrap().push((index, result));
            });
        }
    });

    let mut completed = Arc::try_unwrap(completed)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    // Items never started (cancellation) still get a row
    for (index, item) in queue.lock().unwrap().drain(..) {
        completed.push((
            index,
            ComplianceResult {
                software: item.software,
                installed_version: item.version,
                msv: None,
                recommended: None,
                status: ComplianceStatus::Error,
                action: None,
                detail: Some("cancelled".to_string()),
            },
        ));
    }

    completed.sort_by_key(|(index, _)| *index);
    completed.into_iter().map(|(_, result)| result).collect()
}

fn check_one(coordinator: &Coordinator, item: &BatchItem, force: bool) -> ComplianceResult {
    let options = QueryOptions {
        installed_version: item.version.clone(),
        force,
    };

    match coordinator.query_msv(&item.software, &options) {
        Ok(result) => {
            let status = classify(&result.msv, item.version.as_deref(), result.recommended.as_deref());
            ComplianceResult {
                software: item.software.clone(),
                installed_version: item.version.clone(),
                msv: Some(result.msv),
                recommended: result.recommended,
                status,
                action: Some(result.action),
                detail: None,
            }
        }
        Err(SafeverError::UnknownProduct(name)) => ComplianceResult {
            software: item.software.clone(),
            installed_version: item.version.clone(),
            msv: None,
            recommended: None,
            status: ComplianceStatus::NotFound,
            action: None,
            detail: Some(format!("not in catalog: {}", name)),
        },
        Err(e) => ComplianceResult {
            software: item.software.clone(),
            installed_version: item.version.clone(),
            msv: None,
            recommended: None,
            status: ComplianceStatus::Error,
            action: None,
            detail: Some(e.to_string()),
        },
    }
}

/// Map (installed, MSV, recommended) to a verdict
fn classify(msv: &str, installed: Option<&str>, recommended: Option<&str>) -> ComplianceStatus {
    if msv == "UNSUPPORTED" {
        return ComplianceStatus::NonCompliant;
    }
    if msv == "unknown" || msv.starts_with("N/A") {
        return ComplianceStatus::Unknown;
    }
    let Some(installed) = installed else {
        return ComplianceStatus::Unknown;
    };

    if version::compare(installed, msv) < 0 {
        return ComplianceStatus::NonCompliant;
    }
    if let Some(recommended) = recommended {
        if version::compare(installed, recommended) < 0 {
            return ComplianceStatus::Outdated;
        }
    }
    ComplianceStatus::Compliant
}
