//! Vulnerability source contracts and the canonical finding model
//!
//! Every advisory source, online or offline, projects its native payload
//! into the same small shapes: [`Finding`] for per-CVE evidence and
//! [`BranchMsv`] for per-release-line safe-version floors. The aggregator
//! only ever sees these; raw payloads never cross a source boundary.

mod appthreat;
mod epss;
pub mod kev;
mod nvd;
pub mod vendor;
mod vulncheck;

pub use appthreat::{AppThreatClient, CpeSearchOptions, OfflineVulnDb};
pub use epss::{EpssClient, EpssFeed};
pub use kev::{KevClient, KevEntry, KevFeed};
pub use nvd::{CveFeed, NvdClient};
pub use vulncheck::{ExploitIntel, VulnCheckClient};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;

/// CVE severity levels (CVSS-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical, // CVSS 9.0-10.0
    High,     // CVSS 7.0-8.9
    Medium,   // CVSS 4.0-6.9
    Low,      // CVSS 0.1-3.9
    Unknown,  // No CVSS score available
}

impl Severity {
    /// Parse severity from a CVSS score
    pub fn from_cvss(score: f64) -> Self {
        match score {
            s if s >= 9.0 => Severity::Critical,
            s if s >= 7.0 => Severity::High,
            s if s >= 4.0 => Severity::Medium,
            s if s > 0.0 => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    /// Parse severity from a label (NVD/CSAF format)
    pub fn from_label(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" | "IMPORTANT" => Severity::High,
            "MEDIUM" | "MODERATE" => Severity::Medium,
            "LOW" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Unknown => 0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One piece of per-CVE evidence, as emitted by a source client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// CVE identifier (e.g., CVE-2024-1234)
    pub cve_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Version in which the vendor fixed this CVE, when known
    #[serde(default)]
    pub fixed_version: Option<String>,
    /// Human-readable affected range, verbatim from the source
    #[serde(default)]
    pub affected_range: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub cvss_score: Option<f64>,
    #[serde(default)]
    pub epss_score: Option<f64>,
    /// Listed in the CISA Known Exploited Vulnerabilities catalog
    #[serde(default)]
    pub in_kev: bool,
    /// Public proof-of-concept or active exploitation evidence
    #[serde(default)]
    pub has_poc: bool,
    #[serde(default)]
    pub kev_date_added: Option<String>,
    /// Tag of the source that first contributed this finding
    #[serde(default)]
    pub source: Option<String>,
}

impl Finding {
    /// A bare finding for a CVE id
    pub fn new(cve_id: &str) -> Self {
        Self {
            cve_id: cve_id.to_string(),
            description: None,
            fixed_version: None,
            affected_range: None,
            severity: None,
            cvss_score: None,
            epss_score: None,
            in_kev: false,
            has_poc: false,
            kev_date_added: None,
            source: None,
        }
    }

    /// Mark this finding as known-exploited
    ///
    /// KEV listing implies a working exploit, so `has_poc` always rides
    /// along with `in_kev`.
    pub fn mark_kev(&mut self, date_added: Option<String>) {
        self.in_kev = true;
        self.has_poc = true;
        if self.kev_date_added.is_none() {
            self.kev_date_added = date_added;
        }
    }

    /// Merge evidence from a later source into this finding
    ///
    /// First non-null wins for every scalar field; `in_kev` and `has_poc`
    /// OR monotonically across sources.
    pub fn merge(&mut self, other: &Finding) {
        if self.description.is_none() {
            self.description = other.description.clone();
        }
        if self.fixed_version.is_none() {
            self.fixed_version = other.fixed_version.clone();
        }
        if self.affected_range.is_none() {
            self.affected_range = other.affected_range.clone();
        }
        if self.severity.is_none() {
            self.severity = other.severity;
        }
        if self.cvss_score.is_none() {
            self.cvss_score = other.cvss_score;
        }
        if self.epss_score.is_none() {
            self.epss_score = other.epss_score;
        }
        if self.kev_date_added.is_none() {
            self.kev_date_added = other.kev_date_added.clone();
        }
        if self.source.is_none() {
            self.source = other.source.clone();
        }
        self.in_kev |= other.in_kev;
        self.has_poc |= other.has_poc || other.in_kev;
        if self.in_kev {
            self.has_poc = true;
        }
    }
}

/// Per-branch minimum safe version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMsv {
    /// Branch key, e.g. "9.0", "R81.20", "plus-25"
    pub branch: String,
    /// Highest fixed version known in this branch, or "unknown"
    pub msv: String,
    /// Latest version known to exist in this branch
    pub latest: String,
    /// Vendor has disclosed but not yet shipped a fix (msv > latest)
    #[serde(default)]
    pub no_safe_version: bool,
    /// CVE ids considered for this branch
    #[serde(default)]
    pub cve_ids: Vec<String>,
}

/// What one source contributes for one product query
#[derive(Debug, Clone, Default)]
pub struct SourceOutput {
    pub branches: Vec<BranchMsv>,
    pub findings: Vec<Finding>,
    pub tag: String,
    pub note: Option<String>,
}

/// Ledger row: whether and how a source participated in an aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    pub source: String,
    pub queried: bool,
    pub cve_count: usize,
    #[serde(default)]
    pub note: Option<String>,
}

impl SourceResult {
    pub fn queried(source: &str, cve_count: usize, note: Option<&str>) -> Self {
        Self {
            source: source.to_string(),
            queried: true,
            cve_count,
            note: note.map(String::from),
        }
    }

    pub fn skipped(source: &str, reason: &str) -> Self {
        Self {
            source: source.to_string(),
            queried: false,
            cve_count: 0,
            note: Some(reason.to_string()),
        }
    }
}

/// The merged output of one aggregation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub product_id: String,
    #[serde(default)]
    pub branches: Vec<BranchMsv>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub sources: Vec<SourceResult>,
    /// Lowest MSV across branches
    #[serde(default)]
    pub minimum_safe_version: Option<String>,
    /// Highest MSV across branches, bumped to the catalog's latest release
    #[serde(default)]
    pub recommended_version: Option<String>,
    #[serde(default)]
    pub has_kev_cves: bool,
    /// Whether a vendor advisory contributed the branch set
    #[serde(default)]
    pub has_vendor_advisory: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Whether this result was served from the MSV cache
    #[serde(skip)]
    pub from_cache: bool,
}

/// The uniform capability every source client offers
pub trait VulnerabilitySource {
    /// Short stable name used in SourceResult ledgers
    fn tag(&self) -> &'static str;

    /// Query the source for one catalog entry
    fn query(&self, entry: &CatalogEntry) -> Result<SourceOutput>;
}

/// Merge a batch of findings into an accumulator, deduplicating by CVE id
pub fn merge_findings(into: &mut Vec<Finding>, new: Vec<Finding>) {
    for finding in new {
        match into.iter_mut().find(|f| f.cve_id == finding.cve_id) {
            Some(existing) => existing.merge(&finding),
            None => {
                let mut finding = finding;
                if finding.in_kev {
                    finding.has_poc = true;
                }
                into.push(finding);
            }
        }
    }
}

/// Highest severity across a finding list
pub fn max_severity(findings: &[Finding]) -> Severity {
    findings
        .iter()
        .filter_map(|f| f.severity)
        .max_by_key(|s| s.rank())
        .unwrap_or(Severity::Unknown)
}
