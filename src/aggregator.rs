//! Evidence aggregation engine
//!
//! One `aggregate()` call orchestrates every source for one product, in a
//! fixed priority order, merging findings as it goes. The control flow is
//! strictly sequential: later steps (whether to ask NVD at all, which CVEs
//! still need a fixed version) depend on what earlier sources produced.
//! Any single source failure is non-fatal and lands in the SourceResult
//! ledger; only an unknown product or an MSV-cache write failure aborts.

use std::sync::Arc;

use chrono::Utc;
use regex::RegexBuilder;

use crate::catalog::CatalogEntry;
use crate::error::Result;
use crate::filecache::FileCache;
use crate::msvcache::{Confidence, MsvCache, MsvCacheEntry, SCHEMA_VERSION};
use crate::scoring;
use crate::sources::{
    kev, merge_findings, AggregatedResult, BranchMsv, CpeSearchOptions, CveFeed, EpssFeed,
    ExploitIntel, Finding, KevFeed, OfflineVulnDb, SourceResult, VulnerabilitySource,
};
use crate::version;

/// Findings still missing a fixed version after the CPE passes that get a
/// per-CVE NVD lookup
const NVD_CVE_LOOKUP_CAP: usize = 5;

/// Leading-component divergence factor for the scheme-mismatch detector
const MISMATCH_FACTOR: u64 = 3;

/// Options for one aggregation
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Delete the cached result and clear vendor advisory caches first
    pub force: bool,
    /// Override the configured MSV cache max age
    pub max_age_hours: Option<i64>,
}

/// The sources available for one product query
///
/// Each slot is optional so degraded environments (no API token, no
/// offline DB installed) and tests compose freely.
#[derive(Default)]
pub struct SourceSet {
    pub vendor: Option<Box<dyn VulnerabilitySource>>,
    pub offline: Option<Box<dyn OfflineVulnDb>>,
    pub kev: Option<Box<dyn KevFeed>>,
    pub vulncheck: Option<Box<dyn ExploitIntel>>,
    pub nvd: Option<Box<dyn CveFeed>>,
    pub epss: Option<Box<dyn EpssFeed>>,
}

/// The deterministic multi-source orchestrator
pub struct Aggregator {
    msv_cache: MsvCache,
    file_cache: Option<Arc<FileCache>>,
    msv_max_age_hours: i64,
}

impl Aggregator {
    pub fn new(msv_cache: MsvCache, file_cache: Option<Arc<FileCache>>, msv_max_age_hours: i64) -> Self {
        Self {
            msv_cache,
            file_cache,
            msv_max_age_hours,
        }
    }

    /// Run the full aggregation for one catalog entry
    pub fn aggregate(
        &self,
        entry: &CatalogEntry,
        sources: &SourceSet,
        options: &AggregateOptions,
    ) -> Result<AggregatedResult> {
        let key = entry.cache_key();
        let max_age = options.max_age_hours.unwrap_or(self.msv_max_age_hours);

        // Step 1: serve a fresh, complete cached result
        if options.force {
            self.msv_cache.delete(&key)?;
        } else if !self.msv_cache.needs_refresh(&key, max_age) {
            if let Some(cached) = self.msv_cache.get(&key) {
                tracing::debug!("serving {} from MSV cache", key);
                let mut result = cached.result;
                result.from_cache = true;
                return Ok(result);
            }
        }

        let mut findings: Vec<Finding> = Vec::new();
        let mut branches: Vec<BranchMsv> = Vec::new();
        let mut source_results: Vec<SourceResult> = Vec::new();
        let mut has_vendor = false;
        let mut minimum_safe_version: Option<String> = None;
        let mut recommended_version: Option<String> = None;

        // Steps 2-3: vendor advisory
        match &sources.vendor {
            Some(vendor) => {
                if options.force {
                    if let Some(cache) = &self.file_cache {
                        cache.remove_prefix("csaf_");
                        cache.remove_prefix("eol_");
                    }
                }
                match vendor.query(entry) {
                    Ok(output) => {
                        let count = output.findings.len();
                        if !output.branches.is_empty() {
                            has_vendor = true;
                            branches = output.branches;
                            for branch in &mut branches {
                                branch.no_safe_version =
                                    version::compare(&branch.msv, &branch.latest) > 0;
                            }
                        }
                        merge_findings(&mut findings, output.findings);
                        source_results.push(SourceResult::queried(
                            vendor.tag(),
                            count,
                            output.note.as_deref(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("vendor advisory failed for {}: {}", entry.id, e);
                        source_results.push(SourceResult::queried(vendor.tag(), 0, Some("fetch failed")));
                    }
                }
            }
            None => {
                source_results.push(SourceResult::skipped("VendorAdvisory", "no fetcher for this vendor"));
            }
        }

        // Step 4: offline vuln DB, only when no vendor branches exist
        match (&sources.offline, &entry.cpe, has_vendor) {
            (Some(offline), Some(cpe), false) => {
                match offline.search_by_cpe(cpe, &CpeSearchOptions::default()) {
                    Ok(raw) => {
                        let filtered = apply_filters(raw, entry);
                        let count = filtered.len();
                        merge_findings(&mut findings, filtered);
                        if minimum_safe_version.is_none() {
                            if let Some(msv) = floor_of(&findings) {
                                minimum_safe_version = Some(msv.clone());
                                recommended_version = Some(msv);
                            }
                        }
                        source_results.push(SourceResult::queried("AppThreat", count, None));
                    }
                    Err(e) => {
                        tracing::warn!("offline DB query failed for {}: {}", entry.id, e);
                        source_results.push(SourceResult::queried("AppThreat", 0, Some("query failed")));
                    }
                }
            }
            (Some(_), _, true) => {
                source_results.push(SourceResult::skipped("AppThreat", "vendor advisory authoritative"));
            }
            (Some(_), None, false) => {
                source_results.push(SourceResult::skipped("AppThreat", "no CPE for this product"));
            }
            (None, _, _) => {
                source_results.push(SourceResult::skipped("AppThreat", "offline DB not available"));
            }
        }

        // Step 5: CISA KEV, always
        match &sources.kev {
            Some(kev_feed) => match kev_feed.entries_matching(&kev::search_terms(entry)) {
                Ok(entries) => {
                    let count = entries.len();
                    for kev_entry in entries {
                        match findings.iter_mut().find(|f| f.cve_id == kev_entry.cve_id) {
                            Some(finding) => finding.mark_kev(kev_entry.date_added.clone()),
                            None => {
                                let mut finding = Finding::new(&kev_entry.cve_id);
                                finding.description = kev_entry.short_description.clone();
                                finding.source = Some("CISA KEV".to_string());
                                finding.mark_kev(kev_entry.date_added.clone());
                                findings.push(finding);
                            }
                        }
                    }
                    source_results.push(SourceResult::queried("CISA KEV", count, None));
                }
                Err(e) => {
                    tracing::warn!("KEV lookup failed for {}: {}", entry.id, e);
                    source_results.push(SourceResult::queried("CISA KEV", 0, Some("fetch failed")));
                }
            },
            None => {
                source_results.push(SourceResult::skipped("CISA KEV", "feed not available"));
            }
        }

        // Step 6: VulnCheck, token- and CPE-gated
        match (&sources.vulncheck, &entry.cpe) {
            (Some(vulncheck), Some(cpe)) => match vulncheck.search_cpe(cpe) {
                Ok(results) => {
                    let count = results.len();
                    merge_findings(&mut findings, results);
                    source_results.push(SourceResult::queried("VulnCheck", count, None));
                }
                Err(e) => {
                    tracing::warn!("VulnCheck query failed for {}: {}", entry.id, e);
                    source_results.push(SourceResult::queried("VulnCheck", 0, Some("query failed")));
                }
            },
            (Some(_), None) => {
                source_results.push(SourceResult::skipped("VulnCheck", "no CPE for this product"));
            }
            (None, _) => {
                source_results.push(SourceResult::skipped("VulnCheck", "no API token configured"));
            }
        }

        // Step 7: NVD by CPE, only when the evidence so far is insufficient
        let nvd_reason = nvd_consult_reason(&findings, entry);
        match (&sources.nvd, &entry.cpe, nvd_reason) {
            (Some(nvd), Some(cpe), Some(reason)) => match nvd.search_by_cpe(cpe) {
                Ok(raw) => {
                    let filtered = apply_filters(raw, entry);
                    let count = filtered.len();
                    merge_findings(&mut findings, filtered);
                    if minimum_safe_version.is_none() {
                        if let Some(msv) = floor_of(&findings) {
                            minimum_safe_version = Some(msv.clone());
                            recommended_version = Some(msv);
                        }
                    }
                    source_results.push(SourceResult::queried("NVD", count, Some(reason)));
                }
                Err(e) => {
                    tracing::warn!("NVD CPE query failed for {}: {}", entry.id, e);
                    source_results.push(SourceResult::queried("NVD", 0, Some("query failed")));
                }
            },
            (Some(_), None, Some(_)) => {
                source_results.push(SourceResult::skipped("NVD", "no CPE for this product"));
            }
            (Some(_), _, None) => {
                source_results.push(SourceResult::skipped("NVD", "existing evidence sufficient"));
            }
            (None, _, _) => {
                source_results.push(SourceResult::skipped("NVD", "feed not available"));
            }
        }

        // Step 8: per-CVE NVD lookups for findings still missing a fix
        match &sources.nvd {
            Some(nvd) => {
                let missing: Vec<String> = findings
                    .iter()
                    .filter(|f| f.fixed_version.is_none())
                    .take(NVD_CVE_LOOKUP_CAP)
                    .map(|f| f.cve_id.clone())
                    .collect();
                let mut resolved = 0;
                for cve_id in &missing {
                    match nvd.fetch_by_id(cve_id) {
                        Ok(Some(fetched)) => {
                            if let Some(finding) =
                                findings.iter_mut().find(|f| &f.cve_id == cve_id)
                            {
                                finding.merge(&fetched);
                                if finding.fixed_version.is_some() {
                                    resolved += 1;
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("NVD lookup for {} failed: {}", cve_id, e);
                        }
                    }
                }
                let note = if missing.is_empty() {
                    None
                } else {
                    Some("filled missing fixed versions")
                };
                source_results.push(SourceResult::queried("NVD CVE lookup", resolved, note));
            }
            None => {
                source_results.push(SourceResult::skipped("NVD CVE lookup", "feed not available"));
            }
        }

        // Step 9: EPSS enrichment
        match &sources.epss {
            Some(epss) => {
                let ids: Vec<String> = findings.iter().map(|f| f.cve_id.clone()).collect();
                match epss.scores(&ids) {
                    Ok(scores) => {
                        let count = scores.len();
                        for finding in &mut findings {
                            if let Some(score) = scores.get(&finding.cve_id) {
                                finding.epss_score = Some(*score);
                            }
                        }
                        source_results.push(SourceResult::queried("EPSS", count, None));
                    }
                    Err(e) => {
                        tracing::warn!("EPSS lookup failed for {}: {}", entry.id, e);
                        source_results.push(SourceResult::queried("EPSS", 0, Some("fetch failed")));
                    }
                }
            }
            None => {
                source_results.push(SourceResult::skipped("EPSS", "feed not available"));
            }
        }

        // Step 10
        let has_kev_cves = findings.iter().any(|f| f.in_kev);

        // Step 11: synthesize a branch when only a flat MSV exists
        if branches.is_empty() {
            if let Some(msv) = &minimum_safe_version {
                branches.push(BranchMsv {
                    branch: "default".to_string(),
                    msv: msv.clone(),
                    latest: msv.clone(),
                    no_safe_version: false,
                    cve_ids: findings.iter().map(|f| f.cve_id.clone()).collect(),
                });
            }
        }

        // Step 12: recompute the floor and ceiling across branches
        if !branches.is_empty() {
            let mut msvs: Vec<String> = branches
                .iter()
                .filter(|b| b.msv != "unknown")
                .map(|b| b.msv.clone())
                .collect();
            version::sort(&mut msvs);
            minimum_safe_version = msvs.first().cloned();
            recommended_version = msvs.last().cloned();
        }
        if let Some(latest) = &entry.latest_version {
            let newer = recommended_version
                .as_deref()
                .map_or(true, |rec| version::compare(latest, rec) > 0);
            if newer && recommended_version.is_some() {
                recommended_version = Some(latest.clone());
            }
        }

        let result = AggregatedResult {
            product_id: entry.id.clone(),
            branches,
            findings,
            sources: source_results,
            minimum_safe_version,
            recommended_version,
            has_kev_cves,
            has_vendor_advisory: has_vendor,
            timestamp: Utc::now(),
            from_cache: false,
        };

        // Step 14: persist; a write failure here is the one fatal I/O path
        self.persist(&key, entry, &result, has_vendor)?;

        Ok(result)
    }

    fn persist(
        &self,
        key: &str,
        entry: &CatalogEntry,
        result: &AggregatedResult,
        has_vendor: bool,
    ) -> Result<()> {
        let confidence = if has_vendor {
            Confidence::High
        } else if result.minimum_safe_version.is_some() {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        let (justification, cve_count) = if result.findings.is_empty() {
            (
                Some("no known CVEs of medium or higher severity".to_string()),
                Some(0),
            )
        } else {
            (None, Some(result.findings.len()))
        };

        let now = Utc::now();
        let cache_entry = MsvCacheEntry {
            schema_version: SCHEMA_VERSION,
            product_id: entry.id.clone(),
            result: result.clone(),
            last_updated: now,
            branch_checked: result
                .branches
                .iter()
                .map(|b| (b.branch.clone(), now))
                .collect(),
            sources: result
                .sources
                .iter()
                .filter(|s| s.queried)
                .map(|s| s.source.clone())
                .collect(),
            confidence,
            justification,
            cve_count,
        };

        self.msv_cache.update(key, cache_entry)
    }
}

/// Whether (and why) NVD should be consulted by CPE
fn nvd_consult_reason(findings: &[Finding], entry: &CatalogEntry) -> Option<&'static str> {
    if findings.is_empty() {
        return Some("no findings yet");
    }
    if !findings.iter().any(|f| f.fixed_version.is_some()) {
        return Some("no fixed versions");
    }
    if let Some(latest) = &entry.latest_version {
        let fixed: Vec<String> = findings
            .iter()
            .filter_map(|f| f.fixed_version.clone())
            .filter(|v| !v.starts_with('>'))
            .collect();
        if scoring::version_scheme_mismatch(&fixed, latest, MISMATCH_FACTOR) {
            return Some("version mismatch");
        }
    }
    None
}

/// Apply the catalog's versionPattern and excludePatterns filters
fn apply_filters(findings: Vec<Finding>, entry: &CatalogEntry) -> Vec<Finding> {
    let version_pattern = entry
        .version_pattern
        .as_deref()
        .and_then(|p| regex::Regex::new(p).ok());
    let exclude: Vec<regex::Regex> = entry
        .exclude_patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect();

    findings
        .into_iter()
        .filter(|f| {
            if let (Some(pattern), Some(fixed)) = (&version_pattern, &f.fixed_version) {
                let candidate = fixed.strip_prefix('>').unwrap_or(fixed);
                if !pattern.is_match(candidate) {
                    tracing::debug!("dropping {} (fixed {} fails version pattern)", f.cve_id, fixed);
                    return false;
                }
            }
            if let Some(description) = &f.description {
                if exclude.iter().any(|p| p.is_match(description)) {
                    tracing::debug!("dropping {} (description excluded)", f.cve_id);
                    return false;
                }
            }
            true
        })
        .collect()
}

/// The MSV floor over findings with usable fixed versions
fn floor_of(findings: &[Finding]) -> Option<String> {
    let fixed: Vec<String> = findings
        .iter()
        .filter_map(|f| f.fixed_version.clone())
        .collect();
    version::find_minimum_safe_version(&fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{kev::KevEntry, SourceOutput};
    use anyhow::anyhow;
    use std::collections::HashMap;
    use tempfile::{tempdir, TempDir};

    struct MockVendor {
        output: SourceOutput,
    }

    impl VulnerabilitySource for MockVendor {
        fn tag(&self) -> &'static str {
            "MockVendor"
        }
        fn query(&self, _entry: &CatalogEntry) -> anyhow::Result<SourceOutput> {
            Ok(self.output.clone())
        }
    }

    struct FailingVendor;

    impl VulnerabilitySource for FailingVendor {
        fn tag(&self) -> &'static str {
            "MockVendor"
        }
        fn query(&self, _entry: &CatalogEntry) -> anyhow::Result<SourceOutput> {
            Err(anyhow!("connection refused"))
        }
    }

    struct MockOffline {
        findings: Vec<Finding>,
    }

    impl OfflineVulnDb for MockOffline {
        fn search_by_cpe(
            &self,
            _cpe: &str,
            _options: &CpeSearchOptions,
        ) -> anyhow::Result<Vec<Finding>> {
            Ok(self.findings.clone())
        }
        fn search_by_purl(&self, _purl: &str) -> anyhow::Result<Vec<Finding>> {
            Ok(vec![])
        }
        fn lookup_cve(&self, _cve_id: &str) -> anyhow::Result<Vec<Finding>> {
            Ok(vec![])
        }
    }

    struct MockKev {
        entries: Vec<KevEntry>,
    }

    impl KevFeed for MockKev {
        fn entries_matching(&self, _terms: &[String]) -> anyhow::Result<Vec<KevEntry>> {
            Ok(self.entries.clone())
        }
        fn refresh(&self) -> anyhow::Result<usize> {
            Ok(self.entries.len())
        }
    }

    struct MockNvd {
        by_cpe: Vec<Finding>,
        by_id: HashMap<String, Finding>,
    }

    impl CveFeed for MockNvd {
        fn search_by_cpe(&self, _cpe: &str) -> anyhow::Result<Vec<Finding>> {
            Ok(self.by_cpe.clone())
        }
        fn fetch_by_id(&self, cve_id: &str) -> anyhow::Result<Option<Finding>> {
            Ok(self.by_id.get(cve_id).cloned())
        }
    }

    struct MockEpss {
        scores: HashMap<String, f64>,
    }

    impl EpssFeed for MockEpss {
        fn scores(&self, cve_ids: &[String]) -> anyhow::Result<HashMap<String, f64>> {
            Ok(cve_ids
                .iter()
                .filter_map(|id| self.scores.get(id).map(|s| (id.clone(), *s)))
                .collect())
        }
    }

    fn entry_from(json: serde_json::Value) -> CatalogEntry {
        serde_json::from_value(json).unwrap()
    }

    fn powershell_entry() -> CatalogEntry {
        entry_from(serde_json::json!({
            "id": "powershell",
            "vendor": "microsoft",
            "product": "powershell",
            "displayName": "PowerShell 7",
            "cpe": "cpe:2.3:a:microsoft:powershell:*:*:*:*:*:*:*:*",
            "versionPattern": "^[67]\\."
        }))
    }

    fn aggregator(dir: &TempDir) -> Aggregator {
        Aggregator::new(MsvCache::new(&dir.path().join("msv-cache.json")), None, 24)
    }

    fn fixed_finding(cve: &str, fixed: &str) -> Finding {
        let mut f = Finding::new(cve);
        f.fixed_version = Some(fixed.to_string());
        f
    }

    #[test]
    fn test_version_pattern_filter() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![
                    fixed_finding("CVE-2025-0001", "7.4.1"),
                    fixed_finding("CVE-2025-0002", "7.5.0"),
                    fixed_finding("CVE-2025-0003", "2024.1.0"),
                ],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();

        // The 2024.1.0 fix belongs to some other product's scheme
        assert_eq!(result.findings.len(), 2);
        assert!(result.findings.iter().all(|f| f.cve_id != "CVE-2025-0003"));
        assert_eq!(result.minimum_safe_version.as_deref(), Some("7.5.0"));
    }

    #[test]
    fn test_exclude_patterns_filter() {
        let dir = tempdir().unwrap();
        let entry = entry_from(serde_json::json!({
            "id": "git",
            "vendor": "git-scm",
            "product": "git",
            "displayName": "Git",
            "cpe": "cpe:2.3:a:git-scm:git:*:*:*:*:*:*:*:*",
            "excludePatterns": ["gitlab", "gitea", "github"]
        }));

        let mut a = fixed_finding("CVE-2025-0010", "2.45.1");
        a.description = Some("Git bug".to_string());
        let mut b = fixed_finding("CVE-2025-0011", "2.45.1");
        b.description = Some("GitLab bug".to_string());
        let mut c = fixed_finding("CVE-2025-0012", "2.45.1");
        c.description = Some("Gitea bug".to_string());

        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![a, b, c],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&entry, &sources, &AggregateOptions::default())
            .unwrap();

        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].cve_id, "CVE-2025-0010");
    }

    #[test]
    fn test_vendor_branches_win_over_nvd() {
        let dir = tempdir().unwrap();
        let entry = entry_from(serde_json::json!({
            "id": "sample-server",
            "vendor": "example",
            "product": "server",
            "displayName": "Example Server",
            "cpe": "cpe:2.3:a:example:server:*:*:*:*:*:*:*:*"
        }));

        let mut vendor_findings: Vec<Finding> = (1..=4)
            .map(|i| fixed_finding(&format!("CVE-2025-010{}", i), "9.0.110"))
            .collect();
        // One disclosure without a vendor fix; NVD knows a (different) fix
        vendor_findings.push(Finding::new("CVE-2025-0105"));

        let sources = SourceSet {
            vendor: Some(Box::new(MockVendor {
                output: SourceOutput {
                    branches: vec![
                        BranchMsv {
                            branch: "9.0".to_string(),
                            msv: "9.0.110".to_string(),
                            latest: "9.0.110".to_string(),
                            no_safe_version: false,
                            cve_ids: vec![],
                        },
                        BranchMsv {
                            branch: "10.1".to_string(),
                            msv: "10.1.46".to_string(),
                            latest: "10.1.46".to_string(),
                            no_safe_version: false,
                            cve_ids: vec![],
                        },
                    ],
                    findings: vendor_findings,
                    tag: "MockVendor".to_string(),
                    note: None,
                },
            })),
            nvd: Some(Box::new(MockNvd {
                by_cpe: vec![],
                by_id: HashMap::from([(
                    "CVE-2025-0105".to_string(),
                    fixed_finding("CVE-2025-0105", "9.0.200"),
                )]),
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&entry, &sources, &AggregateOptions::default())
            .unwrap();

        // The vendor-asserted branch MSV is not disturbed by NVD's value
        let nine = result.branches.iter().find(|b| b.branch == "9.0").unwrap();
        assert_eq!(nine.msv, "9.0.110");
        assert_eq!(result.minimum_safe_version.as_deref(), Some("9.0.110"));
        assert_eq!(result.recommended_version.as_deref(), Some("10.1.46"));

        // The per-CVE lookup still filled the missing fixed version
        let filled = result
            .findings
            .iter()
            .find(|f| f.cve_id == "CVE-2025-0105")
            .unwrap();
        assert_eq!(filled.fixed_version.as_deref(), Some("9.0.200"));
    }

    #[test]
    fn test_kev_enrichment_sets_flags() {
        let dir = tempdir().unwrap();
        let entry = powershell_entry();

        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            kev: Some(Box::new(MockKev {
                entries: vec![KevEntry {
                    cve_id: "CVE-2025-0001".to_string(),
                    vendor_project: "Microsoft".to_string(),
                    product: "PowerShell".to_string(),
                    vulnerability_name: "RCE".to_string(),
                    date_added: Some("2025-06-15".to_string()),
                    short_description: None,
                    known_ransomware_campaign_use: None,
                }],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&entry, &sources, &AggregateOptions::default())
            .unwrap();

        assert!(result.has_kev_cves);
        let finding = &result.findings[0];
        assert!(finding.in_kev);
        assert!(finding.has_poc);
        assert_eq!(finding.kev_date_added.as_deref(), Some("2025-06-15"));
    }

    #[test]
    fn test_kev_adds_new_finding_when_unseen() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            kev: Some(Box::new(MockKev {
                entries: vec![KevEntry {
                    cve_id: "CVE-2025-0099".to_string(),
                    vendor_project: "Microsoft".to_string(),
                    product: "PowerShell".to_string(),
                    vulnerability_name: "RCE".to_string(),
                    date_added: None,
                    short_description: Some("Exploited in the wild".to_string()),
                    known_ransomware_campaign_use: None,
                }],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();

        assert_eq!(result.findings.len(), 1);
        assert!(result.findings[0].in_kev);
        assert_eq!(
            result.findings[0].description.as_deref(),
            Some("Exploited in the wild")
        );
    }

    #[test]
    fn test_second_call_served_from_cache() {
        let dir = tempdir().unwrap();
        let agg = aggregator(&dir);
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            ..Default::default()
        };

        let first = agg
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert!(!first.from_cache);

        let second = agg
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(
            second.minimum_safe_version,
            first.minimum_safe_version
        );
        assert_eq!(second.branches.len(), first.branches.len());
        assert_eq!(second.findings.len(), first.findings.len());
    }

    #[test]
    fn test_force_bypasses_cache() {
        let dir = tempdir().unwrap();
        let agg = aggregator(&dir);
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            ..Default::default()
        };

        agg.aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        let forced = agg
            .aggregate(
                &powershell_entry(),
                &sources,
                &AggregateOptions {
                    force: true,
                    max_age_hours: None,
                },
            )
            .unwrap();
        assert!(!forced.from_cache);
    }

    #[test]
    fn test_incomplete_young_cache_entry_reaggregates() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("msv-cache.json");

        // A young v1 entry with no branches and no cveCount: incomplete
        let v1 = format!(
            r#"{{
                "microsoft:powershell": {{
                    "productId": "powershell",
                    "result": {{"productId": "powershell", "branches": [], "timestamp": "{now}"}},
                    "lastUpdated": "{now}"
                }}
            }}"#,
            now = Utc::now().to_rfc3339()
        );
        std::fs::write(&cache_path, v1).unwrap();

        let agg = Aggregator::new(MsvCache::new(&cache_path), None, 24);
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            ..Default::default()
        };

        let result = agg
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert!(!result.from_cache);
        assert!(!result.branches.is_empty());

        // The replacement entry is v2 and complete
        let replacement = MsvCache::new(&cache_path).get("microsoft:powershell").unwrap();
        assert_eq!(replacement.schema_version, SCHEMA_VERSION);
        assert!(replacement.is_complete());
    }

    #[test]
    fn test_zero_cve_result_is_cached_with_justification() {
        let dir = tempdir().unwrap();
        let agg = aggregator(&dir);
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline { findings: vec![] })),
            ..Default::default()
        };

        let first = agg
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert!(first.findings.is_empty());
        assert!(first.minimum_safe_version.is_none());

        let entry = MsvCache::new(&dir.path().join("msv-cache.json"))
            .get("microsoft:powershell")
            .unwrap();
        assert_eq!(entry.cve_count, Some(0));
        assert!(entry.justification.is_some());

        // Zero-CVE completeness makes the next call a cache hit
        let second = agg
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert!(second.from_cache);
    }

    #[test]
    fn test_no_safe_version_flag() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            vendor: Some(Box::new(MockVendor {
                output: SourceOutput {
                    branches: vec![BranchMsv {
                        branch: "R81.20".to_string(),
                        msv: "R81.30".to_string(),
                        latest: "R81.20".to_string(),
                        no_safe_version: false,
                        cve_ids: vec![],
                    }],
                    findings: vec![],
                    tag: "MockVendor".to_string(),
                    note: None,
                },
            })),
            ..Default::default()
        };

        let entry = entry_from(serde_json::json!({
            "id": "checkpoint-gateway",
            "vendor": "checkpoint",
            "product": "quantum_security_gateway",
            "displayName": "Check Point Quantum Security Gateway"
        }));
        let result = aggregator(&dir)
            .aggregate(&entry, &sources, &AggregateOptions::default())
            .unwrap();

        // Vendor disclosed a fix above anything shipped
        assert!(result.branches[0].no_safe_version);
    }

    #[test]
    fn test_vendor_failure_is_nonfatal_and_recorded() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            vendor: Some(Box::new(FailingVendor)),
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();

        // Aggregation continued past the failure
        assert_eq!(result.minimum_safe_version.as_deref(), Some("7.5.0"));
        let vendor_row = result
            .sources
            .iter()
            .find(|s| s.source == "MockVendor")
            .unwrap();
        assert!(vendor_row.queried);
        assert_eq!(vendor_row.note.as_deref(), Some("fetch failed"));
    }

    #[test]
    fn test_source_ledger_covers_every_source() {
        let dir = tempdir().unwrap();
        let result = aggregator(&dir)
            .aggregate(
                &powershell_entry(),
                &SourceSet::default(),
                &AggregateOptions::default(),
            )
            .unwrap();

        let names: Vec<&str> = result.sources.iter().map(|s| s.source.as_str()).collect();
        for expected in [
            "VendorAdvisory",
            "AppThreat",
            "CISA KEV",
            "VulnCheck",
            "NVD",
            "NVD CVE lookup",
            "EPSS",
        ] {
            assert!(names.contains(&expected), "missing ledger row {}", expected);
        }
        // Nothing was available, so nothing was queried
        assert!(result.sources.iter().all(|s| !s.queried));
    }

    #[test]
    fn test_nvd_skipped_when_evidence_sufficient() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            nvd: Some(Box::new(MockNvd {
                by_cpe: vec![fixed_finding("CVE-2025-0002", "7.4.9")],
                by_id: HashMap::new(),
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();

        let nvd_row = result.sources.iter().find(|s| s.source == "NVD").unwrap();
        assert!(!nvd_row.queried);
        // The offline finding was enough; NVD's extra CVE never merged
        assert_eq!(result.findings.len(), 1);
    }

    #[test]
    fn test_nvd_consulted_when_no_fixed_versions() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![Finding::new("CVE-2025-0001")],
            })),
            nvd: Some(Box::new(MockNvd {
                by_cpe: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
                by_id: HashMap::new(),
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();

        let nvd_row = result.sources.iter().find(|s| s.source == "NVD").unwrap();
        assert!(nvd_row.queried);
        assert_eq!(nvd_row.note.as_deref(), Some("no fixed versions"));
        assert_eq!(result.minimum_safe_version.as_deref(), Some("7.5.0"));
    }

    #[test]
    fn test_epss_enrichment() {
        let dir = tempdir().unwrap();
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.5.0")],
            })),
            epss: Some(Box::new(MockEpss {
                scores: HashMap::from([("CVE-2025-0001".to_string(), 0.42)]),
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&powershell_entry(), &sources, &AggregateOptions::default())
            .unwrap();
        assert_eq!(result.findings[0].epss_score, Some(0.42));
    }

    #[test]
    fn test_recommended_bumped_to_catalog_latest() {
        let dir = tempdir().unwrap();
        let entry = entry_from(serde_json::json!({
            "id": "powershell",
            "vendor": "microsoft",
            "product": "powershell",
            "displayName": "PowerShell 7",
            "cpe": "cpe:2.3:a:microsoft:powershell:*:*:*:*:*:*:*:*",
            "versionPattern": "^[67]\\.",
            "latestVersion": "7.5.2"
        }));
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![fixed_finding("CVE-2025-0001", "7.4.1")],
            })),
            ..Default::default()
        };

        let result = aggregator(&dir)
            .aggregate(&entry, &sources, &AggregateOptions::default())
            .unwrap();
        assert_eq!(result.minimum_safe_version.as_deref(), Some("7.4.1"));
        assert_eq!(result.recommended_version.as_deref(), Some("7.5.2"));
    }

    #[test]
    fn test_nvd_consult_reason_table() {
        let entry = powershell_entry();
        assert_eq!(nvd_consult_reason(&[], &entry), Some("no findings yet"));

        let unfixed = vec![Finding::new("CVE-1")];
        assert_eq!(nvd_consult_reason(&unfixed, &entry), Some("no fixed versions"));

        let fixed = vec![fixed_finding("CVE-1", "7.5.0")];
        assert_eq!(nvd_consult_reason(&fixed, &entry), None);

        // A latest version in a different scheme triggers the detector
        let entry_mismatch = entry_from(serde_json::json!({
            "id": "x",
            "vendor": "v",
            "product": "p",
            "displayName": "X",
            "latestVersion": "24.1"
        }));
        let odd = vec![fixed_finding("CVE-1", "1.4.2")];
        assert_eq!(
            nvd_consult_reason(&odd, &entry_mismatch),
            Some("version mismatch")
        );
    }

    #[test]
    fn test_aggregate_is_idempotent_under_force() {
        let dir = tempdir().unwrap();
        let agg = aggregator(&dir);
        let sources = SourceSet {
            offline: Some(Box::new(MockOffline {
                findings: vec![
                    fixed_finding("CVE-2025-0001", "7.4.1"),
                    fixed_finding("CVE-2025-0002", "7.5.0"),
                ],
            })),
            ..Default::default()
        };
        let force = AggregateOptions {
            force: true,
            max_age_hours: None,
        };

        let a = agg.aggregate(&powershell_entry(), &sources, &force).unwrap();
        let b = agg.aggregate(&powershell_entry(), &sources, &force).unwrap();

        assert_eq!(a.minimum_safe_version, b.minimum_safe_version);
        assert_eq!(a.recommended_version, b.recommended_version);
        assert_eq!(a.findings.len(), b.findings.len());
        assert_eq!(a.branches.len(), b.branches.len());
        assert_eq!(
            serde_json::to_value(&a.sources).unwrap(),
            serde_json::to_value(&b.sources).unwrap()
        );
    }
}
