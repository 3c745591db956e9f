//! NVD 2.0 API client
//!
//! Queries the National Vulnerability Database by CPE match string or by
//! CVE id. NVD never asserts branch MSVs; the aggregator derives those.
//! Fixed versions come from `versionEndExcluding` bounds in the CPE match
//! configurations: the first version outside an excluding range is the fix.
//! An inclusive bound only tells us the fix is strictly above it, recorded
//! as `>X` so the MSV floor ignores it.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::http::{Auth, FetchSpec, HttpFetcher};
use crate::ratelimit::{self, TokenBucket};

use super::{Finding, Severity};

const NVD_API_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Cross-product CVE feed keyed by CPE or CVE id
pub trait CveFeed {
    /// Search CVEs affecting a CPE match string
    fn search_by_cpe(&self, cpe: &str) -> Result<Vec<Finding>>;

    /// Fetch a single CVE record
    fn fetch_by_id(&self, cve_id: &str) -> Result<Option<Finding>>;
}

/// NVD REST client
///
/// All requests share the process-wide NVD token bucket: 5 requests per
/// 30 seconds anonymous, 50 with an API key.
pub struct NvdClient {
    http: Arc<HttpFetcher>,
    limiter: Arc<TokenBucket>,
    api_key: Option<String>,
    cache_ttl: chrono::Duration,
}

impl NvdClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: Option<String>, cache_ttl_hours: i64) -> Self {
        let limiter = ratelimit::nvd_limiter(api_key.is_some());
        Self {
            http,
            limiter,
            api_key,
            cache_ttl: chrono::Duration::hours(cache_ttl_hours),
        }
    }

    fn auth(&self) -> Auth {
        match &self.api_key {
            Some(key) => Auth::Header {
                name: "apiKey".to_string(),
                value: key.clone(),
            },
            None => Auth::None,
        }
    }

    fn fetch(&self, url: &str, cache_key: Option<&str>) -> Result<String> {
        let spec = FetchSpec {
            url,
            accept: Some("application/json"),
            cache_key,
            ttl: self.cache_ttl,
            auth: self.auth(),
            limiter: Some(Arc::clone(&self.limiter)),
        };
        Ok(self.http.fetch(&spec)?)
    }

    fn parse_response(&self, body: &str) -> Result<Vec<Finding>> {
        let response: NvdResponse =
            serde_json::from_str(body).context("Failed to parse NVD response")?;

        let mut findings = Vec::new();
        for vuln in response.vulnerabilities {
            findings.push(project_cve(vuln.cve));
        }
        Ok(findings)
    }
}

impl CveFeed for NvdClient {
    fn search_by_cpe(&self, cpe: &str) -> Result<Vec<Finding>> {
        let url = format!(
            "{}?virtualMatchString={}&resultsPerPage=100",
            NVD_API_URL,
            urlencoding::encode(cpe)
        );
        let cache_key = format!("nvd_cpe_{}", cpe);
        tracing::debug!("querying NVD by CPE: {}", cpe);

        let body = self.fetch(&url, Some(&cache_key))?;
        self.parse_response(&body)
    }

    fn fetch_by_id(&self, cve_id: &str) -> Result<Option<Finding>> {
        let url = format!("{}?cveId={}", NVD_API_URL, urlencoding::encode(cve_id));
        let cache_key = format!("nvd_cve_{}", cve_id);
        tracing::debug!("querying NVD by id: {}", cve_id);

        let body = self.fetch(&url, Some(&cache_key))?;
        Ok(self.parse_response(&body)?.into_iter().next())
    }
}

/// Project one NVD CVE record into the canonical finding shape
fn project_cve(cve: NvdCve) -> Finding {
    let mut finding = Finding::new(&cve.id);

    finding.description = cve
        .descriptions
        .iter()
        .find(|d| d.lang == "en")
        .map(|d| d.value.clone());

    let (score, severity) = extract_cvss(&cve.metrics);
    finding.cvss_score = score;
    finding.severity = severity;

    let (fixed, range) = extract_fixed_version(&cve.configurations);
    finding.fixed_version = fixed;
    finding.affected_range = range;

    finding.source = Some("NVD".to_string());
    finding
}

/// Prefer CVSS 3.1, then 3.0, then 2.0, mirroring NVD's own display order
fn extract_cvss(metrics: &Option<NvdMetrics>) -> (Option<f64>, Option<Severity>) {
    let Some(metrics) = metrics else {
        return (None, None);
    };
    let score = metrics
        .cvss_metric_v31
        .as_ref()
        .and_then(|v| v.first())
        .or_else(|| metrics.cvss_metric_v30.as_ref().and_then(|v| v.first()))
        .map(|m| m.cvss_data.base_score)
        .or_else(|| {
            metrics
                .cvss_metric_v2
                .as_ref()
                .and_then(|v| v.first())
                .map(|m| m.cvss_data.base_score)
        });
    (score, score.map(Severity::from_cvss))
}

/// Walk the CPE match configurations for version bounds
fn extract_fixed_version(
    configurations: &Option<Vec<NvdConfiguration>>,
) -> (Option<String>, Option<String>) {
    let Some(configurations) = configurations else {
        return (None, None);
    };

    let mut fixed: Option<String> = None;
    let mut range: Option<String> = None;

    for config in configurations {
        for node in &config.nodes {
            for cpe_match in &node.cpe_match {
                if !cpe_match.vulnerable {
                    continue;
                }
                if range.is_none() {
                    range = describe_range(cpe_match);
                }
                if fixed.is_none() {
                    if let Some(end) = &cpe_match.version_end_excluding {
                        fixed = Some(end.clone());
                    } else if let Some(end) = &cpe_match.version_end_including {
                        // Fix is somewhere above the inclusive bound
                        fixed = Some(format!(">{}", end));
                    }
                }
            }
        }
    }

    (fixed, range)
}

fn describe_range(cpe_match: &NvdCpeMatch) -> Option<String> {
    match (
        &cpe_match.version_start_including,
        &cpe_match.version_end_excluding,
        &cpe_match.version_end_including,
    ) {
        (Some(start), Some(end), _) => Some(format!(">={} <{}", start, end)),
        (Some(start), None, Some(end)) => Some(format!(">={} <={}", start, end)),
        (None, Some(end), _) => Some(format!("<{}", end)),
        (None, None, Some(end)) => Some(format!("<={}", end)),
        (Some(start), None, None) => Some(format!(">={}", start)),
        _ => None,
    }
}

// NVD API response structures
#[derive(Debug, Deserialize)]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Deserialize)]
struct NvdVulnerability {
    cve: NvdCve,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCve {
    id: String,
    #[serde(default)]
    descriptions: Vec<NvdDescription>,
    metrics: Option<NvdMetrics>,
    configurations: Option<Vec<NvdConfiguration>>,
}

#[derive(Debug, Deserialize)]
struct NvdDescription {
    lang: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetrics {
    cvss_metric_v31: Option<Vec<NvdCvssMetric>>,
    cvss_metric_v30: Option<Vec<NvdCvssMetric>>,
    cvss_metric_v2: Option<Vec<NvdCvssMetric>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCvssMetric {
    cvss_data: NvdCvssData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCvssData {
    base_score: f64,
}

#[derive(Debug, Deserialize)]
struct NvdConfiguration {
    #[serde(default)]
    nodes: Vec<NvdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdNode {
    #[serde(default)]
    cpe_match: Vec<NvdCpeMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCpeMatch {
    #[serde(default)]
    vulnerable: bool,
    #[serde(default)]
    version_start_including: Option<String>,
    #[serde(default)]
    version_end_excluding: Option<String>,
    #[serde(default)]
    version_end_including: Option<String>,
}
