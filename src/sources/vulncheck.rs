//! VulnCheck exploit-intelligence client
//!
//! Token-gated: the source only participates when `VULNCHECK_API_KEY` is
//! configured. Contributes exploit evidence (`has_poc`) and CVSS scores
//! for CPE-matched CVEs; like NVD it never asserts branch MSVs.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::http::{Auth, FetchSpec, HttpFetcher};

use super::{Finding, Severity};

const VULNCHECK_API_URL: &str = "https://api.vulncheck.com/v3/index/vulncheck-nvd2";

/// Exploit-intelligence lookup by CPE
pub trait ExploitIntel {
    fn search_cpe(&self, cpe: &str) -> Result<Vec<Finding>>;
}

pub struct VulnCheckClient {
    http: Arc<HttpFetcher>,
    token: String,
    cache_ttl: chrono::Duration,
}

impl VulnCheckClient {
    pub fn new(http: Arc<HttpFetcher>, token: String, cache_ttl_hours: i64) -> Self {
        Self {
            http,
            token,
            cache_ttl: chrono::Duration::hours(cache_ttl_hours),
        }
    }
}

impl ExploitIntel for VulnCheckClient {
    fn search_cpe(&self, cpe: &str) -> Result<Vec<Finding>> {
        let url = format!("{}?cpe={}", VULNCHECK_API_URL, urlencoding::encode(cpe));
        let cache_key = format!("vulncheck_cpe_{}", cpe);
        tracing::debug!("querying VulnCheck by CPE: {}", cpe);

        let spec = FetchSpec {
            url: &url,
            accept: Some("application/json"),
            cache_key: Some(&cache_key),
            ttl: self.cache_ttl,
            auth: Auth::Bearer(self.token.clone()),
            limiter: None,
        };
        let body = self.http.fetch(&spec)?;
        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<Vec<Finding>> {
    let response: VulnCheckResponse =
        serde_json::from_str(body).context("Failed to parse VulnCheck response")?;

    let mut findings = Vec::new();
    for item in response.data {
        let mut finding = Finding::new(&item.id);
        finding.description = item.description;
        finding.cvss_score = item.cvss_base_score;
        finding.severity = item.cvss_base_score.map(Severity::from_cvss);
        finding.has_poc = item.vulncheck_xdb.map_or(false, |x| !x.is_empty())
            || item.has_public_exploit.unwrap_or(false);
        finding.source = Some("VulnCheck".to_string());
        findings.push(finding);
    }
    Ok(findings)
}

#[derive(Debug, Deserialize)]
struct VulnCheckResponse {
    #[serde(default)]
    data: Vec<VulnCheckItem>,
}

#[derive(Debug, Deserialize)]
struct VulnCheckItem {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "cvssBaseScore", default)]
    cvss_base_score: Option<f64>,
    /// Exploit database cross-references; non-empty means a public PoC
    #[serde(rename = "vulncheckXdb", default)]
    vulncheck_xdb: Option<Vec<serde_json::Value>>,
    #[serde(rename = "hasPublicExploit", default)]
    has_public_exploit: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_exploit() {
        let body = r#"{
            "data": [{
                "id": "CVE-2024-3400",
                "description": "Command injection in GlobalProtect",
                "cvssBaseScore": 10.0,
                "vulncheckXdb": [{"xdbId": "abc"}]
            }]
        }"#;
        let findings = parse_response(body).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].has_poc);
        assert!(!findings[0].in_kev);
        assert_eq!(findings[0].cvss_score, Some(10.0));
        assert_eq!(findings[0].severity, Some(Severity::Critical));
        assert_eq!(findings[0].source.as_deref(), Some("VulnCheck"));
    }

    #[test]
    fn test_parse_response_without_exploit() {
        let body = r#"{"data": [{"id": "CVE-2025-0001", "vulncheckXdb": []}]}"#;
        let findings = parse_response(body).unwrap();
        assert!(!findings[0].has_poc);
    }

    #[test]
    fn test_empty_response() {
        assert!(parse_response("{}").unwrap().is_empty());
    }
}
