//! EPSS score client
//!
//! The Exploit Prediction Scoring System publishes a daily per-CVE
//! probability of exploitation within 30 days. Used purely for enrichment;
//! EPSS never contributes findings of its own.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::http::{FetchSpec, HttpFetcher};

const EPSS_API_URL: &str = "https://api.first.org/data/v1/epss";

/// Bulk queries are capped; one aggregation never asks for more
pub const EPSS_QUERY_CAP: usize = 30;

/// Bulk EPSS score lookup
pub trait EpssFeed {
    /// Scores for up to [`EPSS_QUERY_CAP`] CVE ids; missing ids are simply
    /// absent from the map
    fn scores(&self, cve_ids: &[String]) -> Result<HashMap<String, f64>>;
}

pub struct EpssClient {
    http: Arc<HttpFetcher>,
}

impl EpssClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

impl EpssFeed for EpssClient {
    fn scores(&self, cve_ids: &[String]) -> Result<HashMap<String, f64>> {
        if cve_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let capped: Vec<&str> = cve_ids
            .iter()
            .take(EPSS_QUERY_CAP)
            .map(String::as_str)
            .collect();
        let url = format!("{}?cve={}", EPSS_API_URL, capped.join(","));

        let mut spec = FetchSpec::plain(&url);
        spec.accept = Some("application/json");
        let body = self.http.fetch(&spec)?;
        parse_scores(&body)
    }
}

fn parse_scores(body: &str) -> Result<HashMap<String, f64>> {
    let response: EpssResponse =
        serde_json::from_str(body).context("Failed to parse EPSS response")?;

    let mut scores = HashMap::new();
    for row in response.data {
        // Scores arrive as decimal strings
        match row.epss.parse::<f64>() {
            Ok(score) => {
                scores.insert(row.cve, score);
            }
            Err(_) => {
                tracing::warn!("unparseable EPSS score for {}: {}", row.cve, row.epss);
            }
        }
    }
    Ok(scores)
}

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssRow>,
}

#[derive(Debug, Deserialize)]
struct EpssRow {
    cve: String,
    epss: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scores() {
        let body = r#"{
            "status": "OK",
            "data": [
                {"cve": "CVE-2024-3400", "epss": "0.962340000", "percentile": "0.999"},
                {"cve": "CVE-2025-0001", "epss": "0.000430000", "percentile": "0.081"}
            ]
        }"#;
        let scores = parse_scores(body).unwrap();
        assert_eq!(scores.len(), 2);
        assert!((scores["CVE-2024-3400"] - 0.96234).abs() < 1e-9);
        assert!((scores["CVE-2025-0001"] - 0.00043).abs() < 1e-9);
    }

    #[test]
    fn test_parse_bad_score_skipped() {
        let body = r#"{"data": [{"cve": "CVE-1", "epss": "n/a"}]}"#;
        let scores = parse_scores(body).unwrap();
        assert!(scores.is_empty());
    }

    #[test]
    fn test_empty_data() {
        let scores = parse_scores("{}").unwrap();
        assert!(scores.is_empty());
    }
}
