//! CISA Known Exploited Vulnerabilities catalog client
//!
//! The KEV catalog is one flat JSON download. It is always consulted: a
//! KEV listing is the strongest exploitation evidence we have, and it
//! promotes findings to `in_kev = has_poc = true` during aggregation.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::http::{FetchSpec, HttpFetcher};

pub const KEV_CATALOG_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

const CACHE_KEY: &str = "cisa_kev_catalog";

/// One KEV catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KevEntry {
    #[serde(rename = "cveID")]
    pub cve_id: String,
    pub vendor_project: String,
    pub product: String,
    #[serde(default)]
    pub vulnerability_name: String,
    #[serde(default)]
    pub date_added: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub known_ransomware_campaign_use: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KevCatalog {
    #[serde(default)]
    catalog_version: String,
    #[serde(default)]
    vulnerabilities: Vec<KevEntry>,
}

/// Access to the KEV catalog
pub trait KevFeed {
    /// Entries matching any of the given product search terms, trying the
    /// terms in order and stopping at the first that matches anything
    fn entries_matching(&self, terms: &[String]) -> Result<Vec<KevEntry>>;

    /// Drop the cached catalog and re-download; returns the entry count
    fn refresh(&self) -> Result<usize>;
}

/// KEV catalog client with file-cache backing
pub struct KevClient {
    http: Arc<HttpFetcher>,
    cache_ttl: chrono::Duration,
}

impl KevClient {
    pub fn new(http: Arc<HttpFetcher>, cache_ttl_hours: i64) -> Self {
        Self {
            http,
            cache_ttl: chrono::Duration::hours(cache_ttl_hours),
        }
    }

    fn load_catalog(&self) -> Result<KevCatalog> {
        let spec = FetchSpec {
            url: KEV_CATALOG_URL,
            accept: Some("application/json"),
            cache_key: Some(CACHE_KEY),
            ttl: self.cache_ttl,
            auth: crate::http::Auth::None,
            limiter: None,
        };
        let body = self.http.fetch(&spec)?;
        let catalog: KevCatalog =
            serde_json::from_str(&body).context("Failed to parse KEV catalog")?;
        tracing::debug!(
            "KEV catalog {} with {} entries",
            catalog.catalog_version,
            catalog.vulnerabilities.len()
        );
        Ok(catalog)
    }

    /// Remove the cached catalog so the next load re-downloads
    pub fn invalidate(&self, cache: &crate::filecache::FileCache) {
        cache.remove(CACHE_KEY);
    }
}

impl KevFeed for KevClient {
    fn entries_matching(&self, terms: &[String]) -> Result<Vec<KevEntry>> {
        let catalog = self.load_catalog()?;

        for term in terms {
            let needle = term.to_lowercase();
            if needle.len() < 3 {
                // Two-letter terms match half the catalog
                continue;
            }
            let matches: Vec<KevEntry> = catalog
                .vulnerabilities
                .iter()
                .filter(|e| {
                    e.product.to_lowercase().contains(&needle)
                        || e.vendor_project.to_lowercase().contains(&needle)
                })
                .cloned()
                .collect();
            if !matches.is_empty() {
                tracing::debug!("KEV term '{}' matched {} entries", term, matches.len());
                return Ok(matches);
            }
        }

        Ok(Vec::new())
    }

    fn refresh(&self) -> Result<usize> {
        // The caller is expected to have invalidated the cache entry; this
        // re-downloads and reports the size.
        let catalog = self.load_catalog()?;
        Ok(catalog.vulnerabilities.len())
    }
}

/// Search terms for a catalog entry, most specific first
///
/// Product slug, its underscore-split words, the last word of the display
/// name, then the aliases. The caller stops at the first matching term.
pub fn search_terms(entry: &crate::catalog::CatalogEntry) -> Vec<String> {
    let mut terms = vec![entry.product.clone()];

    for word in entry.product.split('_') {
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }

    if let Some(last) = entry.display_name.split_whitespace().last() {
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(last)) {
            terms.push(last.to_string());
        }
    }

    for alias in &entry.aliases {
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(alias)) {
            terms.push(alias.clone());
        }
    }

    terms
}
