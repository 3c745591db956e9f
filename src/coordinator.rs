//! Query coordination: the public entry point for one product query
//!
//! Resolves user input against the catalog, short-circuits products that
//! must never contact a source (OS components, discontinued lines,
//! variant parents), builds the source set for everything else, and
//! assembles aggregation plus scoring into one result.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregateOptions, Aggregator, SourceSet};
use crate::cancel::CancelToken;
use crate::catalog::{Catalog, CatalogEntry};
use crate::config::Config;
use crate::error::{Result, SafeverError};
use crate::filecache::FileCache;
use crate::http::HttpFetcher;
use crate::msvcache::MsvCache;
use crate::scoring::{
    self, Action, ActionPlan, AdmiraltyRating, Evidence, RiskScore,
};
use crate::sources::{
    vendor, AggregatedResult, AppThreatClient, BranchMsv, EpssClient, Finding, KevClient,
    NvdClient, SourceResult, VulnCheckClient,
};

/// Options for one query
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// The caller's installed version, for the compliance verdict
    pub installed_version: Option<String>,
    /// Drop cached results and re-aggregate
    pub force: bool,
}

/// The assembled answer for one product
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsvResult {
    pub product_id: String,
    pub display_name: String,
    /// The MSV display string: a version, "unknown", or a sentinel such
    /// as "N/A (OS Component)" or "UNSUPPORTED"
    pub msv: String,
    #[serde(default)]
    pub recommended: Option<String>,
    pub rating: AdmiraltyRating,
    pub risk: RiskScore,
    pub action: ActionPlan,
    #[serde(default)]
    pub branches: Vec<BranchMsv>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub sources: Vec<SourceResult>,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
    /// Per-variant results for release-track parents; the parent itself
    /// carries no synthesized MSV
    #[serde(default)]
    pub variants: Vec<MsvResult>,
}

/// The public query surface
pub struct Coordinator {
    config: Config,
    catalog: Catalog,
    http: Arc<HttpFetcher>,
    file_cache: Arc<FileCache>,
    aggregator: Aggregator,
    cancel: CancelToken,
}

impl Coordinator {
    pub fn new(config: Config, catalog: Catalog, cancel: CancelToken) -> anyhow::Result<Self> {
        let file_cache = Arc::new(FileCache::new(&config.cache_dir())?);
        let http = Arc::new(HttpFetcher::new(&config, Arc::clone(&file_cache), cancel.clone())?);
        let aggregator = Aggregator::new(
            MsvCache::new(&config.msv_cache_file()),
            Some(Arc::clone(&file_cache)),
            config.cache.msv_max_age_hours,
        );

        Ok(Self {
            config,
            catalog,
            http,
            file_cache,
            aggregator,
            cancel,
        })
    }

    /// Resolve a name and produce its full MSV result
    pub fn query_msv(&self, name: &str, options: &QueryOptions) -> Result<MsvResult> {
        let entry = self
            .catalog
            .resolve(name)
            .ok_or_else(|| SafeverError::UnknownProduct(name.to_string()))?;
        self.query_entry(entry, options, 0)
    }

    fn query_entry(
        &self,
        entry: &CatalogEntry,
        options: &QueryOptions,
        depth: usize,
    ) -> Result<MsvResult> {
        if self.cancel.is_cancelled() {
            return Err(SafeverError::Cancelled);
        }

        // OS components are patched through the OS update channel; no
        // source is ever contacted for them.
        if entry.os_component {
            return Ok(self.synthetic_result(
                entry,
                "N/A (OS Component)",
                AdmiraltyRating::new('A', 2, "Serviced through the operating system"),
                options,
            ));
        }

        // Discontinued lines have no safe version by definition.
        if entry.eol {
            return Ok(self.synthetic_result(
                entry,
                "UNSUPPORTED",
                AdmiraltyRating::new('A', 1, "Product line is end-of-life"),
                options,
            ));
        }

        // Release-track parents fan out to their variants; single depth
        // keeps a miswired catalog from recursing.
        if !entry.variants.is_empty() && depth == 0 {
            return self.query_variants(entry, options);
        }

        let sources = self.build_sources(entry);
        let aggregate_options = AggregateOptions {
            force: options.force,
            max_age_hours: None,
        };
        let result = self.aggregator.aggregate(entry, &sources, &aggregate_options)?;

        Ok(self.assemble(entry, result, options))
    }

    fn query_variants(&self, entry: &CatalogEntry, options: &QueryOptions) -> Result<MsvResult> {
        let mut variants = Vec::new();
        for variant_id in &entry.variants {
            match self.catalog.get(variant_id) {
                Some(variant) => variants.push(self.query_entry(variant, options, 1)?),
                None => {
                    tracing::warn!("catalog variant {} of {} not found", variant_id, entry.id);
                }
            }
        }

        // The parent reports its children; the worst child action and the
        // strongest child rating summarize the family.
        let action = variants
            .iter()
            .map(|v| v.action.clone())
            .max_by_key(|p| action_rank(p.action))
            .unwrap_or(ActionPlan {
                action: Action::Investigate,
                headline: "No variant results available".to_string(),
            });
        let rating = variants
            .iter()
            .map(|v| v.rating.clone())
            .min_by_key(|r| (r.reliability, r.credibility))
            .unwrap_or_else(|| AdmiraltyRating::new('F', 6, "No usable evidence from any source"));
        let risk = variants
            .iter()
            .map(|v| v.risk.clone())
            .max_by_key(|r| r.score)
            .unwrap_or_else(|| scoring::risk_score(&[], true, 0));

        Ok(MsvResult {
            product_id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            msv: "N/A (per-variant)".to_string(),
            recommended: None,
            rating,
            risk,
            action,
            branches: vec![],
            findings: vec![],
            sources: vec![],
            installed_version: options.installed_version.clone(),
            from_cache: false,
            variants,
        })
    }

    /// A result produced without contacting any source
    fn synthetic_result(
        &self,
        entry: &CatalogEntry,
        msv: &str,
        rating: AdmiraltyRating,
        options: &QueryOptions,
    ) -> MsvResult {
        let result = AggregatedResult {
            product_id: entry.id.clone(),
            branches: vec![],
            findings: vec![],
            sources: vec![],
            minimum_safe_version: None,
            recommended_version: None,
            has_kev_cves: false,
            has_vendor_advisory: false,
            timestamp: Utc::now(),
            from_cache: false,
        };
        let action = scoring::generate_action(&result, entry, options.installed_version.as_deref());

        MsvResult {
            product_id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            msv: msv.to_string(),
            recommended: None,
            rating,
            risk: scoring::risk_score(&[], true, 0),
            action,
            branches: vec![],
            findings: vec![],
            sources: vec![],
            installed_version: options.installed_version.clone(),
            from_cache: false,
            variants: vec![],
        }
    }

    fn assemble(
        &self,
        entry: &CatalogEntry,
        result: AggregatedResult,
        options: &QueryOptions,
    ) -> MsvResult {
        let evidence = Evidence::from_result(&result);
        let rating = scoring::admiralty_rating(&evidence, self.config.sources.epss_threshold);
        let data_age_hours = (Utc::now() - result.timestamp).num_hours();
        let risk = scoring::risk_score(
            &result.findings,
            result.minimum_safe_version.is_some(),
            data_age_hours,
        );
        let action =
            scoring::generate_action(&result, entry, options.installed_version.as_deref());

        MsvResult {
            product_id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            msv: result
                .minimum_safe_version
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            recommended: result.recommended_version.clone(),
            rating,
            risk,
            action,
            branches: result.branches,
            findings: result.findings,
            sources: result.sources,
            installed_version: options.installed_version.clone(),
            from_cache: result.from_cache,
            variants: vec![],
        }
    }

    /// Wire the real source clients for one entry
    fn build_sources(&self, entry: &CatalogEntry) -> SourceSet {
        let advisory_ttl = self.config.cache.advisory_ttl_hours;
        let feed_ttl = self.config.cache.feed_ttl_hours;

        let offline = match AppThreatClient::open(&self.config.vulndb_dir()) {
            Ok(client) => Some(Box::new(client) as Box<dyn crate::sources::OfflineVulnDb>),
            Err(e) => {
                tracing::debug!("offline vuln DB unavailable: {}", e);
                None
            }
        };

        SourceSet {
            vendor: vendor::fetcher_for(entry, &self.http, advisory_ttl),
            offline,
            kev: Some(Box::new(KevClient::new(Arc::clone(&self.http), feed_ttl))),
            vulncheck: self.config.sources.vulncheck_api_key.as_ref().map(|token| {
                Box::new(VulnCheckClient::new(
                    Arc::clone(&self.http),
                    token.clone(),
                    feed_ttl,
                )) as Box<dyn crate::sources::ExploitIntel>
            }),
            nvd: Some(Box::new(NvdClient::new(
                Arc::clone(&self.http),
                self.config.sources.nvd_api_key.clone(),
                feed_ttl,
            ))),
            epss: Some(Box::new(EpssClient::new(Arc::clone(&self.http)))),
        }
    }

    /// Force a KEV catalog refresh; returns the entry count
    pub fn refresh_kev(&self) -> anyhow::Result<usize> {
        use crate::sources::KevFeed;
        let client = KevClient::new(Arc::clone(&self.http), self.config.cache.feed_ttl_hours);
        client.invalidate(&self.file_cache);
        client.refresh()
    }

    /// The loaded catalog
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn action_rank(action: Action) -> u8 {
    match action {
        Action::UpgradeCritical => 4,
        Action::UpgradeRecommended => 3,
        Action::Investigate => 2,
        Action::Monitor => 1,
        Action::NoAction => 0,
    }
}
