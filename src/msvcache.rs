//! MSV result cache
//!
//! Aggregated results persist to a single JSON file keyed by
//! `vendor:product` (lowercase). A cache hit requires both freshness and
//! completeness: a young entry with no usable branch MSV and no explicit
//! zero-CVE justification still forces re-aggregation. Writes are atomic
//! (temp file + rename) so concurrent readers always see one consistent
//! snapshot.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SafeverError};
use crate::sources::AggregatedResult;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Confidence tag derived from the evidence provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

/// One persisted aggregation result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsvCacheEntry {
    /// v1 entries predate this field and deserialize as 1
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub product_id: String,
    pub result: AggregatedResult,
    pub last_updated: DateTime<Utc>,
    /// When each branch was last confirmed against its sources
    #[serde(default)]
    pub branch_checked: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub confidence: Confidence,
    /// Why this entry is trustworthy, e.g. an explicit zero-CVE statement
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub cve_count: Option<usize>,
}

fn default_schema_version() -> u32 {
    1
}

impl MsvCacheEntry {
    /// Whether the entry carries enough evidence to be served
    ///
    /// Complete means at least one branch with a determined MSV, or an
    /// explicit zero-CVE justification. Age alone never makes an entry
    /// servable.
    pub fn is_complete(&self) -> bool {
        let has_branch = self
            .result
            .branches
            .iter()
            .any(|b| b.msv != "unknown" && !b.msv.is_empty());
        let zero_cve = self.justification.is_some() && self.cve_count == Some(0);
        has_branch || zero_cve
    }

    fn age_hours(&self) -> i64 {
        (Utc::now() - self.last_updated).num_hours()
    }
}

/// The single-file MSV cache
pub struct MsvCache {
    path: PathBuf,
}

impl MsvCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn load(&self) -> HashMap<String, MsvCacheEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("corrupt MSV cache, starting fresh: {}", e);
                HashMap::new()
            }
        }
    }

    fn store(&self, entries: &HashMap<String, MsvCacheEntry>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| SafeverError::CacheWrite(e.to_string()))?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| SafeverError::CacheWrite("cache path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| SafeverError::CacheWrite(e.to_string()))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| SafeverError::CacheWrite(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| SafeverError::CacheWrite(e.to_string()))?;
        Ok(())
    }

    /// Read one entry
    pub fn get(&self, key: &str) -> Option<MsvCacheEntry> {
        self.load().get(key).cloned()
    }

    /// Insert or replace one entry
    pub fn update(&self, key: &str, entry: MsvCacheEntry) -> Result<()> {
        let mut entries = self.load();
        entries.insert(key.to_string(), entry);
        self.store(&entries)
    }

    /// Remove one entry (used by `--force` before re-aggregating)
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.load();
        if entries.remove(key).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }

    /// Whether a fresh aggregation is needed for this key
    ///
    /// Stale = missing, pre-v2 schema, incomplete, or older than
    /// `max_age_hours`. Completeness and age are independent: an
    /// incomplete entry is always stale no matter how young.
    pub fn needs_refresh(&self, key: &str, max_age_hours: i64) -> bool {
        match self.get(key) {
            None => true,
            Some(entry) => {
                entry.schema_version < SCHEMA_VERSION
                    || !entry.is_complete()
                    || entry.age_hours() >= max_age_hours
            }
        }
    }
}
