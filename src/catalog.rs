//! Software catalog: the curated registry of auditable products
//!
//! Loaded once from a single JSON document (`_metadata` plus a `software`
//! array) into an in-memory map. Entries are immutable for the life of the
//! process. Unknown fields round-trip untouched so newer catalog files keep
//! working with older binaries.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The default curated catalog shipped with the binary
const DEFAULT_CATALOG: &str = include_str!("../data/catalog.json");

/// Catalog priority tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// One product in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Stable slug, e.g. `powershell`
    pub id: String,
    pub vendor: String,
    pub product: String,
    pub display_name: String,
    /// CPE 2.3 identifier, when the product has one
    #[serde(default)]
    pub cpe: Option<String>,
    /// Alternate names accepted during resolution
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Regex that valid fixed-version strings for this product must match;
    /// guards against cross-product contamination in shared feeds
    #[serde(default)]
    pub version_pattern: Option<String>,
    /// Findings whose description matches any of these regexes are dropped
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Newest release the catalog knows about
    #[serde(default)]
    pub latest_version: Option<String>,
    /// Patched through the OS update channel, not individually
    #[serde(default)]
    pub os_component: bool,
    /// Product line is discontinued
    #[serde(default)]
    pub eol: bool,
    /// Child product ids for distinct release tracks, queried independently
    #[serde(default)]
    pub variants: Vec<String>,
    /// Unknown fields, preserved for forward compatibility
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CatalogEntry {
    /// The MSV-cache key for this entry: `vendor:product`, lowercase
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.vendor, self.product).to_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(rename = "_metadata", default)]
    metadata: serde_json::Value,
    software: Vec<CatalogEntry>,
}

/// The loaded catalog
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_id: HashMap<String, usize>,
    metadata: serde_json::Value,
}

impl Catalog {
    /// Load the embedded default catalog
    pub fn load_default() -> Result<Self> {
        Self::from_json(DEFAULT_CATALOG).context("Embedded catalog is malformed")
    }

    /// Load a catalog from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))
    }

    fn from_json(content: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(content)?;
        let by_id = document
            .software
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        Ok(Self {
            entries: document.software,
            by_id,
            metadata: document.metadata,
        })
    }

    /// Resolve user input to a catalog entry
    ///
    /// Order: exact id match, case-insensitive alias match, then substring
    /// match against the display name or product slug with the file's
    /// declared order breaking ties. Variant parents resolve to themselves;
    /// the coordinator queries their children.
    pub fn resolve(&self, input: &str) -> Option<&CatalogEntry> {
        if let Some(&idx) = self.by_id.get(input) {
            return Some(&self.entries[idx]);
        }

        let needle = input.to_lowercase();

        for entry in &self.entries {
            if entry.id.to_lowercase() == needle
                || entry.aliases.iter().any(|a| a.to_lowercase() == needle)
            {
                return Some(entry);
            }
        }

        self.entries.iter().find(|entry| {
            entry.display_name.to_lowercase().contains(&needle)
                || entry.product.to_lowercase().contains(&needle)
        })
    }

    /// Look up an entry by exact id (used for variant children)
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.by_id.get(id).map(|&idx| &self.entries[idx])
    }

    /// All entries in file order
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// The catalog document's `_metadata` block
    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }
}
