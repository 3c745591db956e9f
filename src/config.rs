//! Configuration management for safever

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path configuration
    #[serde(default)]
    pub paths: PathsConfig,

    /// HTTP client configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Source API keys and toggles
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Cache freshness configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Batch execution configuration
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory for safever data (caches, MSV results, vuln DB)
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Resolve the data root: PAI_DIR, then $HOME/AI-Projects, then a
/// platform-appropriate data directory.
fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PAI_DIR") {
        return PathBuf::from(dir).join("safever");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join("AI-Projects").join("safever");
    }
    directories::ProjectDirs::from("org", "safever", "safever")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".safever"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum attempts per request (first try plus retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// NVD API key; raises the rate limit from 5/30s to 50/30s
    #[serde(default)]
    pub nvd_api_key: Option<String>,

    /// VulnCheck bearer token; enables the VulnCheck source
    #[serde(default)]
    pub vulncheck_api_key: Option<String>,

    /// EPSS score threshold for the Admiralty B3 rating
    #[serde(default = "default_epss_threshold")]
    pub epss_threshold: f64,
}

fn default_epss_threshold() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum age of an aggregated MSV result before re-query (hours)
    #[serde(default = "default_msv_max_age")]
    pub msv_max_age_hours: i64,

    /// TTL for cached vendor advisory payloads (hours)
    #[serde(default = "default_advisory_ttl")]
    pub advisory_ttl_hours: i64,

    /// TTL for cached feed payloads: KEV, EPSS, CPE searches (hours)
    #[serde(default = "default_feed_ttl")]
    pub feed_ttl_hours: i64,

    /// Maximum age of the offline vuln DB before refresh is suggested (hours)
    #[serde(default = "default_vulndb_max_age")]
    pub vulndb_max_age_hours: i64,
}

fn default_msv_max_age() -> i64 {
    24
}

fn default_advisory_ttl() -> i64 {
    4
}

fn default_feed_ttl() -> i64 {
    24
}

fn default_vulndb_max_age() -> i64 {
    168
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            msv_max_age_hours: default_msv_max_age(),
            advisory_ttl_hours: default_advisory_ttl(),
            feed_ttl_hours: default_feed_ttl(),
            vulndb_max_age_hours: default_vulndb_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of parallel workers for batch checks
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    5
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            http: HttpConfig::default(),
            sources: SourcesConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults
    ///
    /// Environment variables NVD_API_KEY and VULNCHECK_API_KEY override the
    /// corresponding file values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(|| {
                if let Ok(dir) = std::env::var("PAI_DIR") {
                    let candidate = PathBuf::from(dir).join("safever.toml");
                    if candidate.exists() {
                        return Some(candidate);
                    }
                }

                directories::ProjectDirs::from("org", "safever", "safever")
                    .map(|d| d.config_dir().join("safever.toml"))
                    .filter(|p| p.exists())
            });

        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))?
            }
            None => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("NVD_API_KEY") {
            if !key.is_empty() {
                self.sources.nvd_api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("VULNCHECK_API_KEY") {
            if !key.is_empty() {
                self.sources.vulncheck_api_key = Some(key);
            }
        }
    }

    /// Directory for cached source payloads
    pub fn cache_dir(&self) -> PathBuf {
        self.paths.data_dir.join("cache")
    }

    /// Path to the MSV result cache file
    pub fn msv_cache_file(&self) -> PathBuf {
        self.paths.data_dir.join("msv-cache.json")
    }

    /// Directory holding the offline vulnerability database files
    pub fn vulndb_dir(&self) -> PathBuf {
        self.paths.data_dir.join("vdb")
    }

    /// User-Agent header for all outbound requests
    pub fn user_agent() -> String {
        format!("safever/{}", env!("CARGO_PKG_VERSION"))
    }
}
