//! Typed JSON file cache with expiry
//!
//! One JSON file per key under the data directory. Every entry carries the
//! same envelope: `{schemaVersion, source, lastUpdated, expiresAt, data}`.
//! TTLs are chosen by callers; the store only enforces them on read.
//! Corrupted entries are treated as absent and overwritten on the next
//! successful fetch.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope schema version
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    schema_version: u32,
    #[serde(default)]
    source: Option<String>,
    last_updated: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    data: serde_json::Value,
}

/// Key-namespaced JSON store under a configurable directory
pub struct FileCache {
    dir: PathBuf,
    /// Per-key write locks; concurrent batch workers may write different
    /// keys freely but must serialize same-key writes
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `dir`
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe = key.replace(['/', '\\', ':', '?', '&', '='], "_");
        self.dir.join(format!("{}.json", safe))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Return the cached value for `key` if present and not expired
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let content = fs::read_to_string(&path).ok()?;
        let envelope: Envelope = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("corrupt cache entry {}: {}", key, e);
                return None;
            }
        };

        if envelope.expires_at <= Utc::now() {
            tracing::debug!("cache entry expired: {}", key);
            return None;
        }

        match serde_json::from_value(envelope.data) {
            Ok(data) => {
                tracing::debug!("cache hit: {}", key);
                Some(data)
            }
            Err(e) => {
                tracing::warn!("cache entry {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Store a value under `key` with the given TTL
    ///
    /// The write goes to a temp file in the same directory and is renamed
    /// into place, so a concurrent reader sees either the old entry or the
    /// new one, never a partial write.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
        source: Option<&str>,
    ) -> Result<()> {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            source: source.map(String::from),
            last_updated: Utc::now(),
            expires_at: Utc::now() + ttl,
            data: serde_json::to_value(data)?,
        };
        let content = serde_json::to_string(&envelope)?;

        let guard = self.lock_for(key);
        let _held = guard.lock().unwrap();

        let path = self.path_for(key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("Failed to create temp cache file")?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist cache entry: {}", path.display()))?;

        Ok(())
    }

    /// Drop an entry if it exists
    pub fn remove(&self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }

    /// Drop every entry whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &str) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && name.ends_with(".json") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        let payload = Payload {
            name: "kev".to_string(),
            count: 3,
        };
        cache
            .set("kev_catalog", &payload, Duration::hours(24), Some("cisa"))
            .unwrap();

        let read: Payload = cache.get("kev_catalog").unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        cache
            .set("stale", &"old".to_string(), Duration::hours(-1), None)
            .unwrap();
        assert_eq!(cache.get::<String>("stale"), None);
    }

    #[test]
    fn test_corrupt_entry_is_absent() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert_eq!(cache.get::<String>("bad"), None);
    }

    #[test]
    fn test_missing_key() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        assert_eq!(cache.get::<String>("nothing"), None);
    }

    #[test]
    fn test_key_sanitization() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        cache
            .set(
                "nvd:cpe:2.3:a:vendor/product",
                &1u32,
                Duration::hours(1),
                None,
            )
            .unwrap();
        assert_eq!(cache.get::<u32>("nvd:cpe:2.3:a:vendor/product"), Some(1));
        // Only one file, with no path separators in its name
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remove_prefix() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        cache.set("csaf_index_a", &1u32, Duration::hours(1), None).unwrap();
        cache.set("csaf_doc_b", &2u32, Duration::hours(1), None).unwrap();
        cache.set("eol_powershell", &3u32, Duration::hours(1), None).unwrap();

        cache.remove_prefix("csaf_");
        assert_eq!(cache.get::<u32>("csaf_index_a"), None);
        assert_eq!(cache.get::<u32>("csaf_doc_b"), None);
        assert_eq!(cache.get::<u32>("eol_powershell"), Some(3));
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();

        cache.set("k", &1u32, Duration::hours(1), None).unwrap();
        cache.set("k", &2u32, Duration::hours(1), None).unwrap();
        assert_eq!(cache.get::<u32>("k"), Some(2));
    }

    #[test]
    fn test_envelope_shape_on_disk() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        cache
            .set("shape", &42u32, Duration::hours(1), Some("test"))
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("shape.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["source"], "test");
        assert_eq!(value["data"], 42);
        assert!(value["expiresAt"].is_string());
        assert!(value["lastUpdated"].is_string());
    }
}
