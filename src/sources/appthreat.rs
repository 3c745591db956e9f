//! Offline vulnerability database client (AppThreat vdb6 bundle)
//!
//! Reads the two SQLite files shipped by the external producer:
//! `data.vdb6` (table `cve_data`, CVE JSON 5.2 payloads in `source_data`)
//! and `data.index.vdb6` (table `cve_index`, the package/vers lookup
//! index). Both are opened read-only; each file gets exactly one
//! connection, owned by this client for its lifetime and released on drop.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OpenFlags};

use super::{Finding, Severity};

/// Index database file name
pub const INDEX_FILE: &str = "data.index.vdb6";
/// Data database file name
pub const DATA_FILE: &str = "data.vdb6";

/// Options for CPE-keyed searches
#[derive(Debug, Clone)]
pub struct CpeSearchOptions {
    /// Drop findings scored below this CVSS (unscored findings are kept)
    pub min_cvss: f64,
    /// Drop malicious-package records (MAL-* ids)
    pub exclude_malware: bool,
}

impl Default for CpeSearchOptions {
    fn default() -> Self {
        Self {
            min_cvss: 4.0,
            exclude_malware: true,
        }
    }
}

/// Read-only queries over the offline vuln DB
pub trait OfflineVulnDb {
    fn search_by_cpe(&self, cpe: &str, options: &CpeSearchOptions) -> Result<Vec<Finding>>;
    fn search_by_purl(&self, purl: &str) -> Result<Vec<Finding>>;
    fn lookup_cve(&self, cve_id: &str) -> Result<Vec<Finding>>;
}

/// Client over the AppThreat SQLite bundle
#[derive(Debug)]
pub struct AppThreatClient {
    index: Connection,
    data: Connection,
}

impl AppThreatClient {
    /// Open both database files read-only
    pub fn open(db_dir: &Path) -> Result<Self> {
        let index_path = db_dir.join(INDEX_FILE);
        let data_path = db_dir.join(DATA_FILE);

        if !index_path.exists() || !data_path.exists() {
            return Err(crate::error::SafeverError::Database(format!(
                "offline vulnerability database not found in {}; install the \
                 AppThreat CLI (pip install appthreat-vulnerability-db) and \
                 run `vdb --download-data`",
                db_dir.display()
            ))
            .into());
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let index = Connection::open_with_flags(&index_path, flags)
            .with_context(|| format!("Failed to open {}", index_path.display()))?;
        let data = Connection::open_with_flags(&data_path, flags)
            .with_context(|| format!("Failed to open {}", data_path.display()))?;

        Ok(Self { index, data })
    }

    /// Age of the local database copy in hours, or None when absent
    pub fn age_hours(db_dir: &Path) -> Option<i64> {
        let metadata = std::fs::metadata(db_dir.join(DATA_FILE)).ok()?;
        let modified = metadata.modified().ok()?;
        let age = std::time::SystemTime::now().duration_since(modified).ok()?;
        Some((age.as_secs() / 3600) as i64)
    }

    /// Re-download the database via the external `vdb` CLI when the local
    /// copy is older than `max_hours` or missing
    pub fn ensure_fresh(db_dir: &Path, max_hours: i64) -> Result<()> {
        if let Some(age) = Self::age_hours(db_dir) {
            if age <= max_hours {
                tracing::debug!("offline vuln DB is {}h old, fresh enough", age);
                return Ok(());
            }
            tracing::info!("offline vuln DB is {}h old, refreshing", age);
        } else {
            tracing::info!("offline vuln DB missing, downloading");
        }

        std::fs::create_dir_all(db_dir)?;
        let status = Command::new("vdb")
            .arg("--download-data")
            .env("VDB_HOME", db_dir)
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => bail!("vdb exited with {}", status),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => bail!(
                "The `vdb` CLI is not installed. Install it with \
                 `pip install appthreat-vulnerability-db`, then run \
                 `vdb --download-data`."
            ),
            Err(e) => Err(e).context("Failed to run vdb"),
        }
    }

    /// Look up index rows for a package, returning (cve_id, vers) pairs
    fn index_rows(&self, namespace: &str, name: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .index
            .prepare("SELECT cve_id, vers FROM cve_index WHERE namespace = ?1 AND name = ?2")?;
        let rows = stmt
            .query_map([namespace, name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pull description/CVSS out of the CVE JSON 5.2 payload for one id
    fn data_row(&self, cve_id: &str) -> Result<Option<(Option<String>, Option<f64>, Option<String>)>> {
        let mut stmt = self.data.prepare(
            "SELECT json_extract(source_data, '$.containers.cna.descriptions[0].value'),
                    json_extract(source_data, '$.containers.cna.metrics[0].cvssV3_1.baseScore'),
                    json_extract(source_data, '$.containers.cna.metrics[0].cvssV3_1.baseSeverity')
             FROM cve_data WHERE cve_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([cve_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
            None => Ok(None),
        }
    }

    fn build_finding(&self, cve_id: &str, vers: &str) -> Result<Finding> {
        let mut finding = Finding::new(cve_id);
        finding.fixed_version = fixed_from_vers(vers);
        finding.affected_range = Some(vers.to_string());
        finding.source = Some("AppThreat".to_string());

        if let Some((description, score, severity_label)) = self.data_row(cve_id)? {
            finding.description = description;
            finding.cvss_score = score;
            finding.severity = match (score, severity_label) {
                (Some(s), _) => Some(Severity::from_cvss(s)),
                (None, Some(label)) => Some(Severity::from_label(&label)),
                (None, None) => None,
            };
        }
        Ok(finding)
    }

    fn search(&self, namespace: &str, name: &str, options: &CpeSearchOptions) -> Result<Vec<Finding>> {
        let mut seen = HashSet::new();
        let mut findings = Vec::new();

        for (cve_id, vers) in self.index_rows(namespace, name)? {
            if !seen.insert(cve_id.clone()) {
                continue;
            }
            if options.exclude_malware && cve_id.starts_with("MAL-") {
                continue;
            }
            let finding = self.build_finding(&cve_id, &vers)?;
            if let Some(score) = finding.cvss_score {
                if score < options.min_cvss {
                    continue;
                }
            }
            findings.push(finding);
        }
        Ok(findings)
    }

}

impl OfflineVulnDb for AppThreatClient {
    fn search_by_cpe(&self, cpe: &str, options: &CpeSearchOptions) -> Result<Vec<Finding>> {
        let (vendor, product) =
            parse_cpe(cpe).with_context(|| format!("Invalid CPE string: {}", cpe))?;
        self.search(&vendor, &product, options)
    }

    fn search_by_purl(&self, purl: &str) -> Result<Vec<Finding>> {
        let (ecosystem, name) =
            parse_purl(purl).with_context(|| format!("Invalid PURL string: {}", purl))?;
        self.search(&ecosystem, &name, &CpeSearchOptions::default())
    }

    fn lookup_cve(&self, cve_id: &str) -> Result<Vec<Finding>> {
        let mut stmt = self
            .index
            .prepare("SELECT cve_id, vers FROM cve_index WHERE cve_id = ?1")?;
        let rows = stmt
            .query_map([cve_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut findings = Vec::new();
        for (id, vers) in rows.into_iter().take(1) {
            findings.push(self.build_finding(&id, &vers)?);
        }
        Ok(findings)
    }
}

/// Extract (vendor, product) from a CPE 2.3 string
fn parse_cpe(cpe: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = cpe.split(':').collect();
    // cpe:2.3:part:vendor:product:version:...
    if parts.len() < 5 || parts[0] != "cpe" || parts[1] != "2.3" {
        return None;
    }
    Some((parts[3].to_string(), parts[4].to_string()))
}

/// Extract (ecosystem, name) from a PURL
fn parse_purl(purl: &str) -> Option<(String, String)> {
    let rest = purl.strip_prefix("pkg:")?;
    let (ecosystem, tail) = rest.split_once('/')?;
    // Drop any version/qualifier suffix, keep the last path segment as name
    let name_part = tail.split(['@', '?']).next()?;
    let name = name_part.rsplit('/').next()?;
    Some((ecosystem.to_string(), name.to_string()))
}

/// One fixed version out of a VERS range string
///
/// `vers:generic/>=9.0.0|<9.0.110` means the branch is fixed at `9.0.110`.
/// An inclusive upper bound (`<=`) leaves the exact fix unknown and is
/// recorded as `>B` so it still surfaces without anchoring the MSV floor.
pub fn fixed_from_vers(vers: &str) -> Option<String> {
    let body = vers.strip_prefix("vers:").unwrap_or(vers);
    let body = body.split_once('/').map_or(body, |(_, rest)| rest);

    for segment in body.split('|') {
        let segment = segment.trim();
        if let Some(bound) = segment.strip_prefix("<=") {
            return Some(format!(">{}", bound.trim()));
        }
        if let Some(bound) = segment.strip_prefix('<') {
            return Some(bound.trim().to_string());
        }
    }
    None
}
