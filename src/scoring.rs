//! Scoring: Admiralty ratings, risk scores, and action recommendations
//!
//! The Admiralty code grades the evidence behind an MSV (letter for source
//! reliability, digit for credibility). The risk score folds exploitation
//! evidence, exploit-probability, CVE volume, and uncertainty into a
//! single 0-100 number. The action generator turns a result plus the
//! user's installed version into one recommendation.

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;
use crate::sources::{AggregatedResult, Finding};
use crate::version;

/// Two-symbol evidence grade, e.g. A1, B2, F6
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmiraltyRating {
    pub rating: String,
    pub reliability: char,
    pub credibility: u8,
    pub description: String,
}

impl AdmiraltyRating {
    pub fn new(reliability: char, credibility: u8, description: &str) -> Self {
        Self {
            rating: format!("{}{}", reliability, credibility),
            reliability,
            credibility,
            description: description.to_string(),
        }
    }
}

/// Evidence summary feeding the Admiralty table
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub has_vendor_advisory: bool,
    pub has_kev: bool,
    pub has_vulncheck_poc: bool,
    pub max_epss: Option<f64>,
    pub has_cve_data: bool,
    pub cve_count: usize,
    pub msv_determined: bool,
}

impl Evidence {
    /// Summarize an aggregated result
    pub fn from_result(result: &AggregatedResult) -> Self {
        Self {
            has_vendor_advisory: result.has_vendor_advisory,
            has_kev: result.has_kev_cves,
            has_vulncheck_poc: result.findings.iter().any(|f| f.has_poc && !f.in_kev),
            max_epss: max_epss(&result.findings),
            has_cve_data: !result.findings.is_empty(),
            cve_count: result.findings.len(),
            msv_determined: result.minimum_safe_version.is_some(),
        }
    }
}

/// Rate the MSV evidence on the Admiralty scale
pub fn admiralty_rating(evidence: &Evidence, epss_threshold: f64) -> AdmiraltyRating {
    if evidence.msv_determined {
        if evidence.has_kev {
            return AdmiraltyRating::new(
                'A',
                1,
                "Confirmed by CISA KEV active-exploitation evidence",
            );
        }
        if evidence.has_vendor_advisory {
            return AdmiraltyRating::new('A', 2, "Vendor advisory with asserted fixed versions");
        }
        if evidence.has_vulncheck_poc {
            return AdmiraltyRating::new('B', 2, "Exploit intelligence with public proof-of-concept");
        }
        if evidence.max_epss.map_or(false, |e| e >= epss_threshold) {
            return AdmiraltyRating::new('B', 3, "Elevated exploit prediction score");
        }
        if evidence.has_cve_data {
            return AdmiraltyRating::new('C', 3, "Derived from cross-product CVE feed data");
        }
    }
    if evidence.has_cve_data {
        return AdmiraltyRating::new('C', 4, "CVE data present but no safe version determined");
    }
    AdmiraltyRating::new('F', 6, "No usable evidence from any source")
}

/// Risk severity bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Critical => write!(f, "CRITICAL"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Info => write!(f, "INFO"),
        }
    }
}

/// Composite 0-100 risk score with its component breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    pub score: u32,
    pub level: RiskLevel,
    pub kev_component: u32,
    pub epss_component: u32,
    pub cve_component: u32,
    pub uncertainty_component: u32,
}

/// Weighted risk score over the aggregated findings
///
/// Components: KEV (max 40), EPSS (max 30), CVE volume and severity
/// (max 20), uncertainty penalty (max 10).
pub fn risk_score(
    findings: &[Finding],
    msv_determined: bool,
    data_age_hours: i64,
) -> RiskScore {
    let kev_count = findings.iter().filter(|f| f.in_kev).count() as u32;
    let kev_component = if kev_count > 0 {
        (30 + 2 * (kev_count - 1)).min(40)
    } else {
        0
    };

    let epss_component = {
        let scores: Vec<f64> = findings.iter().filter_map(|f| f.epss_score).collect();
        let mut component = if scores.is_empty() {
            0.0
        } else {
            let max = scores.iter().cloned().fold(0.0, f64::max);
            let avg = scores.iter().sum::<f64>() / scores.len() as f64;
            ((0.7 * max + 0.3 * avg) * 25.0).round()
        };
        if findings.iter().any(|f| f.has_poc) {
            component += 5.0;
        }
        (component as u32).min(30)
    };

    let cve_component = {
        let count = findings.len() as f64;
        let volume = ((count + 1.0).log2() * 2.5).round().min(10.0) as u32;
        let max_cvss = findings
            .iter()
            .filter_map(|f| f.cvss_score)
            .fold(0.0, f64::max)
            .round() as u32;
        (volume + max_cvss).min(20)
    };

    let uncertainty_component = {
        let mut penalty = 0;
        if !findings.is_empty() && !msv_determined {
            penalty += 7;
        }
        if data_age_hours > 168 {
            penalty += 3;
        }
        penalty.min(10)
    };

    let score = (kev_component + epss_component + cve_component + uncertainty_component).min(100);
    let level = match score {
        s if s >= 80 => RiskLevel::Critical,
        s if s >= 60 => RiskLevel::High,
        s if s >= 40 => RiskLevel::Medium,
        s if s >= 20 => RiskLevel::Low,
        _ => RiskLevel::Info,
    };

    RiskScore {
        score,
        level,
        kev_component,
        epss_component,
        cve_component,
        uncertainty_component,
    }
}

/// Detect fixed versions drawn from a different numbering scheme
///
/// Fires when the majority of collected fixed versions have a leading
/// component that diverges from the latest release's leading component by
/// more than `factor` (e.g. fixed versions in 1.4.x against a latest of
/// 24.x means the feed matched some other product's versions).
pub fn version_scheme_mismatch(fixed_versions: &[String], latest: &str, factor: u64) -> bool {
    let Some(latest_lead) = leading_component(latest) else {
        return false;
    };
    if fixed_versions.is_empty() || latest_lead == 0 {
        return false;
    }

    let divergent = fixed_versions
        .iter()
        .filter_map(|v| leading_component(v))
        .filter(|&lead| {
            let (hi, lo) = if lead > latest_lead {
                (lead, latest_lead)
            } else {
                (latest_lead, lead.max(1))
            };
            hi / lo > factor
        })
        .count();

    divergent * 2 > fixed_versions.len()
}

fn leading_component(v: &str) -> Option<u64> {
    version::Version::parse(v).and_then(|p| p.parts.first().copied())
}

/// Recommended operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    NoAction,
    UpgradeRecommended,
    UpgradeCritical,
    Monitor,
    Investigate,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::NoAction => write!(f, "NO_ACTION"),
            Action::UpgradeRecommended => write!(f, "UPGRADE_RECOMMENDED"),
            Action::UpgradeCritical => write!(f, "UPGRADE_CRITICAL"),
            Action::Monitor => write!(f, "MONITOR"),
            Action::Investigate => write!(f, "INVESTIGATE"),
        }
    }
}

/// An action with its one-line headline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    pub action: Action,
    pub headline: String,
}

/// Decide the action for a result, honoring the catalog overrides
pub fn generate_action(
    result: &AggregatedResult,
    entry: &CatalogEntry,
    installed: Option<&str>,
) -> ActionPlan {
    if entry.eol {
        return ActionPlan {
            action: Action::UpgradeCritical,
            headline: format!("END OF LIFE: {} no longer receives fixes", entry.display_name),
        };
    }
    if entry.os_component {
        return ActionPlan {
            action: Action::Monitor,
            headline: "KEEP WINDOWS UPDATED: patched through the OS update channel".to_string(),
        };
    }

    let msv = result.minimum_safe_version.as_deref();
    let recommended = result.recommended_version.as_deref();

    if let Some(installed) = installed {
        return match msv {
            None if !result.findings.is_empty() => ActionPlan {
                action: Action::Investigate,
                headline: format!(
                    "{} CVEs known but no safe version determined",
                    result.findings.len()
                ),
            },
            None => ActionPlan {
                action: Action::NoAction,
                headline: "No known vulnerabilities affect this product".to_string(),
            },
            Some(msv) if version::compare(installed, msv) < 0 => {
                if result.has_kev_cves {
                    ActionPlan {
                        action: Action::UpgradeCritical,
                        headline: format!(
                            "Installed {} is below MSV {} with actively exploited CVEs",
                            installed, msv
                        ),
                    }
                } else {
                    ActionPlan {
                        action: Action::UpgradeRecommended,
                        headline: format!("Installed {} is below MSV {}", installed, msv),
                    }
                }
            }
            Some(_) => match recommended {
                Some(rec) if version::compare(installed, rec) < 0 => ActionPlan {
                    action: Action::Monitor,
                    headline: format!("Safe, but {} is available", rec),
                },
                _ => ActionPlan {
                    action: Action::NoAction,
                    headline: "Installed version meets the minimum safe version".to_string(),
                },
            },
        };
    }

    // No installed version to compare against
    if result.has_kev_cves {
        return ActionPlan {
            action: Action::UpgradeCritical,
            headline: "Actively exploited CVEs; update to the MSV immediately".to_string(),
        };
    }
    match (msv, result.findings.is_empty()) {
        (Some(msv), _) => ActionPlan {
            action: Action::UpgradeRecommended,
            headline: format!("Run at least {}", msv),
        },
        (None, true) => ActionPlan {
            action: Action::NoAction,
            headline: "No known vulnerabilities affect this product".to_string(),
        },
        (None, false) => ActionPlan {
            action: Action::Investigate,
            headline: "CVEs known but no safe version determined".to_string(),
        },
    }
}

fn max_epss(findings: &[Finding]) -> Option<f64> {
    findings
        .iter()
        .filter_map(|f| f.epss_score)
        .fold(None, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))))
}
