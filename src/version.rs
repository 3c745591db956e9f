//! Version parsing and comparison across vendor schemes
//!
//! Product versions in advisory feeds do not follow one grammar: dotted
//! numeric strings of arbitrary depth (`122.0.6261.94`), ASUS firmware with
//! underscore-joined build numbers (`3.0.0.4.386_51948`), Microsoft KB
//! identifiers (`KB5040442`), and vendor branch labels that only carry two
//! meaningful integer groups (`R81.20`, `plus-25.11`). This module parses
//! all of them into one comparable shape and provides the range and
//! minimum-safe-version operations built on top.

use std::cmp::Ordering;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref KB_RE: Regex = Regex::new(r"^[Kk][Bb](\d{4,})$").unwrap();
    static ref DOTTED_RE: Regex = Regex::new(r"^(\d+(?:\.\d+)*)(?:-([0-9A-Za-z.]+))?$").unwrap();
    static ref INT_GROUPS_RE: Regex = Regex::new(r"\d+").unwrap();
    static ref HEX_RUN_RE: Regex = Regex::new(r"[a-f]{4}").unwrap();
}

/// A parsed version: numeric components, an optional prerelease tag, and an
/// optional KB number for Microsoft update identifiers.
#[derive(Debug, Clone)]
pub struct Version {
    /// Numeric components, most significant first
    pub parts: Vec<u64>,
    /// Prerelease tag (`alpha`, `beta.2`); sorts below the plain release
    pub prerelease: Option<String>,
    /// KB number when the string is a Microsoft KB identifier
    pub kb: Option<u64>,
}

impl Version {
    /// Parse a version string from any recognized scheme
    ///
    /// Returns None only for strings with no digits at all.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.is_empty() {
            return None;
        }

        // Microsoft KB identifiers compare by integer
        if let Some(caps) = KB_RE.captures(s) {
            let kb = caps[1].parse().ok()?;
            return Some(Self {
                parts: vec![kb],
                prerelease: None,
                kb: Some(kb),
            });
        }

        // Leading 'v' is noise when followed by a digit
        let s = match s.strip_prefix(['v', 'V']) {
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
            _ => s,
        };

        // ASUS-style underscore-joined build numbers normalize to dots
        let normalized = s.replace('_', ".");

        if let Some(caps) = DOTTED_RE.captures(&normalized) {
            let parts = caps[1]
                .split('.')
                .map(|p| p.parse().unwrap_or(u64::MAX))
                .collect();
            return Some(Self {
                parts,
                prerelease: caps.get(2).map(|m| m.as_str().to_string()),
                kb: None,
            });
        }

        // Vendor branch labels (R81.20, plus-25.11, Take 65): the two
        // leading integer groups carry the ordering; the rest is ignored.
        let groups: Vec<u64> = INT_GROUPS_RE
            .find_iter(&normalized)
            .take(2)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if groups.is_empty() {
            return None;
        }
        Some(Self {
            parts: groups,
            prerelease: None,
            kb: None,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Missing tail parts are zero: 1.0 == 1.0.0
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }

        // Same numeric tuple: a prerelease sorts strictly below the release
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality must agree with Ord: 1.0 and 1.0.0 are the same version
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::str::FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unparseable version: {}", s))
    }
}

/// Compare two version strings; -1, 0, or 1
///
/// Unparseable strings fall back to lexicographic order so the result is
/// still total. Comparing versions from different schemes is undefined;
/// callers must not mix.
pub fn compare(a: &str, b: &str) -> i8 {
    let ord = match (Version::parse(a), Version::parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    };
    match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Evaluate a version against an operator expression such as `<=9.0.110`
///
/// Recognized operators: `<`, `<=`, `>`, `>=`, `=`, `!=`.
pub fn evaluate(version: &str, expr: &str) -> bool {
    let expr = expr.trim();
    let (op, rhs) = if let Some(rest) = expr.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = expr.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = expr.strip_prefix("!=") {
        ("!=", rest)
    } else if let Some(rest) = expr.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = expr.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = expr.strip_prefix('=') {
        ("=", rest)
    } else {
        ("=", expr)
    };

    let cmp = compare(version, rhs.trim());
    match op {
        "<" => cmp < 0,
        "<=" => cmp <= 0,
        ">" => cmp > 0,
        ">=" => cmp >= 0,
        "=" => cmp == 0,
        "!=" => cmp != 0,
        _ => false,
    }
}

/// Check whether a version falls within [start, end)
///
/// Either bound may be absent. When `expr_override` is supplied it is
/// evaluated instead of the bounds.
#[allow(dead_code)]
pub fn in_range(
    version: &str,
    start: Option<&str>,
    end: Option<&str>,
    expr_override: Option<&str>,
) -> bool {
    if let Some(expr) = expr_override {
        return evaluate(version, expr);
    }

    let after_start = start.map_or(true, |s| compare(version, s) >= 0);
    let before_end = end.map_or(true, |e| compare(version, e) < 0);
    after_start && before_end
}

/// Sort version strings ascending
pub fn sort(versions: &mut [String]) {
    versions.sort_by(|a, b| match compare(a, b) {
        -1 => Ordering::Less,
        1 => Ordering::Greater,
        _ => Ordering::Equal,
    });
}

/// The minimum safe version of a fixed-version list: its maximum
///
/// The highest patched version is the safest floor. Strings beginning with
/// `>` mean "greater than X, exact fix unknown" and are excluded from the
/// floor computation, as are strings that fail [`is_valid_version`].
pub fn find_minimum_safe_version(fixed_versions: &[String]) -> Option<String> {
    fixed_versions
        .iter()
        .filter(|v| !v.starts_with('>'))
        .filter(|v| is_valid_version(v))
        .max_by(|a, b| match compare(a, b) {
            -1 => Ordering::Less,
            1 => Ordering::Greater,
            _ => Ordering::Equal,
        })
        .cloned()
}

/// Whether an installed version is below the highest known fix
#[allow(dead_code)]
pub fn is_vulnerable(installed: &str, fixed_versions: &[String]) -> bool {
    match find_minimum_safe_version(fixed_versions) {
        Some(msv) => compare(installed, &msv) < 0,
        None => false,
    }
}

/// Filter for version strings extracted from free-text CVE descriptions
///
/// Requires a dot and a leading digit, rejects over-long strings, and
/// rejects anything with a run of four or more hex letters (git SHA
/// fragments pass the other checks surprisingly often).
pub fn is_valid_version(s: &str) -> bool {
    if s.len() > 20 || !s.contains('.') {
        return false;
    }
    if !s.starts_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    !HEX_RUN_RE.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted() {
        let v = Version::parse("122.0.6261.94").unwrap();
        assert_eq!(v.parts, vec![122, 0, 6261, 94]);
        assert!(v.prerelease.is_none());
        assert!(v.kb.is_none());
    }

    #[test]
    fn test_parse_leading_v() {
        let v = Version::parse("v2.4.1").unwrap();
        assert_eq!(v.parts, vec![2, 4, 1]);
    }

    #[test]
    fn test_parse_asus_underscore() {
        let v = Version::parse("3.0.0.4.386_51948").unwrap();
        assert_eq!(v.parts, vec![3, 0, 0, 4, 386, 51948]);
    }

    #[test]
    fn test_parse_kb() {
        let v = Version::parse("KB5040442").unwrap();
        assert_eq!(v.kb, Some(5040442));
        assert_eq!(compare("KB5040442", "KB5039212"), 1);
        assert_eq!(compare("KB5039212", "KB5040442"), -1);
    }

    #[test]
    fn test_parse_vendor_branch() {
        let v = Version::parse("R81.20").unwrap();
        assert_eq!(v.parts, vec![81, 20]);

        let v = Version::parse("plus-25.11").unwrap();
        assert_eq!(v.parts, vec![25, 11]);

        assert_eq!(compare("R81.20", "R81.10"), 1);
        assert_eq!(compare("R80.40", "R81.10"), -1);
    }

    #[test]
    fn test_parse_prerelease() {
        let v = Version::parse("1.2.3-beta").unwrap();
        assert_eq!(v.parts, vec![1, 2, 3]);
        assert_eq!(v.prerelease.as_deref(), Some("beta"));

        // Prerelease is strictly less than the same release
        assert_eq!(compare("1.2.3-beta", "1.2.3"), -1);
        assert_eq!(compare("1.2.3", "1.2.3-alpha"), 1);
        assert_eq!(compare("1.2.3-alpha", "1.2.3-beta"), -1);
    }

    #[test]
    fn test_missing_tail_is_zero() {
        assert_eq!(compare("1.0", "1.0.0"), 0);
        assert_eq!(compare("10", "10.0.0.0"), 0);
        assert_eq!(compare("1.0", "1.0.1"), -1);
    }

    #[test]
    fn test_compare_laws() {
        // Reflexive, antisymmetric, transitive within one scheme
        for v in ["1.2.3", "10.0.22621.3880", "KB5040442", "R81.20"] {
            assert_eq!(compare(v, v), 0);
        }
        assert_eq!(compare("1.2.3", "1.3.0"), -compare("1.3.0", "1.2.3"));
        assert_eq!(compare("1.0", "2.0"), -1);
        assert_eq!(compare("2.0", "3.0"), -1);
        assert_eq!(compare("1.0", "3.0"), -1);
    }

    #[test]
    fn test_evaluate() {
        assert!(evaluate("9.0.100", "<9.0.110"));
        assert!(evaluate("9.0.110", "<=9.0.110"));
        assert!(!evaluate("9.0.110", "<9.0.110"));
        assert!(evaluate("9.0.120", ">9.0.110"));
        assert!(evaluate("9.0.110", ">=9.0.110"));
        assert!(evaluate("9.0.110", "=9.0.110"));
        assert!(evaluate("9.0.111", "!=9.0.110"));
        // Bare version means equality
        assert!(evaluate("1.2", "1.2.0"));
    }

    #[test]
    fn test_in_range() {
        assert!(in_range("1.5.0", Some("1.0.0"), Some("2.0.0"), None));
        assert!(in_range("1.0.0", Some("1.0.0"), Some("2.0.0"), None));
        assert!(!in_range("2.0.0", Some("1.0.0"), Some("2.0.0"), None));
        assert!(in_range("0.1", None, Some("1.0"), None));
        assert!(in_range("9.9", Some("1.0"), None, None));
        // Override expression wins over the bounds
        assert!(in_range("3.0", Some("1.0"), Some("2.0"), Some(">=3.0")));
    }

    #[test]
    fn test_sort() {
        let mut versions = vec![
            "10.1.46".to_string(),
            "9.0.110".to_string(),
            "9.0.9".to_string(),
        ];
        sort(&mut versions);
        assert_eq!(versions, vec!["9.0.9", "9.0.110", "10.1.46"]);
    }

    #[test]
    fn test_find_minimum_safe_version_is_max() {
        let fixed = vec![
            "7.4.1".to_string(),
            "7.5.0".to_string(),
            "7.4.11".to_string(),
        ];
        assert_eq!(find_minimum_safe_version(&fixed).as_deref(), Some("7.5.0"));
    }

    #[test]
    fn test_find_minimum_safe_version_ignores_gt_prefix() {
        let fixed = vec![">9.0.200".to_string(), "9.0.110".to_string()];
        assert_eq!(
            find_minimum_safe_version(&fixed).as_deref(),
            Some("9.0.110")
        );

        // Only unknown-exact fixes: no floor at all
        let fixed = vec![">9.0.200".to_string()];
        assert_eq!(find_minimum_safe_version(&fixed), None);
    }

    #[test]
    fn test_is_vulnerable() {
        let fixed = vec!["7.4.1".to_string(), "7.5.0".to_string()];
        assert!(is_vulnerable("7.4.2", &fixed));
        assert!(!is_vulnerable("7.5.0", &fixed));
        assert!(!is_vulnerable("7.5.1", &fixed));
        assert!(!is_vulnerable("1.0", &[]));
    }

    #[test]
    fn test_is_valid_version() {
        assert!(is_valid_version("1.2.3"));
        assert!(is_valid_version("10.0.22621.3880"));
        assert!(!is_valid_version("1")); // no dot
        assert!(!is_valid_version("alpha.1")); // no leading digit
        assert!(!is_valid_version("1.0.0-abcdef1234")); // hex run, SHA-like
        assert!(!is_valid_version("123456789012345678901.0")); // too long
    }
}
