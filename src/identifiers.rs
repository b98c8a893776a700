//! Routing numbers and version strings.
//!
//! Routing numbers have the form `RTG-{SITE}-{PART}-{SEQ}` where `SEQ` is the
//! next unused integer for the (site, part) pair, zero padded. Storage
//! backends call [`RoutingNumberFormat::next_number`] inside the same
//! transaction that inserts the routing, so the uniqueness check and the
//! insert cannot interleave with another creator. Site codes never contain
//! `-` (see [`validate_site_code`]), so a number names exactly one pair.
//!
//! Versions are dotted numeric strings with at least a major and minor
//! component. [`increment_version`] bumps the minor component.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::{RoutingError, RoutingResult};
use crate::types::{PartId, SiteId};

/// Version assigned to a routing created without one.
pub const INITIAL_VERSION: &str = "1.0";

fn version_regex() -> &'static Regex {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    VERSION.get_or_init(|| {
        Regex::new(r"^[0-9]+(\.[0-9]+)+$").expect("version pattern is valid")
    })
}

/// Parse a dotted numeric version into its components.
pub fn parse_version(version: &str) -> RoutingResult<Vec<u64>> {
    let format_error = || RoutingError::VersionFormat {
        version: version.to_string(),
    };
    if !version_regex().is_match(version) {
        return Err(format_error());
    }
    version
        .split('.')
        .map(|part| part.parse::<u64>().map_err(|_| format_error()))
        .collect()
}

/// Increment the minor component: "1.0" -> "1.1", "2.9.4" -> "2.10.4".
pub fn increment_version(current: &str) -> RoutingResult<String> {
    let mut parts = parse_version(current)?;
    parts[1] = parts[1].checked_add(1).ok_or_else(|| RoutingError::VersionFormat {
        version: current.to_string(),
    })?;
    Ok(parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

/// Numeric comparison of two versions ("1.10" > "1.9").
///
/// Malformed versions sort before well-formed ones and compare lexically
/// among themselves, so listing never fails on legacy data.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Ok(pa), Ok(pb)) => {
            let len = pa.len().max(pb.len());
            for i in 0..len {
                let x = pa.get(i).copied().unwrap_or(0);
                let y = pb.get(i).copied().unwrap_or(0);
                match x.cmp(&y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            Ordering::Equal
        }
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Highest version among `versions`, by [`compare_versions`].
pub fn max_version<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    versions.into_iter().max_by(|a, b| compare_versions(a, b))
}

/// Reject site codes that would make routing numbers ambiguous.
///
/// With `-` excluded from the site, the site ends at the first separator and
/// the sequence is the trailing digit run, so parts may still contain `-`.
pub fn validate_site_code(site: &SiteId) -> RoutingResult<()> {
    let code = site.as_str();
    if code.is_empty() || code.contains('-') {
        return Err(RoutingError::InvalidSiteCode { site: site.clone() });
    }
    Ok(())
}

/// Routing-number layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingNumberFormat {
    /// Leading token, `RTG` by default.
    pub prefix: String,
    /// Zero padding of the sequence.
    pub sequence_width: usize,
}

impl Default for RoutingNumberFormat {
    fn default() -> Self {
        Self {
            prefix: "RTG".to_string(),
            sequence_width: 3,
        }
    }
}

impl RoutingNumberFormat {
    /// Prefix shared by every number of a (site, part) pair, e.g. `RTG-DAL-PN001-`.
    pub fn pair_prefix(&self, site: &SiteId, part: &PartId) -> String {
        format!("{}-{}-{}-", self.prefix, site, part)
    }

    /// Render a routing number.
    pub fn format(&self, site: &SiteId, part: &PartId, sequence: u32) -> String {
        format!(
            "{}{:0width$}",
            self.pair_prefix(site, part),
            sequence,
            width = self.sequence_width
        )
    }

    /// Sequence of `number` if it belongs to the (site, part) pair.
    pub fn sequence_of(&self, number: &str, site: &SiteId, part: &PartId) -> Option<u32> {
        let rest = number.strip_prefix(&self.pair_prefix(site, part))?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    /// Next unused routing number for (site, part) given all numbers already taken.
    pub fn next_number<'a, I>(&self, site: &SiteId, part: &PartId, existing: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let next = existing
            .into_iter()
            .filter_map(|n| self.sequence_of(n, site, part))
            .max()
            .map(|max| max.saturating_add(1))
            .unwrap_or(1);
        self.format(site, part, next)
    }
}

/// Next routing number in the default `RTG-{SITE}-{PART}-{SEQ:03}` layout.
pub fn generate_routing_number<'a, I>(site: &SiteId, part: &PartId, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    RoutingNumberFormat::default().next_number(site, part, existing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_minor() {
        assert_eq!(increment_version("1.0").unwrap(), "1.1");
        assert_eq!(increment_version("1.9").unwrap(), "1.10");
        assert_eq!(increment_version("2.3.7").unwrap(), "2.4.7");
    }

    #[test]
    fn test_malformed_versions_rejected() {
        for bad in ["", "1", "1.", ".1", "1.a", "v1.0", "1..0", "1.0 "] {
            assert!(
                matches!(increment_version(bad), Err(RoutingError::VersionFormat { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_numeric_version_ordering() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("garbage", "0.1"), Ordering::Less);
        assert_eq!(max_version(["1.2", "1.10", "1.9"]), Some("1.10"));
    }

    #[test]
    fn test_first_routing_number() {
        let n = generate_routing_number(&SiteId::from("DAL"), &PartId::from("PN001"), []);
        assert_eq!(n, "RTG-DAL-PN001-001");
    }

    #[test]
    fn test_next_number_skips_other_pairs() {
        let site = SiteId::from("DAL");
        let part = PartId::from("PN001");
        let existing = [
            "RTG-DAL-PN001-001",
            "RTG-DAL-PN001-007",
            "RTG-DAL-PN0012-050",
            "RTG-HOU-PN001-099",
        ];
        let n = generate_routing_number(&site, &part, existing.iter().copied());
        assert_eq!(n, "RTG-DAL-PN001-008");
    }

    #[test]
    fn test_site_codes_with_separator_rejected() {
        assert!(validate_site_code(&SiteId::from("DAL")).is_ok());
        for bad in ["", "DAL-A", "-", "DAL-"] {
            assert_eq!(
                validate_site_code(&SiteId::from(bad)),
                Err(RoutingError::InvalidSiteCode { site: SiteId::from(bad) }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_dashed_parts_keep_separate_sequences() {
        let site = SiteId::from("DAL");
        let existing = ["RTG-DAL-A-1-004", "RTG-DAL-A-002"];
        let dashed = generate_routing_number(&site, &PartId::from("A-1"), existing.iter().copied());
        let plain = generate_routing_number(&site, &PartId::from("A"), existing.iter().copied());
        assert_eq!(dashed, "RTG-DAL-A-1-005");
        assert_eq!(plain, "RTG-DAL-A-003");
    }

    #[test]
    fn test_custom_format() {
        let format = RoutingNumberFormat {
            prefix: "RT".to_string(),
            sequence_width: 5,
        };
        let n = format.format(&SiteId::from("S1"), &PartId::from("P"), 42);
        assert_eq!(n, "RT-S1-P-00042");
        assert_eq!(format.sequence_of(&n, &SiteId::from("S1"), &PartId::from("P")), Some(42));
    }
}
