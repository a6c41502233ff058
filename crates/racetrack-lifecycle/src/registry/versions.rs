//! Version alias resolution.
//!
//! A job version may be requested exactly, as `latest` (highest stable
//! version) or as an `x` wildcard such as `1.x` or `1.2.x` (highest stable
//! version matching the pattern). Stable means a semantic version with no
//! pre-release or build label; anything else never wins an alias.

use semver::Version;

/// Alias for the highest stable version of a family.
pub const LATEST: &str = "latest";

/// How a requested version string selects a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector<'a> {
    /// This exact version.
    Exact(&'a str),
    /// Highest stable version.
    Latest,
    /// Highest stable version matching an `x` wildcard pattern.
    Wildcard(&'a str),
}

impl<'a> VersionSelector<'a> {
    /// Classify a requested version string.
    #[must_use]
    pub fn parse(requested: &'a str) -> Self {
        if requested == LATEST {
            Self::Latest
        } else if is_x_pattern(requested) {
            Self::Wildcard(requested)
        } else {
            Self::Exact(requested)
        }
    }

    /// Pick the best matching version among `versions`.
    pub fn select<'v>(&self, versions: impl IntoIterator<Item = &'v str>) -> Option<&'v str> {
        match self {
            Self::Exact(wanted) => versions.into_iter().find(|v| v == wanted),
            Self::Latest => highest_stable(versions.into_iter()),
            Self::Wildcard(pattern) => {
                highest_stable(versions.into_iter().filter(|v| wildcard_matches(pattern, v)))
            }
        }
    }
}

/// Whether `pattern` is made of dot-separated numbers and `x`, with at least one `x`.
#[must_use]
pub fn is_x_pattern(pattern: &str) -> bool {
    pattern.contains('x')
        && pattern
            .split('.')
            .all(|part| part == "x" || (!part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())))
}

fn highest_stable<'v>(versions: impl Iterator<Item = &'v str>) -> Option<&'v str> {
    versions
        .filter_map(|v| Version::parse(v).ok().map(|parsed| (parsed, v)))
        .filter(|(parsed, _)| parsed.pre.is_empty() && parsed.build.is_empty())
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, v)| v)
}

// Each `x` stands for one or more characters; everything else is literal.
fn wildcard_matches(pattern: &str, version: &str) -> bool {
    match pattern.split_once('x') {
        None => pattern == version,
        Some((literal, rest)) => {
            let Some(remaining) = version.strip_prefix(literal) else {
                return false;
            };
            (1..=remaining.len())
                .filter(|&n| remaining.is_char_boundary(n))
                .any(|n| wildcard_matches(rest, &remaining[n..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSIONS: [&str; 6] = ["0.9.0", "1.0.0", "1.2.0", "1.10.1", "2.0.0-dev", "legacy"];

    #[test]
    fn latest_skips_pre_releases_and_non_semver() {
        assert_eq!(VersionSelector::parse("latest").select(VERSIONS), Some("1.10.1"));
        assert_eq!(VersionSelector::parse("latest").select(["2.0.0-dev", "legacy"]), None);
    }

    #[test]
    fn wildcards_pick_highest_match() {
        assert_eq!(VersionSelector::parse("1.x").select(VERSIONS), Some("1.10.1"));
        assert_eq!(VersionSelector::parse("1.2.x").select(VERSIONS), Some("1.2.0"));
        assert_eq!(VersionSelector::parse("0.x.x").select(VERSIONS), Some("0.9.0"));
        assert_eq!(VersionSelector::parse("3.x").select(VERSIONS), None);
    }

    #[test]
    fn exact_versions_are_taken_literally() {
        assert_eq!(VersionSelector::parse("legacy"), VersionSelector::Exact("legacy"));
        assert_eq!(VersionSelector::parse("legacy").select(VERSIONS), Some("legacy"));
        assert!(!is_x_pattern("1.x-dev"));
        assert!(!is_x_pattern("1.2.3"));
        assert!(is_x_pattern("x"));
    }
}
