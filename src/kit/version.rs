//! Strict `X.Y.Z` kit version validation (§3, §8 boundary behavior).
//!
//! The core only accepts bare `major.minor.patch` — no `v` prefix, no
//! pre-release or build metadata suffix. `semver::Version` alone is too
//! permissive (it happily parses `"1.0.0-beta"`), so the shape is checked
//! with a regex first and `semver` is used only for ordering once a string
//! has passed that gate.

use crate::error::{CoreError, Result};
use regex::Regex;
use semver::Version;
use std::sync::OnceLock;

static STRICT_SEMVER: OnceLock<Regex> = OnceLock::new();

fn strict_semver_re() -> &'static Regex {
    STRICT_SEMVER.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid regex"))
}

/// Validates strict `X.Y.Z` shape; returns `InvalidVersion` otherwise.
pub fn validate(raw: &str) -> Result<()> {
    if !strict_semver_re().is_match(raw) {
        return Err(CoreError::InvalidVersion(format!(
            "{raw:?} is not a strict X.Y.Z version"
        )));
    }
    Version::parse(raw).map_err(|e| CoreError::InvalidVersion(format!("{raw:?}: {e}")))?;
    Ok(())
}

/// Parses a validated version string into its numeric tuple for sorting
/// (§4.A "version listing sorts lexically by numeric tuple").
pub fn as_tuple(raw: &str) -> Result<(u64, u64, u64)> {
    validate(raw)?;
    let v = Version::parse(raw).map_err(|e| CoreError::InvalidVersion(e.to_string()))?;
    Ok((v.major, v.minor, v.patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strict_versions() {
        assert!(validate("1.0.0").is_ok());
        assert!(validate("10.20.30").is_ok());
    }

    #[test]
    fn rejects_non_strict_versions() {
        assert!(validate("1.0").is_err());
        assert!(validate("1.0.0-beta").is_err());
        assert!(validate("v1.0.0").is_err());
    }

    #[test]
    fn sorts_by_numeric_tuple_not_lexically() {
        let mut versions = vec!["2.0.0", "10.0.0", "1.0.0"];
        versions.sort_by_key(|v| as_tuple(v).unwrap());
        assert_eq!(versions, vec!["1.0.0", "2.0.0", "10.0.0"]);
    }
}
