//! Semantic-version validation for agent versions.
//!
//! Version strings follow SemVer 2.0.0 exactly: `MAJOR.MINOR.PATCH` with an
//! optional `-PRERELEASE` and `+BUILD`. No leading `v`, no leading zeros, no
//! empty pre-release segment, exactly three numeric components.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable snapshot of an agent tagged with a semantic version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVersion {
    /// The owning agent.
    pub agent_id: String,
    /// The validated SemVer 2.0.0 version string.
    pub version: String,
    /// Full agent spec snapshot; `None` denotes "no spec change".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<crate::agent::AgentSpec>,
    /// Creation timestamp. Versions are immutable after creation.
    pub created_at: DateTime<Utc>,
}

/// Validates a version string against SemVer 2.0.0 and returns its parsed
/// form. The `semver` crate enforces the full grammar, including the
/// rejection of leading zeros, a leading `v`, four-component versions, and
/// empty pre-release segments.
pub fn validate_version(raw: &str) -> Result<semver::Version, StoreError> {
    semver::Version::parse(raw).map_err(|e| {
        StoreError::Validation(format!("'{raw}' is not a valid SemVer 2.0.0 version: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_semver_forms_used_by_deployments() {
        for v in ["1.0.0", "1.0.0-alpha", "1.0.0+build.123", "1.0.0-rc.1+build.456"] {
            assert!(validate_version(v).is_ok(), "{v} should be accepted");
        }
    }

    #[test]
    fn rejects_malformed_versions() {
        for v in ["1.0", "v1.0.0", "1.0.0.0", "01.0.0", "1.0.0-", ""] {
            assert!(validate_version(v).is_err(), "{v} should be rejected");
        }
    }

    #[test]
    fn accepted_versions_round_trip() {
        for raw in ["1.0.0", "2.13.4-beta.2", "0.1.0+sha.5114f85", "3.0.0-rc.1+build.9"] {
            let parsed = validate_version(raw).unwrap();
            let reparsed = validate_version(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
            assert_eq!(parsed.to_string(), raw);
        }
    }
}
