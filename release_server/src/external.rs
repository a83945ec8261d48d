//! Collaborators owned by other systems: version parsing, the health-data
//! query, the user directory and the commit ignore predicate.

use async_trait::async_trait;

use crate::models::commit::CommitAuthor;

pub type UserId = i64;

/// Structured form of a semver-style release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    pub package: Option<String>,
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
    pub revision: i64,
    pub prerelease: String,
    pub build_code: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("version {version:?} is not semver: {reason}")]
pub struct UnparseableVersion {
    pub version: String,
    pub reason: String,
}

pub trait VersionParser: Send + Sync {
    fn parse(&self, version: &str) -> Result<ParsedVersion, UnparseableVersion>;
}

/// Parses `[package@]major.minor.patch[-pre][+build]` with the `semver` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SemverParser;

impl VersionParser for SemverParser {
    fn parse(&self, version: &str) -> Result<ParsedVersion, UnparseableVersion> {
        let unparseable = |reason: String| UnparseableVersion {
            version: version.to_string(),
            reason,
        };
        let (package, raw) = match version.rsplit_once('@') {
            Some((package, raw)) if !package.is_empty() => (Some(package.to_string()), raw),
            _ => (None, version),
        };
        let parsed = semver::Version::parse(raw).map_err(|e| unparseable(e.to_string()))?;
        let component = |n: u64| i64::try_from(n).map_err(|e| unparseable(e.to_string()));
        let build = parsed.build.as_str();
        Ok(ParsedVersion {
            package,
            major: component(parsed.major)?,
            minor: component(parsed.minor)?,
            patch: component(parsed.patch)?,
            revision: 0,
            prerelease: parsed.pre.as_str().to_string(),
            build_code: (!build.is_empty()).then(|| build.to_string()),
        })
    }
}

/// Read-only query against the analytical store: does any of these
/// (project_id, version) pairs have session health data?
#[async_trait]
pub trait HealthDataCheck: Send + Sync {
    async fn has_health_data(&self, pairs: &[(i64, String)]) -> anyhow::Result<bool>;
}

/// For deployments without an analytical store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHealthData;

#[async_trait]
impl HealthDataCheck for NoHealthData {
    async fn has_health_data(&self, _pairs: &[(i64, String)]) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Maps commit authors to platform users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_users(&self, author: &CommitAuthor) -> anyhow::Result<Vec<UserId>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserDirectory;

#[async_trait]
impl UserDirectory for NoUserDirectory {
    async fn find_users(&self, _author: &CommitAuthor) -> anyhow::Result<Vec<UserId>> {
        Ok(Vec::new())
    }
}

pub trait CommitFilter: Send + Sync {
    fn should_ignore(&self, message: Option<&str>) -> bool;
}

pub const DEFAULT_IGNORE_MARKER: &str = "#skiprelease";

/// Skips commits whose message contains a marker string.
#[derive(Debug, Clone)]
pub struct IgnoreMarkerFilter {
    marker: String,
}

impl IgnoreMarkerFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self { marker: marker.into() }
    }
}

impl Default for IgnoreMarkerFilter {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_MARKER)
    }
}

impl CommitFilter for IgnoreMarkerFilter {
    fn should_ignore(&self, message: Option<&str>) -> bool {
        !self.marker.is_empty() && message.is_some_and(|m| m.contains(&self.marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_package_and_build() {
        let parsed = SemverParser.parse("backend@1.2.3-rc.1+20240101").unwrap();
        assert_eq!(parsed.package.as_deref(), Some("backend"));
        assert_eq!((parsed.major, parsed.minor, parsed.patch, parsed.revision), (1, 2, 3, 0));
        assert_eq!(parsed.prerelease, "rc.1");
        assert_eq!(parsed.build_code.as_deref(), Some("20240101"));
    }

    #[test]
    fn plain_version_has_no_package() {
        let parsed = SemverParser.parse("2.0.0").unwrap();
        assert_eq!(parsed.package, None);
        assert_eq!(parsed.prerelease, "");
        assert_eq!(parsed.build_code, None);
    }

    #[test]
    fn rejects_non_semver() {
        assert!(SemverParser.parse("abc123").is_err());
        assert!(SemverParser.parse("pkg@latest").is_err());
    }

    #[test]
    fn ignore_marker() {
        let filter = IgnoreMarkerFilter::default();
        assert!(filter.should_ignore(Some("wip #skiprelease")));
        assert!(!filter.should_ignore(Some("fix crash")));
        assert!(!filter.should_ignore(None));
        assert!(!IgnoreMarkerFilter::new("").should_ignore(Some("anything")));
    }

    #[tokio::test]
    async fn null_collaborators() {
        assert!(!NoHealthData.has_health_data(&[(1, "1.0".into())]).await.unwrap());
        let author = CommitAuthor { id: 1, organization_id: 1, name: None, email: "a@b".into() };
        assert!(NoUserDirectory.find_users(&author).await.unwrap().is_empty());
    }
}
