//! Release — a versioned deployment unit tracked per organization.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::external::ParsedVersion;
use crate::models::commit::BoundCommit;
use crate::schema::{
    distributions, files, release_environments, release_files, release_project_environments,
    release_projects, releases,
};

/// Maximum stored length of a version string.
pub const DB_VERSION_LENGTH: usize = 250;

/// Characters that may never appear in a version string.
pub const BAD_RELEASE_CHARS: &[char] = &['\r', '\n', '\x0c', '\t', '/', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Open,
    Archived,
}

impl ReleaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Archived => "archived",
        }
    }

    /// Reads the nullable status column. NULL predates the column default
    /// and means open.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            Some("archived") => Self::Archived,
            _ => Self::Open,
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown release status: {0:?}")]
pub struct UnknownReleaseStatus(pub String);

impl FromStr for ReleaseStatus {
    type Err = UnknownReleaseStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownReleaseStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = releases)]
pub struct Release {
    pub id: i64,
    pub organization_id: i64,
    pub version: String,
    pub ref_name: Option<String>,
    pub url: Option<String>,
    pub owner_id: Option<i64>,
    pub status: Option<String>,
    pub date_added: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_released: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
    pub new_groups: i32,
    pub commit_count: Option<i32>,
    pub last_commit_id: Option<i64>,
    pub authors: Option<Vec<String>>,
    pub total_deploys: Option<i32>,
    pub last_deploy_id: Option<i64>,
    pub package: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub patch: Option<i64>,
    pub revision: Option<i64>,
    pub prerelease: Option<String>,
    pub build_code: Option<String>,
    pub build_number: Option<i64>,
}

impl Release {
    pub fn status(&self) -> ReleaseStatus {
        ReleaseStatus::from_column(self.status.as_deref())
    }

    /// Name of the lock serializing commit binding for this release.
    pub fn lock_key(&self) -> String {
        release_lock_key(self.organization_id, self.id)
    }

    pub fn is_semver(&self) -> bool {
        self.major.is_some()
    }

    /// Timestamp used to order releases: released date when known.
    pub fn sort_date(&self) -> DateTime<Utc> {
        self.date_released.unwrap_or(self.date_added)
    }

    pub fn apply_stats(&mut self, stats: &ReleaseStats) {
        self.commit_count = Some(stats.commit_count);
        self.authors = Some(stats.authors.clone());
        self.last_commit_id = stats.last_commit_id;
    }
}

pub fn release_lock_key(organization_id: i64, release_id: i64) -> String {
    format!("releasecommits:{organization_id}:{release_id}")
}

/// Whether `value` may be used as a release version.
pub fn is_valid_version(value: &str) -> bool {
    !(value.is_empty()
        || value.contains(BAD_RELEASE_CHARS)
        || value == "."
        || value == ".."
        || value.eq_ignore_ascii_case("latest"))
}

/// Project-qualified fallback version, `"{slug}-{version}"`, cut to the
/// column length.
pub fn project_version(project_slug: &str, version: &str) -> String {
    format!("{project_slug}-{version}")
        .chars()
        .take(DB_VERSION_LENGTH)
        .collect()
}

/// `build_code` as a sortable number when it is a non-negative 63-bit integer.
pub fn build_number_from_code(build_code: &str) -> Option<i64> {
    build_code.parse::<i64>().ok().filter(|n| *n >= 0)
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = releases)]
pub struct NewRelease {
    pub organization_id: i64,
    pub version: String,
    pub date_added: DateTime<Utc>,
    pub data: serde_json::Value,
    pub total_deploys: Option<i32>,
    pub package: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub patch: Option<i64>,
    pub revision: Option<i64>,
    pub prerelease: Option<String>,
    pub build_code: Option<String>,
    pub build_number: Option<i64>,
}

impl NewRelease {
    pub fn new(organization_id: i64, version: impl Into<String>, date_added: DateTime<Utc>) -> Self {
        Self {
            organization_id,
            version: version.into(),
            date_added,
            data: serde_json::json!({}),
            total_deploys: Some(0),
            package: None,
            major: None,
            minor: None,
            patch: None,
            revision: None,
            prerelease: None,
            build_code: None,
            build_number: None,
        }
    }

    /// Fills the denormalized semver columns from a parsed version.
    pub fn with_version_info(mut self, info: &ParsedVersion) -> Self {
        self.package = info.package.clone();
        self.major = Some(info.major);
        self.minor = Some(info.minor);
        self.patch = Some(info.patch);
        self.revision = Some(info.revision);
        self.prerelease = Some(info.prerelease.clone());
        self.build_number = info.build_code.as_deref().and_then(build_number_from_code);
        self.build_code = info.build_code.clone();
        self
    }
}

/// Materialized commit statistics written at the end of a binding.
#[derive(Debug, Clone, PartialEq, AsChangeset)]
#[diesel(table_name = releases, treat_none_as_null = true)]
pub struct ReleaseStats {
    pub commit_count: i32,
    pub authors: Vec<String>,
    pub last_commit_id: Option<i64>,
}

impl ReleaseStats {
    /// Stats for a binding of `submitted` commits. Authors are distinct and
    /// kept in bound order; the last commit is the most recent one.
    pub fn from_bound(submitted: usize, bound: &[BoundCommit]) -> Self {
        let mut authors: Vec<String> = Vec::new();
        for author_id in bound.iter().filter_map(|c| c.author_id) {
            let author_id = author_id.to_string();
            if !authors.contains(&author_id) {
                authors.push(author_id);
            }
        }
        Self {
            commit_count: i32::try_from(submitted).unwrap_or(i32::MAX),
            authors,
            last_commit_id: bound.first().map(|c| c.commit_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = release_projects)]
pub struct ReleaseProject {
    pub id: i64,
    pub project_id: i64,
    pub release_id: i64,
    pub new_groups: Option<i32>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = release_projects)]
pub struct NewReleaseProject {
    pub project_id: i64,
    pub release_id: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = distributions)]
pub struct Distribution {
    pub id: i64,
    pub organization_id: i64,
    pub release_id: i64,
    pub name: String,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = distributions)]
pub struct NewDistribution<'a> {
    pub organization_id: i64,
    pub release_id: i64,
    pub name: &'a str,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = files)]
pub struct StoredFile {
    pub id: i64,
    pub name: String,
    pub size: Option<i64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = release_files)]
pub struct ReleaseFile {
    pub id: i64,
    pub organization_id: i64,
    pub release_id: i64,
    pub file_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = release_environments)]
pub struct ReleaseEnvironment {
    pub id: i64,
    pub organization_id: i64,
    pub release_id: i64,
    pub environment_id: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = release_project_environments)]
pub struct ReleaseProjectEnvironment {
    pub id: i64,
    pub release_id: i64,
    pub project_id: i64,
    pub environment_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(commit_id: i64, author_id: Option<i64>) -> BoundCommit {
        BoundCommit {
            commit_id,
            key: format!("{commit_id:040x}"),
            repository_id: 1,
            author_id,
        }
    }

    #[test]
    fn version_validation() {
        assert!(is_valid_version("1.0.0"));
        assert!(is_valid_version("backend@2.3.4+build"));
        assert!(!is_valid_version(""));
        assert!(!is_valid_version("."));
        assert!(!is_valid_version(".."));
        assert!(!is_valid_version("Latest"));
        assert!(!is_valid_version("a/b"));
        assert!(!is_valid_version("line\nbreak"));
    }

    #[test]
    fn project_version_is_truncated() {
        assert_eq!(project_version("web", "1.0"), "web-1.0");
        let long = "v".repeat(DB_VERSION_LENGTH);
        assert_eq!(project_version("web", &long).chars().count(), DB_VERSION_LENGTH);
    }

    #[test]
    fn build_number_requires_non_negative_integer() {
        assert_eq!(build_number_from_code("1234"), Some(1234));
        assert_eq!(build_number_from_code("-1"), None);
        assert_eq!(build_number_from_code("abc"), None);
        assert_eq!(build_number_from_code("9223372036854775808"), None);
    }

    #[test]
    fn status_column_defaults_to_open() {
        assert_eq!(ReleaseStatus::from_column(None), ReleaseStatus::Open);
        assert_eq!(ReleaseStatus::from_column(Some("archived")), ReleaseStatus::Archived);
        assert_eq!("archived".parse::<ReleaseStatus>().ok(), Some(ReleaseStatus::Archived));
        assert!("closed".parse::<ReleaseStatus>().is_err());
    }

    #[test]
    fn stats_deduplicate_authors_in_order() {
        let commits = [bound(10, Some(3)), bound(11, None), bound(12, Some(1)), bound(13, Some(3))];
        let stats = ReleaseStats::from_bound(commits.len(), &commits);
        assert_eq!(stats.commit_count, 4);
        assert_eq!(stats.authors, vec!["3".to_string(), "1".to_string()]);
        assert_eq!(stats.last_commit_id, Some(10));
    }

    #[test]
    fn stats_for_empty_binding() {
        let stats = ReleaseStats::from_bound(0, &[]);
        assert_eq!(stats.commit_count, 0);
        assert!(stats.authors.is_empty());
        assert_eq!(stats.last_commit_id, None);
    }

    #[test]
    fn version_info_fills_semver_columns() {
        let info = ParsedVersion {
            package: Some("backend".into()),
            major: 1,
            minor: 2,
            patch: 3,
            revision: 0,
            prerelease: "rc.1".into(),
            build_code: Some("42".into()),
        };
        let release = NewRelease::new(1, "backend@1.2.3-rc.1+42", Utc::now()).with_version_info(&info);
        assert_eq!(release.package.as_deref(), Some("backend"));
        assert_eq!((release.major, release.minor, release.patch), (Some(1), Some(2), Some(3)));
        assert_eq!(release.prerelease.as_deref(), Some("rc.1"));
        assert_eq!(release.build_number, Some(42));
    }
}
