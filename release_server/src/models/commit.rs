//! Commits, their authors and repositories, and the rows binding them to releases.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::release::Release;
use crate::schema::{
    commit_authors, commit_file_changes, commits, pull_requests, release_commits,
    release_head_commits, repositories,
};

/// Maximum stored length of an author email.
pub const AUTHOR_EMAIL_LENGTH: usize = 75;

/// Maximum stored length of an author name.
pub const AUTHOR_NAME_LENGTH: usize = 128;

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

/// Repository used for commits submitted without a repository name.
pub fn default_repository_name(organization_id: i64) -> String {
    format!("organization-{organization_id}")
}

/// Email identifying a commit author.
///
/// An explicit email is used as given. When absent, one is synthesized from
/// the name: non-alphanumerics stripped, lower-cased, `@localhost` appended.
/// Either way the result is cut to the column length; an empty result means
/// the commit has no author.
pub fn author_email_for(email: Option<&str>, name: Option<&str>) -> Option<String> {
    let email = match email {
        Some(email) => email.to_string(),
        None => {
            let local = NON_ALPHANUMERIC.replace_all(name?, "").to_lowercase();
            if local.is_empty() {
                return None;
            }
            format!("{local}@localhost")
        }
    };
    let email: String = email.chars().take(AUTHOR_EMAIL_LENGTH).collect();
    (!email.is_empty()).then_some(email)
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = repositories)]
pub struct Repository {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = repositories)]
pub struct NewRepository<'a> {
    pub organization_id: i64,
    pub name: &'a str,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = commit_authors)]
pub struct CommitAuthor {
    pub id: i64,
    pub organization_id: i64,
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commit_authors)]
pub struct NewCommitAuthor<'a> {
    pub organization_id: i64,
    pub name: Option<&'a str>,
    pub email: &'a str,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = commits)]
pub struct Commit {
    pub id: i64,
    pub organization_id: i64,
    pub repository_id: i64,
    pub key: String,
    pub date_added: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commits)]
pub struct NewCommit<'a> {
    pub organization_id: i64,
    pub repository_id: i64,
    pub key: &'a str,
    pub date_added: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub message: Option<&'a str>,
}

/// Partial commit update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, AsChangeset)]
#[diesel(table_name = commits)]
pub struct CommitChanges {
    pub author_id: Option<i64>,
    pub message: Option<String>,
    pub date_added: Option<DateTime<Utc>>,
}

impl CommitChanges {
    /// Keeps only the fields that differ from the stored commit.
    pub fn against(self, existing: &Commit) -> Self {
        Self {
            author_id: self.author_id.filter(|id| existing.author_id != Some(*id)),
            message: self.message.filter(|m| existing.message.as_deref() != Some(m.as_str())),
            date_added: self.date_added.filter(|d| *d != existing.date_added),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.author_id.is_none() && self.message.is_none() && self.date_added.is_none()
    }

    pub fn apply(&self, commit: &mut Commit) {
        if let Some(author_id) = self.author_id {
            commit.author_id = Some(author_id);
        }
        if let Some(message) = &self.message {
            commit.message = Some(message.clone());
        }
        if let Some(date_added) = self.date_added {
            commit.date_added = date_added;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = commit_file_changes)]
pub struct CommitFileChange {
    pub id: i64,
    pub organization_id: i64,
    pub commit_id: i64,
    pub filename: String,
    pub change_type: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commit_file_changes)]
pub struct NewCommitFileChange<'a> {
    pub organization_id: i64,
    pub commit_id: i64,
    pub filename: &'a str,
    pub change_type: &'a str,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = release_commits)]
pub struct ReleaseCommit {
    pub id: i64,
    pub organization_id: i64,
    pub release_id: i64,
    pub commit_id: i64,
    pub order_index: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = release_commits)]
pub struct NewReleaseCommit {
    pub organization_id: i64,
    pub release_id: i64,
    pub commit_id: i64,
    pub order_index: i32,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = release_head_commits)]
pub struct ReleaseHeadCommit {
    pub id: i64,
    pub organization_id: i64,
    pub repository_id: i64,
    pub release_id: i64,
    pub commit_id: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = release_head_commits)]
pub struct NewReleaseHeadCommit {
    pub organization_id: i64,
    pub repository_id: i64,
    pub release_id: i64,
    pub commit_id: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = pull_requests)]
pub struct PullRequest {
    pub id: i64,
    pub organization_id: i64,
    pub repository_id: i64,
    pub key: String,
    pub title: Option<String>,
    pub author_id: Option<i64>,
    pub merge_commit_sha: Option<String>,
    pub date_added: DateTime<Utc>,
}

/// One entry of a submitted patch set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub change_type: Option<String>,
}

/// A validated file change ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub filename: String,
    pub change_type: String,
}

impl PatchEntry {
    /// `None` when the entry lacks a path or carries an unknown change type.
    pub fn to_file_change(&self) -> Option<FileChange> {
        let filename = self.path.as_deref().filter(|p| !p.is_empty())?;
        let change_type = self.change_type.as_deref()?;
        matches!(change_type, "A" | "M" | "D").then(|| FileChange {
            filename: filename.to_string(),
            change_type: change_type.to_string(),
        })
    }
}

/// A commit as submitted for binding to a release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitSubmission {
    pub id: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default, deserialize_with = "lenient_patch_set")]
    pub patch_set: Vec<PatchEntry>,
}

/// Reads a patch set, treating `null` as empty and dropping entries that are
/// not well-formed so one bad entry never rejects the whole commit list.
fn lenient_patch_set<'de, D>(deserializer: D) -> Result<Vec<PatchEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(serde_json::Value::Array(entries)) = Option::<serde_json::Value>::deserialize(deserializer)?
    else {
        return Ok(Vec::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<PatchEntry>(entry) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed patch entry");
                None
            }
        })
        .collect())
}

impl CommitSubmission {
    /// Sort key; a missing timestamp sorts as the epoch.
    pub fn sort_timestamp(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// Orders submissions newest first. Ties keep submission order.
pub fn sort_newest_first(commits: &mut [CommitSubmission]) {
    commits.sort_by_key(|c| std::cmp::Reverse(c.sort_timestamp()));
}

/// A repository head reference, as passed to `set_refs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRef {
    pub repository: String,
    pub commit: String,
    #[serde(default)]
    pub previous_commit: Option<String>,
}

impl CommitRef {
    /// Splits a `previous..current` range into its two ends.
    pub fn expand_range(mut self) -> Self {
        if let Some((previous, current)) = self.commit.split_once("..") {
            let (previous, current) = (previous.to_string(), current.to_string());
            self.previous_commit = Some(previous);
            self.commit = current;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAuthor {
    pub email: String,
    pub name: Option<String>,
}

/// A submission normalized into the rows it will produce.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommit {
    pub key: String,
    pub repository: String,
    pub author: Option<PlannedAuthor>,
    pub message: Option<String>,
    pub date_added: Option<DateTime<Utc>>,
    pub file_changes: Vec<FileChange>,
}

impl PlannedCommit {
    pub fn from_submission(organization_id: i64, submission: CommitSubmission) -> Self {
        let name = submission
            .author_name
            .as_deref()
            .map(|n| n.chars().take(AUTHOR_NAME_LENGTH).collect::<String>());
        let author = author_email_for(submission.author_email.as_deref(), name.as_deref())
            .map(|email| PlannedAuthor { email, name });
        let file_changes = submission
            .patch_set
            .iter()
            .filter_map(PatchEntry::to_file_change)
            .collect();
        Self {
            key: submission.id,
            repository: submission
                .repository
                .unwrap_or_else(|| default_repository_name(organization_id)),
            author,
            message: submission.message,
            date_added: submission.timestamp,
            file_changes,
        }
    }

    /// Changes to apply to an existing commit: only provided fields.
    pub fn changes(&self, author_id: Option<i64>) -> CommitChanges {
        CommitChanges {
            author_id,
            message: self.message.clone(),
            date_added: self.date_added,
        }
    }
}

/// A commit bound to a release, in binding order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundCommit {
    pub commit_id: i64,
    pub key: String,
    pub repository_id: i64,
    pub author_id: Option<i64>,
}

/// Result of binding a commit list to a release.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingOutcome {
    /// The release with its refreshed commit statistics.
    pub release: Release,
    pub bound: Vec<BoundCommit>,
    /// First commit seen per repository, in first-seen order.
    pub head_commits: Vec<(i64, i64)>,
}

impl BindingOutcome {
    pub fn author_for(&self, commit_id: i64) -> Option<i64> {
        self.bound
            .iter()
            .find(|c| c.commit_id == commit_id)
            .and_then(|c| c.author_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn submission(id: &str, ts: Option<i64>) -> CommitSubmission {
        CommitSubmission {
            id: id.to_string(),
            timestamp: ts.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            ..Default::default()
        }
    }

    #[test]
    fn synthesizes_email_from_name() {
        assert_eq!(author_email_for(None, Some("A. Test!")).as_deref(), Some("atest@localhost"));
        assert_eq!(author_email_for(Some("x@y.com"), Some("ignored")).as_deref(), Some("x@y.com"));
        assert_eq!(author_email_for(None, Some("!!!")), None);
        assert_eq!(author_email_for(None, None), None);
        assert_eq!(author_email_for(Some(""), Some("Jane")), None);
    }

    #[test]
    fn email_is_capped() {
        let long = format!("{}@example.com", "a".repeat(100));
        let email = author_email_for(Some(&long), None).unwrap_or_default();
        assert_eq!(email.chars().count(), AUTHOR_EMAIL_LENGTH);
    }

    #[test]
    fn patch_entries_need_path_and_known_type() {
        let ok = PatchEntry { path: Some("src/lib.rs".into()), change_type: Some("M".into()) };
        assert_eq!(
            ok.to_file_change(),
            Some(FileChange { filename: "src/lib.rs".into(), change_type: "M".into() })
        );
        assert_eq!(PatchEntry { path: None, change_type: Some("A".into()) }.to_file_change(), None);
        assert_eq!(PatchEntry { path: Some("a".into()), change_type: None }.to_file_change(), None);
        assert_eq!(
            PatchEntry { path: Some("a".into()), change_type: Some("X".into()) }.to_file_change(),
            None
        );
    }

    #[test]
    fn newest_first_is_stable() {
        let mut commits = vec![
            submission("a", Some(10)),
            submission("b", None),
            submission("c", Some(30)),
            submission("d", Some(10)),
        ];
        sort_newest_first(&mut commits);
        let keys: Vec<_> = commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(keys, ["c", "a", "d", "b"]);
    }

    #[test]
    fn sub_second_timestamps_are_ordered() {
        let at = |ms: i64| CommitSubmission {
            timestamp: Utc.timestamp_millis_opt(ms).single(),
            ..submission("", None)
        };
        let mut commits = vec![
            CommitSubmission { id: "old".into(), ..at(1_000_100) },
            CommitSubmission { id: "new".into(), ..at(1_000_900) },
        ];
        sort_newest_first(&mut commits);
        let keys: Vec<_> = commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(keys, ["new", "old"]);
    }

    #[test]
    fn null_patch_set_reads_as_empty() -> serde_json::Result<()> {
        let commit: CommitSubmission = serde_json::from_str(r#"{"id":"a","patch_set":null}"#)?;
        assert!(commit.patch_set.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_patch_entries_are_dropped_per_entry() -> serde_json::Result<()> {
        let commits: Vec<CommitSubmission> = serde_json::from_str(
            r#"[
                {"id": "a", "patch_set": [{"path": "ok.rs", "type": "M"}, {"path": 7, "type": "M"}, "junk"]},
                {"id": "b", "patch_set": "not a list"}
            ]"#,
        )?;
        assert_eq!(commits.len(), 2);
        assert_eq!(
            commits[0].patch_set,
            [PatchEntry { path: Some("ok.rs".into()), change_type: Some("M".into()) }]
        );
        assert!(commits[1].patch_set.is_empty());
        Ok(())
    }

    #[test]
    fn commit_ref_range_is_split() {
        let r = CommitRef { repository: "r".into(), commit: "aaa..bbb".into(), previous_commit: None }
            .expand_range();
        assert_eq!(r.commit, "bbb");
        assert_eq!(r.previous_commit.as_deref(), Some("aaa"));

        let r = CommitRef { repository: "r".into(), commit: "ccc".into(), previous_commit: None }
            .expand_range();
        assert_eq!(r.commit, "ccc");
        assert_eq!(r.previous_commit, None);
    }

    #[test]
    fn changes_keep_only_differences() {
        let existing = Commit {
            id: 1,
            organization_id: 1,
            repository_id: 1,
            key: "abc".into(),
            date_added: Utc.timestamp_opt(100, 0).unwrap(),
            author_id: Some(5),
            message: Some("fix".into()),
        };
        let changes = CommitChanges {
            author_id: Some(5),
            message: Some("fix things".into()),
            date_added: Some(Utc.timestamp_opt(100, 0).unwrap()),
        }
        .against(&existing);
        assert_eq!(changes.author_id, None);
        assert_eq!(changes.message.as_deref(), Some("fix things"));
        assert_eq!(changes.date_added, None);
        assert!(!changes.is_empty());
        assert!(CommitChanges::default().against(&existing).is_empty());
    }

    #[test]
    fn planned_commit_defaults_repository() {
        let planned = PlannedCommit::from_submission(
            7,
            CommitSubmission {
                id: "abc".into(),
                author_name: Some("Jane Doe".into()),
                patch_set: vec![
                    PatchEntry { path: Some("a.rs".into()), change_type: Some("A".into()) },
                    PatchEntry { path: None, change_type: Some("M".into()) },
                ],
                ..Default::default()
            },
        );
        assert_eq!(planned.repository, "organization-7");
        assert_eq!(planned.author.map(|a| a.email).as_deref(), Some("janedoe@localhost"));
        assert_eq!(planned.file_changes.len(), 1);
    }
}
