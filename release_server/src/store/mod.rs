//! Transactional persistence for releases, commits and issue state.
//!
//! `ReleaseStore` is the seam between the services and storage. Every
//! "ignore conflict" primitive is an atomic insert-or-ignore; callers never
//! check-then-insert.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::models::commit::{
    BindingOutcome, BoundCommit, Commit, CommitAuthor, PlannedCommit, PullRequest, Repository,
};
use crate::models::group::{Group, GroupLink};
use crate::models::project::Project;
use crate::models::release::{Distribution, NewRelease, Release};

pub use memory::InMemoryReleaseStore;
pub use pg::PgReleaseStore;

/// How a merge moves rows of one referencing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReparentStrategy {
    /// One bulk update; on a uniqueness conflict fall back to row by row,
    /// deleting rows that still conflict.
    BulkThenRowwise,
    /// One bulk update; conflicts cannot occur.
    Bulk,
}

/// A table column holding a release id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReleaseReference {
    ReleaseCommits,
    ReleaseEnvironments,
    ReleaseFiles,
    ReleaseProjects,
    ReleaseProjectEnvironments,
    GroupReleases,
    GroupResolutions,
    GroupFirstRelease,
}

impl ReleaseReference {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::ReleaseCommits => "release_commits",
            Self::ReleaseEnvironments => "release_environments",
            Self::ReleaseFiles => "release_files",
            Self::ReleaseProjects => "release_projects",
            Self::ReleaseProjectEnvironments => "release_project_environments",
            Self::GroupReleases => "group_releases",
            Self::GroupResolutions => "group_resolutions",
            Self::GroupFirstRelease => "issue_groups",
        }
    }

    pub fn column_name(self) -> &'static str {
        match self {
            Self::GroupFirstRelease => "first_release_id",
            _ => "release_id",
        }
    }

    pub fn strategy(self) -> ReparentStrategy {
        match self {
            Self::GroupFirstRelease => ReparentStrategy::Bulk,
            _ => ReparentStrategy::BulkThenRowwise,
        }
    }
}

/// Tables reparented row-set by row-set when releases are merged.
/// `GroupFirstRelease` is handled after these.
pub const RELEASE_REFERENCES: &[ReleaseReference] = &[
    ReleaseReference::ReleaseCommits,
    ReleaseReference::ReleaseEnvironments,
    ReleaseReference::ReleaseFiles,
    ReleaseReference::ReleaseProjects,
    ReleaseReference::ReleaseProjectEnvironments,
    ReleaseReference::GroupReleases,
    ReleaseReference::GroupResolutions,
];

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    // --- releases ---

    async fn get_release(&self, release_id: i64) -> StoreResult<Release>;

    async fn get_project(&self, project_id: i64) -> StoreResult<Project>;

    async fn find_release(&self, organization_id: i64, version: &str)
        -> StoreResult<Option<Release>>;

    /// Releases of the organization associated with `project_id` whose
    /// version is one of `versions`.
    async fn find_project_releases(
        &self,
        organization_id: i64,
        project_id: i64,
        versions: &[String],
    ) -> StoreResult<Vec<Release>>;

    /// Fails with `StoreError::Conflict` when (organization, version) exists.
    async fn create_release(&self, release: NewRelease) -> StoreResult<Release>;

    /// Associates the release with the project and flags the project as
    /// having releases, in one transaction. `false` when already associated.
    async fn add_release_project(&self, release_id: i64, project_id: i64) -> StoreResult<bool>;

    async fn release_project_ids(&self, release_id: i64) -> StoreResult<Vec<i64>>;

    /// Most recent other release sharing a project with `release`, by
    /// released date falling back to the added date.
    async fn previous_release(&self, release: &Release) -> StoreResult<Option<Release>>;

    // --- merge ---

    /// Moves every row from `from` to `to` in one transaction. All or nothing.
    async fn reparent_all(
        &self,
        reference: ReleaseReference,
        from: i64,
        to: i64,
    ) -> StoreResult<u64>;

    async fn referencing_row_ids(
        &self,
        reference: ReleaseReference,
        release_id: i64,
    ) -> StoreResult<Vec<i64>>;

    async fn reparent_row(&self, reference: ReleaseReference, row_id: i64, to: i64)
        -> StoreResult<()>;

    async fn delete_row(&self, reference: ReleaseReference, row_id: i64) -> StoreResult<()>;

    async fn delete_release(&self, release_id: i64) -> StoreResult<()>;

    // --- deletion ---

    async fn is_first_release_of_any_group(&self, release_id: i64) -> StoreResult<bool>;

    /// Deletes the release's stored files, release files and the release
    /// itself in one transaction.
    async fn delete_release_and_files(&self, release_id: i64) -> StoreResult<()>;

    // --- distributions ---

    async fn get_or_create_distribution(
        &self,
        release: &Release,
        name: &str,
        date_added: DateTime<Utc>,
    ) -> StoreResult<Distribution>;

    async fn find_distribution(&self, release_id: i64, name: &str)
        -> StoreResult<Option<Distribution>>;

    // --- commits ---

    /// Replaces the release's commit bindings with `commits`, in order, and
    /// refreshes its commit statistics. One transaction.
    async fn bind_commits(
        &self,
        release: &Release,
        commits: &[PlannedCommit],
    ) -> StoreResult<BindingOutcome>;

    /// Insert-or-ignore. `false` when the release already has a head commit
    /// for the repository.
    async fn create_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<bool>;

    /// Create-or-update of the release's head commit for the repository.
    async fn set_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<()>;

    async fn find_repositories(
        &self,
        organization_id: i64,
        names: &[String],
    ) -> StoreResult<Vec<Repository>>;

    async fn get_or_create_commit(
        &self,
        organization_id: i64,
        repository_id: i64,
        key: &str,
    ) -> StoreResult<Commit>;

    /// Bound commits in binding order, with their stored authors.
    async fn release_commits(&self, release_id: i64) -> StoreResult<Vec<BoundCommit>>;

    // --- resolution cascade ---

    async fn commit_group_links(&self, commit_ids: &[i64]) -> StoreResult<Vec<GroupLink>>;

    async fn pull_requests_merged_by(
        &self,
        organization_id: i64,
        shas: &[String],
    ) -> StoreResult<Vec<PullRequest>>;

    /// `resolves` links onto the given pull requests.
    async fn pull_request_resolution_links(&self, pull_request_ids: &[i64])
        -> StoreResult<Vec<GroupLink>>;

    async fn get_commit_author(&self, author_id: i64) -> StoreResult<Option<CommitAuthor>>;

    /// Upserts the group's resolution for `release_id`, marks the group
    /// resolved and removes it from the inbox. One transaction.
    async fn resolve_group_in_release(
        &self,
        group_id: i64,
        release_id: i64,
        actor_id: Option<i64>,
    ) -> StoreResult<Group>;
}
