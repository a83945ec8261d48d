//! In-memory store for tests and embedding.
//!
//! Uniqueness constraints are enforced the same way the PostgreSQL schema
//! enforces them, so conflict handling in the services is exercised. Multi-row
//! operations run against a copy of the state that replaces the original only
//! on success.
//!
//! Not suitable for production: single process, no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::models::commit::{
    BindingOutcome, BoundCommit, Commit, CommitAuthor, CommitFileChange, PlannedAuthor,
    PlannedCommit, PullRequest, ReleaseCommit, ReleaseHeadCommit, Repository,
};
use crate::models::group::{
    Group, GroupInbox, GroupLink, GroupRelease, GroupResolution, GroupStatus, LinkedType,
    NewGroupResolution, Relationship,
};
use crate::models::project::Project;
use crate::models::release::{
    Distribution, NewRelease, Release, ReleaseEnvironment, ReleaseFile, ReleaseProject,
    ReleaseProjectEnvironment, ReleaseStats, StoredFile,
};
use crate::store::{ReleaseReference, ReleaseStore};

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Poisoned
}

/// A row carrying a release id that merges may move.
trait ReleaseRow {
    fn row_id(&self) -> i64;
    fn release_ref(&self) -> Option<i64>;
    fn set_release_ref(&mut self, release_id: i64);
    /// Values that must be unique among rows sharing a release id.
    fn scoped_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

impl ReleaseRow for ReleaseCommit {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("commit:{}", self.commit_id), format!("order:{}", self.order_index)]
    }
}

impl ReleaseRow for ReleaseEnvironment {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("env:{}:{}", self.organization_id, self.environment_id)]
    }
}

impl ReleaseRow for ReleaseFile {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("name:{}", self.name)]
    }
}

impl ReleaseRow for ReleaseProject {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("project:{}", self.project_id)]
    }
}

impl ReleaseRow for ReleaseProjectEnvironment {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("project-env:{}:{}", self.project_id, self.environment_id)]
    }
}

impl ReleaseRow for GroupRelease {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
    fn scoped_keys(&self) -> Vec<String> {
        vec![format!("group:{}:{}", self.group_id, self.environment)]
    }
}

// group_id alone is unique, so moving a resolution never conflicts.
impl ReleaseRow for GroupResolution {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        Some(self.release_id)
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.release_id = release_id;
    }
}

impl ReleaseRow for Group {
    fn row_id(&self) -> i64 {
        self.id
    }
    fn release_ref(&self) -> Option<i64> {
        self.first_release_id
    }
    fn set_release_ref(&mut self, release_id: i64) {
        self.first_release_id = Some(release_id);
    }
}

trait RowTable {
    fn ids_for(&self, release_id: i64) -> Vec<i64>;
    /// Moves the rows to `to`, all or nothing.
    fn move_rows(&mut self, row_ids: &[i64], to: i64) -> StoreResult<u64>;
    fn remove(&mut self, row_id: i64);
}

impl<T: ReleaseRow> RowTable for Vec<T> {
    fn ids_for(&self, release_id: i64) -> Vec<i64> {
        self.iter()
            .filter(|r| r.release_ref() == Some(release_id))
            .map(ReleaseRow::row_id)
            .collect()
    }

    fn move_rows(&mut self, row_ids: &[i64], to: i64) -> StoreResult<u64> {
        let mut taken: HashSet<String> = self
            .iter()
            .filter(|r| r.release_ref() == Some(to) && !row_ids.contains(&r.row_id()))
            .flat_map(ReleaseRow::scoped_keys)
            .collect();
        for row in self.iter().filter(|r| row_ids.contains(&r.row_id())) {
            for key in row.scoped_keys() {
                if !taken.insert(key.clone()) {
                    return Err(StoreError::Conflict(format!("{key} already bound to release {to}")));
                }
            }
        }
        let mut moved = 0;
        for row in self.iter_mut().filter(|r| row_ids.contains(&r.row_id())) {
            row.set_release_ref(to);
            moved += 1;
        }
        Ok(moved)
    }

    fn remove(&mut self, row_id: i64) {
        self.retain(|r| r.row_id() != row_id);
    }
}

#[derive(Debug, Default, Clone)]
struct State {
    next_id: i64,
    projects: BTreeMap<i64, Project>,
    releases: BTreeMap<i64, Release>,
    release_projects: Vec<ReleaseProject>,
    repositories: Vec<Repository>,
    authors: Vec<CommitAuthor>,
    commits: Vec<Commit>,
    file_changes: Vec<CommitFileChange>,
    release_commits: Vec<ReleaseCommit>,
    head_commits: Vec<ReleaseHeadCommit>,
    pull_requests: Vec<PullRequest>,
    groups: Vec<Group>,
    group_links: Vec<GroupLink>,
    resolutions: Vec<GroupResolution>,
    inbox: Vec<GroupInbox>,
    group_releases: Vec<GroupRelease>,
    release_environments: Vec<ReleaseEnvironment>,
    release_project_environments: Vec<ReleaseProjectEnvironment>,
    files: Vec<StoredFile>,
    release_files: Vec<ReleaseFile>,
    distributions: Vec<Distribution>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&self, reference: ReleaseReference) -> &dyn RowTable {
        match reference {
            ReleaseReference::ReleaseCommits => &self.release_commits,
            ReleaseReference::ReleaseEnvironments => &self.release_environments,
            ReleaseReference::ReleaseFiles => &self.release_files,
            ReleaseReference::ReleaseProjects => &self.release_projects,
            ReleaseReference::ReleaseProjectEnvironments => &self.release_project_environments,
            ReleaseReference::GroupReleases => &self.group_releases,
            ReleaseReference::GroupResolutions => &self.resolutions,
            ReleaseReference::GroupFirstRelease => &self.groups,
        }
    }

    fn table_mut(&mut self, reference: ReleaseReference) -> &mut dyn RowTable {
        match reference {
            ReleaseReference::ReleaseCommits => &mut self.release_commits,
            ReleaseReference::ReleaseEnvironments => &mut self.release_environments,
            ReleaseReference::ReleaseFiles => &mut self.release_files,
            ReleaseReference::ReleaseProjects => &mut self.release_projects,
            ReleaseReference::ReleaseProjectEnvironments => &mut self.release_project_environments,
            ReleaseReference::GroupReleases => &mut self.group_releases,
            ReleaseReference::GroupResolutions => &mut self.resolutions,
            ReleaseReference::GroupFirstRelease => &mut self.groups,
        }
    }

    fn project_ids_of(&self, release_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .release_projects
            .iter()
            .filter(|rp| rp.release_id == release_id)
            .map(|rp| rp.project_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn repository(&mut self, organization_id: i64, name: &str) -> Repository {
        if let Some(repo) = self
            .repositories
            .iter()
            .find(|r| r.organization_id == organization_id && r.name == name)
        {
            return repo.clone();
        }
        let repo = Repository {
            id: self.next_id(),
            organization_id,
            name: name.to_string(),
            date_added: Utc::now(),
        };
        self.repositories.push(repo.clone());
        repo
    }

    fn author(&mut self, organization_id: i64, planned: &PlannedAuthor) -> i64 {
        if let Some(author) = self
            .authors
            .iter_mut()
            .find(|a| a.organization_id == organization_id && a.email == planned.email)
        {
            if let Some(name) = &planned.name {
                if author.name.as_ref() != Some(name) {
                    author.name = Some(name.clone());
                }
            }
            return author.id;
        }
        let id = self.next_id();
        self.authors.push(CommitAuthor {
            id,
            organization_id,
            name: planned.name.clone(),
            email: planned.email.clone(),
        });
        id
    }

    fn upsert_commit(
        &mut self,
        organization_id: i64,
        repository_id: i64,
        planned: &PlannedCommit,
        author_id: Option<i64>,
    ) -> Commit {
        if let Some(existing) = self
            .commits
            .iter_mut()
            .find(|c| c.repository_id == repository_id && c.key == planned.key)
        {
            let changes = planned.changes(author_id).against(existing);
            changes.apply(existing);
            return existing.clone();
        }
        let commit = Commit {
            id: self.next_id(),
            organization_id,
            repository_id,
            key: planned.key.clone(),
            date_added: planned.date_added.unwrap_or_else(Utc::now),
            author_id,
            message: planned.message.clone(),
        };
        self.commits.push(commit.clone());
        commit
    }

    fn bind(&mut self, release: &Release, commits: &[PlannedCommit]) -> StoreResult<BindingOutcome> {
        let organization_id = release.organization_id;
        self.release_commits.retain(|rc| rc.release_id != release.id);

        let mut author_ids: HashMap<&str, i64> = HashMap::new();
        let mut bound = Vec::with_capacity(commits.len());
        let mut head_commits: Vec<(i64, i64)> = Vec::new();

        for (index, planned) in commits.iter().enumerate() {
            let repository_id = self.repository(organization_id, &planned.repository).id;
            let author_id = match &planned.author {
                None => None,
                Some(author) => Some(match author_ids.get(author.email.as_str()) {
                    Some(id) => *id,
                    None => {
                        let id = self.author(organization_id, author);
                        author_ids.insert(author.email.as_str(), id);
                        id
                    }
                }),
            };
            let commit = self.upsert_commit(organization_id, repository_id, planned, author_id);

            for change in &planned.file_changes {
                let exists = self
                    .file_changes
                    .iter()
                    .any(|fc| fc.commit_id == commit.id && fc.filename == change.filename);
                if !exists {
                    let id = self.next_id();
                    self.file_changes.push(CommitFileChange {
                        id,
                        organization_id,
                        commit_id: commit.id,
                        filename: change.filename.clone(),
                        change_type: change.change_type.clone(),
                    });
                }
            }

            let order_index = i32::try_from(index).unwrap_or(i32::MAX);
            let duplicate = self.release_commits.iter().any(|rc| {
                rc.release_id == release.id
                    && (rc.commit_id == commit.id || rc.order_index == order_index)
            });
            if !duplicate {
                let id = self.next_id();
                self.release_commits.push(ReleaseCommit {
                    id,
                    organization_id,
                    release_id: release.id,
                    commit_id: commit.id,
                    order_index,
                });
            }

            if !head_commits.iter().any(|(repo, _)| *repo == repository_id) {
                head_commits.push((repository_id, commit.id));
            }
            bound.push(BoundCommit {
                commit_id: commit.id,
                key: commit.key,
                repository_id,
                author_id: commit.author_id,
            });
        }

        let stats = ReleaseStats::from_bound(commits.len(), &bound);
        let stored = self.releases.get_mut(&release.id).ok_or(StoreError::NotFound)?;
        stored.apply_stats(&stats);
        Ok(BindingOutcome {
            release: stored.clone(),
            bound,
            head_commits,
        })
    }

    fn remove_release(&mut self, release_id: i64) -> StoreResult<()> {
        if self.groups.iter().any(|g| g.first_release_id == Some(release_id)) {
            return Err(StoreError::Backend(format!(
                "release {release_id} is still referenced by issue_groups.first_release_id"
            )));
        }
        self.releases.remove(&release_id).ok_or(StoreError::NotFound)?;
        self.release_projects.retain(|r| r.release_id != release_id);
        self.release_commits.retain(|r| r.release_id != release_id);
        self.head_commits.retain(|r| r.release_id != release_id);
        self.release_environments.retain(|r| r.release_id != release_id);
        self.release_project_environments.retain(|r| r.release_id != release_id);
        self.group_releases.retain(|r| r.release_id != release_id);
        self.resolutions.retain(|r| r.release_id != release_id);
        self.release_files.retain(|r| r.release_id != release_id);
        self.distributions.retain(|r| r.release_id != release_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReleaseStore {
    state: Mutex<State>,
    failing_groups: Mutex<HashSet<i64>>,
    failing_head_commits: AtomicBool,
}

impl InMemoryReleaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock().map_err(poison_err)?;
        f(&mut state)
    }

    /// Runs `f` against a copy of the state, keeping the copy only on success.
    fn transaction<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut draft = state.clone();
        let value = f(&mut draft)?;
        *state = draft;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    // --- seeding ---

    pub fn add_project(&self, organization_id: i64, slug: &str) -> Project {
        self.write(|s| {
            let project = Project {
                id: s.next_id(),
                organization_id,
                slug: slug.to_string(),
                has_releases: false,
            };
            s.projects.insert(project.id, project.clone());
            project
        })
    }

    pub fn add_repository(&self, organization_id: i64, name: &str) -> Repository {
        self.write(|s| s.repository(organization_id, name))
    }

    pub fn add_commit_author(&self, organization_id: i64, name: Option<&str>, email: &str) -> CommitAuthor {
        self.write(|s| {
            let author = CommitAuthor {
                id: s.next_id(),
                organization_id,
                name: name.map(str::to_string),
                email: email.to_string(),
            };
            s.authors.push(author.clone());
            author
        })
    }

    /// An unresolved group waiting in the inbox.
    pub fn add_group(&self, project_id: i64, first_release_id: Option<i64>) -> Group {
        self.write(|s| {
            let group = Group {
                id: s.next_id(),
                project_id,
                status: GroupStatus::Unresolved.as_str().to_string(),
                first_release_id,
            };
            s.groups.push(group.clone());
            let inbox_id = s.next_id();
            s.inbox.push(GroupInbox {
                id: inbox_id,
                group_id: group.id,
                project_id,
                reason: "new".to_string(),
                date_added: Utc::now(),
            });
            group
        })
    }

    pub fn link_group(
        &self,
        group_id: i64,
        linked_type: LinkedType,
        linked_id: i64,
        relationship: Relationship,
    ) -> GroupLink {
        self.write(|s| {
            let project_id = s
                .groups
                .iter()
                .find(|g| g.id == group_id)
                .map_or(0, |g| g.project_id);
            let link = GroupLink {
                id: s.next_id(),
                group_id,
                project_id,
                linked_type: linked_type.as_str().to_string(),
                linked_id,
                relationship: relationship.as_str().to_string(),
                date_added: Utc::now(),
            };
            s.group_links.push(link.clone());
            link
        })
    }

    pub fn add_pull_request(
        &self,
        repository: &Repository,
        key: &str,
        merge_commit_sha: Option<&str>,
        author_id: Option<i64>,
    ) -> PullRequest {
        self.write(|s| {
            let pr = PullRequest {
                id: s.next_id(),
                organization_id: repository.organization_id,
                repository_id: repository.id,
                key: key.to_string(),
                title: None,
                author_id,
                merge_commit_sha: merge_commit_sha.map(str::to_string),
                date_added: Utc::now(),
            };
            s.pull_requests.push(pr.clone());
            pr
        })
    }

    pub fn add_release_file(&self, release_id: i64, name: &str) -> ReleaseFile {
        self.write(|s| {
            let organization_id = s.releases.get(&release_id).map_or(0, |r| r.organization_id);
            let file_id = s.next_id();
            s.files.push(StoredFile {
                id: file_id,
                name: name.to_string(),
                size: Some(0),
                checksum: None,
            });
            let release_file = ReleaseFile {
                id: s.next_id(),
                organization_id,
                release_id,
                file_id,
                name: name.to_string(),
            };
            s.release_files.push(release_file.clone());
            release_file
        })
    }

    pub fn add_release_environment(&self, release_id: i64, environment_id: i64) {
        self.write(|s| {
            let organization_id = s.releases.get(&release_id).map_or(0, |r| r.organization_id);
            let id = s.next_id();
            s.release_environments.push(ReleaseEnvironment {
                id,
                organization_id,
                release_id,
                environment_id,
            });
        });
    }

    pub fn add_group_release(&self, group_id: i64, release_id: i64, environment: &str) {
        self.write(|s| {
            let project_id = s.groups.iter().find(|g| g.id == group_id).map_or(0, |g| g.project_id);
            let id = s.next_id();
            s.group_releases.push(GroupRelease {
                id,
                project_id,
                group_id,
                release_id,
                environment: environment.to_string(),
            });
        });
    }

    /// Makes every resolution of `group_id` fail with a backend error.
    pub fn fail_resolution_for(&self, group_id: i64) {
        self.failing_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id);
    }

    /// Makes every head commit write fail with a backend error.
    pub fn fail_head_commits(&self) {
        self.failing_head_commits.store(true, Ordering::SeqCst);
    }

    // --- inspection ---

    pub fn release_commit_rows(&self, release_id: i64) -> Vec<ReleaseCommit> {
        self.read(|s| {
            let mut rows: Vec<_> = s
                .release_commits
                .iter()
                .filter(|rc| rc.release_id == release_id)
                .cloned()
                .collect();
            rows.sort_by_key(|rc| rc.order_index);
            rows
        })
    }

    /// Keys of the commits bound to the release, in binding order.
    pub fn release_commit_keys(&self, release_id: i64) -> Vec<String> {
        let rows = self.release_commit_rows(release_id);
        self.read(|s| {
            rows.iter()
                .filter_map(|rc| s.commits.iter().find(|c| c.id == rc.commit_id))
                .map(|c| c.key.clone())
                .collect()
        })
    }

    pub fn head_commits(&self, release_id: i64) -> Vec<ReleaseHeadCommit> {
        self.read(|s| {
            s.head_commits
                .iter()
                .filter(|h| h.release_id == release_id)
                .cloned()
                .collect()
        })
    }

    pub fn commit_by_key(&self, organization_id: i64, key: &str) -> Option<Commit> {
        self.read(|s| {
            s.commits
                .iter()
                .find(|c| c.organization_id == organization_id && c.key == key)
                .cloned()
        })
    }

    pub fn commit_authors(&self, organization_id: i64) -> Vec<CommitAuthor> {
        self.read(|s| {
            s.authors
                .iter()
                .filter(|a| a.organization_id == organization_id)
                .cloned()
                .collect()
        })
    }

    pub fn repositories(&self, organization_id: i64) -> Vec<Repository> {
        self.read(|s| {
            s.repositories
                .iter()
                .filter(|r| r.organization_id == organization_id)
                .cloned()
                .collect()
        })
    }

    pub fn file_changes(&self, commit_id: i64) -> Vec<CommitFileChange> {
        self.read(|s| {
            s.file_changes
                .iter()
                .filter(|fc| fc.commit_id == commit_id)
                .cloned()
                .collect()
        })
    }

    pub fn group(&self, group_id: i64) -> Option<Group> {
        self.read(|s| s.groups.iter().find(|g| g.id == group_id).cloned())
    }

    pub fn resolution(&self, group_id: i64) -> Option<GroupResolution> {
        self.read(|s| s.resolutions.iter().find(|r| r.group_id == group_id).cloned())
    }

    pub fn in_inbox(&self, group_id: i64) -> bool {
        self.read(|s| s.inbox.iter().any(|i| i.group_id == group_id))
    }

    pub fn project(&self, project_id: i64) -> Option<Project> {
        self.read(|s| s.projects.get(&project_id).cloned())
    }

    pub fn release_count(&self, organization_id: i64, version: &str) -> usize {
        self.read(|s| {
            s.releases
                .values()
                .filter(|r| r.organization_id == organization_id && r.version == version)
                .count()
        })
    }

    pub fn release_exists(&self, release_id: i64) -> bool {
        self.read(|s| s.releases.contains_key(&release_id))
    }

    pub fn release_files(&self, release_id: i64) -> Vec<ReleaseFile> {
        self.read(|s| {
            s.release_files
                .iter()
                .filter(|f| f.release_id == release_id)
                .cloned()
                .collect()
        })
    }

    pub fn stored_file_count(&self) -> usize {
        self.read(|s| s.files.len())
    }

    pub fn rows_referencing(&self, reference: ReleaseReference, release_id: i64) -> usize {
        self.read(|s| s.table(reference).ids_for(release_id).len())
    }

    /// Updates a release in place, e.g. to set `date_released`.
    pub fn update_release(&self, release_id: i64, f: impl FnOnce(&mut Release)) {
        self.write(|s| {
            if let Some(release) = s.releases.get_mut(&release_id) {
                f(release);
            }
        });
    }
}

#[async_trait]
impl ReleaseStore for InMemoryReleaseStore {
    async fn get_release(&self, release_id: i64) -> StoreResult<Release> {
        self.with_state(|s| s.releases.get(&release_id).cloned().ok_or(StoreError::NotFound))
    }

    async fn get_project(&self, project_id: i64) -> StoreResult<Project> {
        self.with_state(|s| s.projects.get(&project_id).cloned().ok_or(StoreError::NotFound))
    }

    async fn find_release(
        &self,
        organization_id: i64,
        version: &str,
    ) -> StoreResult<Option<Release>> {
        self.with_state(|s| {
            Ok(s.releases
                .values()
                .find(|r| r.organization_id == organization_id && r.version == version)
                .cloned())
        })
    }

    async fn find_project_releases(
        &self,
        organization_id: i64,
        project_id: i64,
        versions: &[String],
    ) -> StoreResult<Vec<Release>> {
        self.with_state(|s| {
            Ok(s.releases
                .values()
                .filter(|r| r.organization_id == organization_id && versions.contains(&r.version))
                .filter(|r| {
                    s.release_projects
                        .iter()
                        .any(|rp| rp.release_id == r.id && rp.project_id == project_id)
                })
                .cloned()
                .collect())
        })
    }

    async fn create_release(&self, release: NewRelease) -> StoreResult<Release> {
        self.with_state(|s| {
            let duplicate = s.releases.values().any(|r| {
                r.organization_id == release.organization_id && r.version == release.version
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "release {} already exists in organization {}",
                    release.version, release.organization_id
                )));
            }
            let created = Release {
                id: s.next_id(),
                organization_id: release.organization_id,
                version: release.version,
                ref_name: None,
                url: None,
                owner_id: None,
                status: Some("open".to_string()),
                date_added: release.date_added,
                date_started: None,
                date_released: None,
                data: release.data,
                new_groups: 0,
                commit_count: Some(0),
                last_commit_id: None,
                authors: None,
                total_deploys: release.total_deploys,
                last_deploy_id: None,
                package: release.package,
                major: release.major,
                minor: release.minor,
                patch: release.patch,
                revision: release.revision,
                prerelease: release.prerelease,
                build_code: release.build_code,
                build_number: release.build_number,
            };
            s.releases.insert(created.id, created.clone());
            Ok(created)
        })
    }

    async fn add_release_project(&self, release_id: i64, project_id: i64) -> StoreResult<bool> {
        self.transaction(|s| {
            let project = s.projects.get_mut(&project_id).ok_or(StoreError::NotFound)?;
            project.has_releases = true;
            let exists = s
                .release_projects
                .iter()
                .any(|rp| rp.release_id == release_id && rp.project_id == project_id);
            if exists {
                return Ok(false);
            }
            let id = s.next_id();
            s.release_projects.push(ReleaseProject {
                id,
                project_id,
                release_id,
                new_groups: Some(0),
            });
            Ok(true)
        })
    }

    async fn release_project_ids(&self, release_id: i64) -> StoreResult<Vec<i64>> {
        self.with_state(|s| Ok(s.project_ids_of(release_id)))
    }

    async fn previous_release(&self, release: &Release) -> StoreResult<Option<Release>> {
        self.with_state(|s| {
            let project_ids = s.project_ids_of(release.id);
            Ok(s.releases
                .values()
                .filter(|r| r.organization_id == release.organization_id && r.id != release.id)
                .filter(|r| {
                    s.release_projects
                        .iter()
                        .any(|rp| rp.release_id == r.id && project_ids.contains(&rp.project_id))
                })
                .max_by_key(|r| (r.sort_date(), r.id))
                .cloned())
        })
    }

    async fn reparent_all(
        &self,
        reference: ReleaseReference,
        from: i64,
        to: i64,
    ) -> StoreResult<u64> {
        self.with_state(|s| {
            let table = s.table_mut(reference);
            let ids = table.ids_for(from);
            table.move_rows(&ids, to)
        })
    }

    async fn referencing_row_ids(
        &self,
        reference: ReleaseReference,
        release_id: i64,
    ) -> StoreResult<Vec<i64>> {
        self.with_state(|s| Ok(s.table(reference).ids_for(release_id)))
    }

    async fn reparent_row(
        &self,
        reference: ReleaseReference,
        row_id: i64,
        to: i64,
    ) -> StoreResult<()> {
        self.with_state(|s| s.table_mut(reference).move_rows(&[row_id], to).map(|_| ()))
    }

    async fn delete_row(&self, reference: ReleaseReference, row_id: i64) -> StoreResult<()> {
        self.with_state(|s| {
            s.table_mut(reference).remove(row_id);
            Ok(())
        })
    }

    async fn delete_release(&self, release_id: i64) -> StoreResult<()> {
        self.transaction(|s| s.remove_release(release_id))
    }

    async fn is_first_release_of_any_group(&self, release_id: i64) -> StoreResult<bool> {
        self.with_state(|s| Ok(s.groups.iter().any(|g| g.first_release_id == Some(release_id))))
    }

    async fn delete_release_and_files(&self, release_id: i64) -> StoreResult<()> {
        self.transaction(|s| {
            let file_ids: Vec<i64> = s
                .release_files
                .iter()
                .filter(|f| f.release_id == release_id)
                .map(|f| f.file_id)
                .collect();
            s.release_files.retain(|f| f.release_id != release_id);
            s.files.retain(|f| !file_ids.contains(&f.id));
            s.remove_release(release_id)
        })
    }

    async fn get_or_create_distribution(
        &self,
        release: &Release,
        name: &str,
        date_added: DateTime<Utc>,
    ) -> StoreResult<Distribution> {
        self.with_state(|s| {
            if let Some(dist) = s
                .distributions
                .iter()
                .find(|d| d.release_id == release.id && d.name == name)
            {
                return Ok(dist.clone());
            }
            let dist = Distribution {
                id: s.next_id(),
                organization_id: release.organization_id,
                release_id: release.id,
                name: name.to_string(),
                date_added,
            };
            s.distributions.push(dist.clone());
            Ok(dist)
        })
    }

    async fn find_distribution(
        &self,
        release_id: i64,
        name: &str,
    ) -> StoreResult<Option<Distribution>> {
        self.with_state(|s| {
            Ok(s.distributions
                .iter()
                .find(|d| d.release_id == release_id && d.name == name)
                .cloned())
        })
    }

    async fn bind_commits(
        &self,
        release: &Release,
        commits: &[PlannedCommit],
    ) -> StoreResult<BindingOutcome> {
        self.transaction(|s| s.bind(release, commits))
    }

    async fn create_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<bool> {
        if self.failing_head_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!(
                "injected head commit failure for release {}",
                release.id
            )));
        }
        self.with_state(|s| {
            let exists = s
                .head_commits
                .iter()
                .any(|h| h.release_id == release.id && h.repository_id == repository_id);
            if exists {
                return Ok(false);
            }
            let id = s.next_id();
            s.head_commits.push(ReleaseHeadCommit {
                id,
                organization_id: release.organization_id,
                repository_id,
                release_id: release.id,
                commit_id,
            });
            Ok(true)
        })
    }

    async fn set_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<()> {
        self.with_state(|s| {
            if let Some(head) = s
                .head_commits
                .iter_mut()
                .find(|h| h.release_id == release.id && h.repository_id == repository_id)
            {
                head.commit_id = commit_id;
                return Ok(());
            }
            let id = s.next_id();
            s.head_commits.push(ReleaseHeadCommit {
                id,
                organization_id: release.organization_id,
                repository_id,
                release_id: release.id,
                commit_id,
            });
            Ok(())
        })
    }

    async fn find_repositories(
        &self,
        organization_id: i64,
        names: &[String],
    ) -> StoreResult<Vec<Repository>> {
        self.with_state(|s| {
            Ok(s.repositories
                .iter()
                .filter(|r| r.organization_id == organization_id && names.contains(&r.name))
                .cloned()
                .collect())
        })
    }

    async fn get_or_create_commit(
        &self,
        organization_id: i64,
        repository_id: i64,
        key: &str,
    ) -> StoreResult<Commit> {
        self.with_state(|s| {
            if let Some(commit) = s
                .commits
                .iter()
                .find(|c| c.repository_id == repository_id && c.key == key)
            {
                return Ok(commit.clone());
            }
            let commit = Commit {
                id: s.next_id(),
                organization_id,
                repository_id,
                key: key.to_string(),
                date_added: Utc::now(),
                author_id: None,
                message: None,
            };
            s.commits.push(commit.clone());
            Ok(commit)
        })
    }

    async fn release_commits(&self, release_id: i64) -> StoreResult<Vec<BoundCommit>> {
        self.with_state(|s| {
            let mut rows: Vec<&ReleaseCommit> = s
                .release_commits
                .iter()
                .filter(|rc| rc.release_id == release_id)
                .collect();
            rows.sort_by_key(|rc| rc.order_index);
            Ok(rows
                .into_iter()
                .filter_map(|rc| s.commits.iter().find(|c| c.id == rc.commit_id))
                .map(|c| BoundCommit {
                    commit_id: c.id,
                    key: c.key.clone(),
                    repository_id: c.repository_id,
                    author_id: c.author_id,
                })
                .collect())
        })
    }

    async fn commit_group_links(&self, commit_ids: &[i64]) -> StoreResult<Vec<GroupLink>> {
        self.with_state(|s| {
            Ok(s.group_links
                .iter()
                .filter(|l| {
                    l.linked_type == LinkedType::Commit.as_str() && commit_ids.contains(&l.linked_id)
                })
                .cloned()
                .collect())
        })
    }

    async fn pull_requests_merged_by(
        &self,
        organization_id: i64,
        shas: &[String],
    ) -> StoreResult<Vec<PullRequest>> {
        self.with_state(|s| {
            Ok(s.pull_requests
                .iter()
                .filter(|pr| {
                    pr.organization_id == organization_id
                        && pr.merge_commit_sha.as_ref().is_some_and(|sha| shas.contains(sha))
                })
                .cloned()
                .collect())
        })
    }

    async fn pull_request_resolution_links(
        &self,
        pull_request_ids: &[i64],
    ) -> StoreResult<Vec<GroupLink>> {
        self.with_state(|s| {
            Ok(s.group_links
                .iter()
                .filter(|l| {
                    l.linked_type == LinkedType::PullRequest.as_str()
                        && l.relationship == Relationship::Resolves.as_str()
                        && pull_request_ids.contains(&l.linked_id)
                })
                .cloned()
                .collect())
        })
    }

    async fn get_commit_author(&self, author_id: i64) -> StoreResult<Option<CommitAuthor>> {
        self.with_state(|s| Ok(s.authors.iter().find(|a| a.id == author_id).cloned()))
    }

    async fn resolve_group_in_release(
        &self,
        group_id: i64,
        release_id: i64,
        actor_id: Option<i64>,
    ) -> StoreResult<Group> {
        let failing = self
            .failing_groups
            .lock()
            .map_err(poison_err)?
            .contains(&group_id);
        if failing {
            return Err(StoreError::Backend(format!("injected failure for group {group_id}")));
        }
        self.transaction(|s| {
            let resolution = NewGroupResolution::in_release(group_id, release_id, actor_id);
            match s.resolutions.iter_mut().find(|r| r.group_id == group_id) {
                Some(existing) => {
                    existing.release_id = resolution.release_id;
                    existing.resolution_type = resolution.resolution_type.to_string();
                    existing.status = resolution.status.to_string();
                    existing.actor_id = resolution.actor_id;
                    existing.date_added = resolution.date_added;
                }
                None => {
                    let id = s.next_id();
                    s.resolutions.push(GroupResolution {
                        id,
                        group_id,
                        release_id,
                        resolution_type: resolution.resolution_type.to_string(),
                        status: resolution.status.to_string(),
                        actor_id,
                        date_added: resolution.date_added,
                    });
                }
            }
            let group = s
                .groups
                .iter_mut()
                .find(|g| g.id == group_id)
                .ok_or(StoreError::NotFound)?;
            group.status = GroupStatus::Resolved.as_str().to_string();
            let group = group.clone();
            s.inbox.retain(|i| i.group_id != group_id);
            Ok(group)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn release(store: &InMemoryReleaseStore, version: &str) -> StoreResult<Release> {
        store.create_release(NewRelease::new(1, version, Utc::now())).await
    }

    #[tokio::test]
    async fn duplicate_release_is_a_conflict() -> StoreResult<()> {
        let store = InMemoryReleaseStore::new();
        release(&store, "1.0").await?;
        let err = release(&store, "1.0").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.release_count(1, "1.0"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn bulk_move_is_all_or_nothing() -> StoreResult<()> {
        let store = InMemoryReleaseStore::new();
        let a = release(&store, "a").await?;
        let b = release(&store, "b").await?;
        store.add_release_file(a.id, "app.js");
        store.add_release_file(a.id, "app.js.map");
        store.add_release_file(b.id, "app.js");

        let err = store
            .reparent_all(ReleaseReference::ReleaseFiles, a.id, b.id)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.rows_referencing(ReleaseReference::ReleaseFiles, a.id), 2);
        assert_eq!(store.rows_referencing(ReleaseReference::ReleaseFiles, b.id), 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_restricted_by_first_release() -> StoreResult<()> {
        let store = InMemoryReleaseStore::new();
        let project = store.add_project(1, "web");
        let r = release(&store, "1.0").await?;
        store.add_group(project.id, Some(r.id));
        assert!(store.delete_release(r.id).await.is_err());
        assert!(store.release_exists(r.id));
        Ok(())
    }

    #[tokio::test]
    async fn failed_binding_leaves_state_untouched() -> StoreResult<()> {
        let store = InMemoryReleaseStore::new();
        let mut r = release(&store, "1.0").await?;
        r.id += 1000;
        let planned = PlannedCommit::from_submission(
            1,
            crate::models::commit::CommitSubmission { id: "abc".into(), ..Default::default() },
        );
        assert!(matches!(store.bind_commits(&r, &[planned]).await, Err(StoreError::NotFound)));
        assert!(store.commit_by_key(1, "abc").is_none());
        assert!(store.repositories(1).is_empty());
        Ok(())
    }
}
