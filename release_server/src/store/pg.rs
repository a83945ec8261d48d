//! PostgreSQL store on diesel-async.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::error::{StoreError, StoreResult};
use crate::models::commit::{
    BindingOutcome, BoundCommit, Commit, CommitAuthor, NewCommit, NewCommitAuthor,
    NewCommitFileChange, NewReleaseCommit, NewReleaseHeadCommit, NewRepository, PlannedAuthor,
    PlannedCommit, PullRequest, Repository,
};
use crate::models::group::{
    Group, GroupLink, GroupStatus, InboxRemoveAction, LinkedType, NewGroupResolution, Relationship,
};
use crate::models::project::Project;
use crate::models::release::{
    Distribution, NewDistribution, NewRelease, NewReleaseProject, Release, ReleaseStats,
};
use crate::schema::{
    commit_authors, commit_file_changes, commits, distributions, files, group_inbox, group_links,
    group_resolutions, issue_groups, projects, pull_requests, release_commits,
    release_head_commits, release_files, release_projects, releases, repositories,
};
use crate::store::{ReleaseReference, ReleaseStore};

pub type DieselPool = Pool<AsyncPgConnection>;

#[derive(QueryableByName)]
struct RowId {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(Clone)]
pub struct PgReleaseStore {
    pool: DieselPool,
}

impl PgReleaseStore {
    pub fn new(pool: DieselPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

async fn get_or_create_repository(
    conn: &mut AsyncPgConnection,
    organization_id: i64,
    name: &str,
) -> StoreResult<Repository> {
    diesel::insert_into(repositories::table)
        .values(NewRepository {
            organization_id,
            name,
            date_added: Utc::now(),
        })
        .on_conflict((repositories::organization_id, repositories::name))
        .do_nothing()
        .execute(conn)
        .await?;

    let repository = repositories::table
        .filter(repositories::organization_id.eq(organization_id))
        .filter(repositories::name.eq(name))
        .select(Repository::as_select())
        .first(conn)
        .await?;
    Ok(repository)
}

async fn resolve_author(
    conn: &mut AsyncPgConnection,
    organization_id: i64,
    planned: &PlannedAuthor,
) -> StoreResult<CommitAuthor> {
    diesel::insert_into(commit_authors::table)
        .values(NewCommitAuthor {
            organization_id,
            name: planned.name.as_deref(),
            email: &planned.email,
        })
        .on_conflict((commit_authors::organization_id, commit_authors::email))
        .do_nothing()
        .execute(conn)
        .await?;

    let mut author = commit_authors::table
        .filter(commit_authors::organization_id.eq(organization_id))
        .filter(commit_authors::email.eq(&planned.email))
        .select(CommitAuthor::as_select())
        .first(conn)
        .await?;

    if let Some(name) = planned.name.as_deref() {
        if author.name.as_deref() != Some(name) {
            diesel::update(commit_authors::table.find(author.id))
                .set(commit_authors::name.eq(name))
                .execute(conn)
                .await?;
            author.name = Some(name.to_string());
        }
    }
    Ok(author)
}

async fn upsert_commit(
    conn: &mut AsyncPgConnection,
    organization_id: i64,
    repository_id: i64,
    planned: &PlannedCommit,
    author_id: Option<i64>,
) -> StoreResult<Commit> {
    let inserted = diesel::insert_into(commits::table)
        .values(NewCommit {
            organization_id,
            repository_id,
            key: &planned.key,
            date_added: planned.date_added.unwrap_or_else(Utc::now),
            author_id,
            message: planned.message.as_deref(),
        })
        .on_conflict((commits::repository_id, commits::key))
        .do_nothing()
        .returning(Commit::as_returning())
        .get_result(conn)
        .await
        .optional()?;
    if let Some(commit) = inserted {
        return Ok(commit);
    }

    let existing = commits::table
        .filter(commits::repository_id.eq(repository_id))
        .filter(commits::key.eq(&planned.key))
        .select(Commit::as_select())
        .first(conn)
        .await?;

    let changes = planned.changes(author_id).against(&existing);
    if changes.is_empty() {
        return Ok(existing);
    }
    let updated = diesel::update(commits::table.find(existing.id))
        .set(&changes)
        .returning(Commit::as_returning())
        .get_result(conn)
        .await?;
    Ok(updated)
}

#[async_trait]
impl ReleaseStore for PgReleaseStore {
    async fn get_release(&self, release_id: i64) -> StoreResult<Release> {
        let mut conn = self.conn().await?;
        let release = releases::table
            .find(release_id)
            .select(Release::as_select())
            .first(&mut conn)
            .await?;
        Ok(release)
    }

    async fn get_project(&self, project_id: i64) -> StoreResult<Project> {
        let mut conn = self.conn().await?;
        let project = projects::table
            .find(project_id)
            .select(Project::as_select())
            .first(&mut conn)
            .await?;
        Ok(project)
    }

    async fn find_release(
        &self,
        organization_id: i64,
        version: &str,
    ) -> StoreResult<Option<Release>> {
        let mut conn = self.conn().await?;
        let release = releases::table
            .filter(releases::organization_id.eq(organization_id))
            .filter(releases::version.eq(version))
            .select(Release::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(release)
    }

    async fn find_project_releases(
        &self,
        organization_id: i64,
        project_id: i64,
        versions: &[String],
    ) -> StoreResult<Vec<Release>> {
        let mut conn = self.conn().await?;
        let found = releases::table
            .inner_join(release_projects::table)
            .filter(releases::organization_id.eq(organization_id))
            .filter(release_projects::project_id.eq(project_id))
            .filter(releases::version.eq_any(versions))
            .select(Release::as_select())
            .load(&mut conn)
            .await?;
        Ok(found)
    }

    async fn create_release(&self, release: NewRelease) -> StoreResult<Release> {
        let mut conn = self.conn().await?;
        let created = diesel::insert_into(releases::table)
            .values(&release)
            .returning(Release::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(created)
    }

    async fn add_release_project(&self, release_id: i64, project_id: i64) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let inserted = diesel::insert_into(release_projects::table)
                    .values(NewReleaseProject { project_id, release_id })
                    .on_conflict((release_projects::project_id, release_projects::release_id))
                    .do_nothing()
                    .execute(conn)
                    .await?;
                diesel::update(
                    projects::table
                        .find(project_id)
                        .filter(projects::has_releases.eq(false)),
                )
                .set(projects::has_releases.eq(true))
                .execute(conn)
                .await?;
                Ok(inserted == 1)
            }
            .scope_boxed()
        })
        .await
    }

    async fn release_project_ids(&self, release_id: i64) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn().await?;
        let ids = release_projects::table
            .filter(release_projects::release_id.eq(release_id))
            .select(release_projects::project_id)
            .order(release_projects::project_id.asc())
            .load(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn previous_release(&self, release: &Release) -> StoreResult<Option<Release>> {
        let mut conn = self.conn().await?;
        let project_ids: Vec<i64> = release_projects::table
            .filter(release_projects::release_id.eq(release.id))
            .select(release_projects::project_id)
            .load(&mut conn)
            .await?;
        if project_ids.is_empty() {
            return Ok(None);
        }
        let previous = releases::table
            .inner_join(release_projects::table)
            .filter(releases::organization_id.eq(release.organization_id))
            .filter(release_projects::project_id.eq_any(&project_ids))
            .filter(releases::id.ne(release.id))
            .order((
                diesel::dsl::sql::<Timestamptz>(
                    "COALESCE(releases.date_released, releases.date_added)",
                )
                .desc(),
                releases::id.desc(),
            ))
            .select(Release::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(previous)
    }

    async fn reparent_all(
        &self,
        reference: ReleaseReference,
        from: i64,
        to: i64,
    ) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let query = format!(
            "UPDATE {table} SET {column} = $1 WHERE {column} = $2",
            table = reference.table_name(),
            column = reference.column_name(),
        );
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let moved = diesel::sql_query(query)
                    .bind::<BigInt, _>(to)
                    .bind::<BigInt, _>(from)
                    .execute(conn)
                    .await?;
                Ok(moved as u64)
            }
            .scope_boxed()
        })
        .await
    }

    async fn referencing_row_ids(
        &self,
        reference: ReleaseReference,
        release_id: i64,
    ) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn().await?;
        let query = format!(
            "SELECT id FROM {table} WHERE {column} = $1 ORDER BY id",
            table = reference.table_name(),
            column = reference.column_name(),
        );
        let rows: Vec<RowId> = diesel::sql_query(query)
            .bind::<BigInt, _>(release_id)
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn reparent_row(
        &self,
        reference: ReleaseReference,
        row_id: i64,
        to: i64,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let query = format!(
            "UPDATE {table} SET {column} = $1 WHERE id = $2",
            table = reference.table_name(),
            column = reference.column_name(),
        );
        diesel::sql_query(query)
            .bind::<BigInt, _>(to)
            .bind::<BigInt, _>(row_id)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_row(&self, reference: ReleaseReference, row_id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let query = format!("DELETE FROM {} WHERE id = $1", reference.table_name());
        diesel::sql_query(query)
            .bind::<BigInt, _>(row_id)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_release(&self, release_id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::delete(releases::table.find(release_id))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_first_release_of_any_group(&self, release_id: i64) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let referenced: bool = diesel::select(diesel::dsl::exists(
            issue_groups::table.filter(issue_groups::first_release_id.eq(release_id)),
        ))
        .get_result(&mut conn)
        .await?;
        Ok(referenced)
    }

    async fn delete_release_and_files(&self, release_id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let file_ids: Vec<i64> = release_files::table
                    .filter(release_files::release_id.eq(release_id))
                    .select(release_files::file_id)
                    .load(conn)
                    .await?;
                diesel::delete(release_files::table.filter(release_files::release_id.eq(release_id)))
                    .execute(conn)
                    .await?;
                if !file_ids.is_empty() {
                    diesel::delete(files::table.filter(files::id.eq_any(&file_ids)))
                        .execute(conn)
                        .await?;
                }
                diesel::delete(releases::table.find(release_id))
                    .execute(conn)
                    .await?;
                tracing::debug!(release_id, files = file_ids.len(), "Deleted release and files");
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_or_create_distribution(
        &self,
        release: &Release,
        name: &str,
        date_added: DateTime<Utc>,
    ) -> StoreResult<Distribution> {
        let mut conn = self.conn().await?;
        diesel::insert_into(distributions::table)
            .values(NewDistribution {
                organization_id: release.organization_id,
                release_id: release.id,
                name,
                date_added,
            })
            .on_conflict((distributions::release_id, distributions::name))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        let dist = distributions::table
            .filter(distributions::release_id.eq(release.id))
            .filter(distributions::name.eq(name))
            .select(Distribution::as_select())
            .first(&mut conn)
            .await?;
        Ok(dist)
    }

    async fn find_distribution(
        &self,
        release_id: i64,
        name: &str,
    ) -> StoreResult<Option<Distribution>> {
        let mut conn = self.conn().await?;
        let dist = distributions::table
            .filter(distributions::release_id.eq(release_id))
            .filter(distributions::name.eq(name))
            .select(Distribution::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(dist)
    }

    async fn bind_commits(
        &self,
        release: &Release,
        commits: &[PlannedCommit],
    ) -> StoreResult<BindingOutcome> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let organization_id = release.organization_id;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                diesel::delete(
                    release_commits::table.filter(release_commits::release_id.eq(release.id)),
                )
                .execute(conn)
                .await?;

                let mut repository_ids: HashMap<&str, i64> = HashMap::new();
                let mut author_ids: HashMap<&str, i64> = HashMap::new();
                let mut bound = Vec::with_capacity(commits.len());
                let mut head_commits: Vec<(i64, i64)> = Vec::new();

                for (index, planned) in commits.iter().enumerate() {
                    let repository_id = match repository_ids.get(planned.repository.as_str()) {
                        Some(id) => *id,
                        None => {
                            let repo =
                                get_or_create_repository(conn, organization_id, &planned.repository)
                                    .await?;
                            repository_ids.insert(planned.repository.as_str(), repo.id);
                            repo.id
                        }
                    };

                    let author_id = match &planned.author {
                        None => None,
                        Some(author) => match author_ids.get(author.email.as_str()) {
                            Some(id) => Some(*id),
                            None => {
                                let resolved = resolve_author(conn, organization_id, author).await?;
                                author_ids.insert(author.email.as_str(), resolved.id);
                                Some(resolved.id)
                            }
                        },
                    };

                    let commit =
                        upsert_commit(conn, organization_id, repository_id, planned, author_id)
                            .await?;

                    for change in &planned.file_changes {
                        diesel::insert_into(commit_file_changes::table)
                            .values(NewCommitFileChange {
                                organization_id,
                                commit_id: commit.id,
                                filename: &change.filename,
                                change_type: &change.change_type,
                            })
                            .on_conflict((
                                commit_file_changes::commit_id,
                                commit_file_changes::filename,
                            ))
                            .do_nothing()
                            .execute(conn)
                            .await?;
                    }

                    diesel::insert_into(release_commits::table)
                        .values(NewReleaseCommit {
                            organization_id,
                            release_id: release.id,
                            commit_id: commit.id,
                            order_index: i32::try_from(index).unwrap_or(i32::MAX),
                        })
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;

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
                let release = diesel::update(releases::table.find(release.id))
                    .set(&stats)
                    .returning(Release::as_returning())
                    .get_result(conn)
                    .await?;

                Ok(BindingOutcome {
                    release,
                    bound,
                    head_commits,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn create_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(release_head_commits::table)
            .values(NewReleaseHeadCommit {
                organization_id: release.organization_id,
                repository_id,
                release_id: release.id,
                commit_id,
            })
            .on_conflict((release_head_commits::repository_id, release_head_commits::release_id))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn set_head_commit(
        &self,
        release: &Release,
        repository_id: i64,
        commit_id: i64,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(release_head_commits::table)
            .values(NewReleaseHeadCommit {
                organization_id: release.organization_id,
                repository_id,
                release_id: release.id,
                commit_id,
            })
            .on_conflict((release_head_commits::repository_id, release_head_commits::release_id))
            .do_update()
            .set(release_head_commits::commit_id.eq(commit_id))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_repositories(
        &self,
        organization_id: i64,
        names: &[String],
    ) -> StoreResult<Vec<Repository>> {
        let mut conn = self.conn().await?;
        let found = repositories::table
            .filter(repositories::organization_id.eq(organization_id))
            .filter(repositories::name.eq_any(names))
            .select(Repository::as_select())
            .load(&mut conn)
            .await?;
        Ok(found)
    }

    async fn get_or_create_commit(
        &self,
        organization_id: i64,
        repository_id: i64,
        key: &str,
    ) -> StoreResult<Commit> {
        let mut conn = self.conn().await?;
        diesel::insert_into(commits::table)
            .values(NewCommit {
                organization_id,
                repository_id,
                key,
                date_added: Utc::now(),
                author_id: None,
                message: None,
            })
            .on_conflict((commits::repository_id, commits::key))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        let commit = commits::table
            .filter(commits::repository_id.eq(repository_id))
            .filter(commits::key.eq(key))
            .select(Commit::as_select())
            .first(&mut conn)
            .await?;
        Ok(commit)
    }

    async fn release_commits(&self, release_id: i64) -> StoreResult<Vec<BoundCommit>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(i64, String, i64, Option<i64>)> = release_commits::table
            .inner_join(commits::table)
            .filter(release_commits::release_id.eq(release_id))
            .order(release_commits::order_index.asc())
            .select((commits::id, commits::key, commits::repository_id, commits::author_id))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(commit_id, key, repository_id, author_id)| BoundCommit {
                commit_id,
                key,
                repository_id,
                author_id,
            })
            .collect())
    }

    async fn commit_group_links(&self, commit_ids: &[i64]) -> StoreResult<Vec<GroupLink>> {
        let mut conn = self.conn().await?;
        let links = group_links::table
            .filter(group_links::linked_type.eq(LinkedType::Commit.as_str()))
            .filter(group_links::linked_id.eq_any(commit_ids))
            .order(group_links::id.asc())
            .select(GroupLink::as_select())
            .load(&mut conn)
            .await?;
        Ok(links)
    }

    async fn pull_requests_merged_by(
        &self,
        organization_id: i64,
        shas: &[String],
    ) -> StoreResult<Vec<PullRequest>> {
        let mut conn = self.conn().await?;
        let prs = pull_requests::table
            .filter(pull_requests::organization_id.eq(organization_id))
            .filter(pull_requests::merge_commit_sha.eq_any(shas))
            .order(pull_requests::id.asc())
            .select(PullRequest::as_select())
            .load(&mut conn)
            .await?;
        Ok(prs)
    }

    async fn pull_request_resolution_links(
        &self,
        pull_request_ids: &[i64],
    ) -> StoreResult<Vec<GroupLink>> {
        let mut conn = self.conn().await?;
        let links = group_links::table
            .filter(group_links::linked_type.eq(LinkedType::PullRequest.as_str()))
            .filter(group_links::relationship.eq(Relationship::Resolves.as_str()))
            .filter(group_links::linked_id.eq_any(pull_request_ids))
            .order(group_links::id.asc())
            .select(GroupLink::as_select())
            .load(&mut conn)
            .await?;
        Ok(links)
    }

    async fn get_commit_author(&self, author_id: i64) -> StoreResult<Option<CommitAuthor>> {
        let mut conn = self.conn().await?;
        let author = commit_authors::table
            .find(author_id)
            .select(CommitAuthor::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(author)
    }

    async fn resolve_group_in_release(
        &self,
        group_id: i64,
        release_id: i64,
        actor_id: Option<i64>,
    ) -> StoreResult<Group> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let resolution = NewGroupResolution::in_release(group_id, release_id, actor_id);
                diesel::insert_into(group_resolutions::table)
                    .values(&resolution)
                    .on_conflict(group_resolutions::group_id)
                    .do_update()
                    .set(&resolution)
                    .execute(conn)
                    .await?;

                let group = diesel::update(issue_groups::table.find(group_id))
                    .set(issue_groups::status.eq(GroupStatus::Resolved.as_str()))
                    .returning(Group::as_returning())
                    .get_result(conn)
                    .await?;

                let removed = diesel::delete(group_inbox::table.filter(group_inbox::group_id.eq(group_id)))
                    .execute(conn)
                    .await?;
                if removed > 0 {
                    tracing::debug!(
                        group_id,
                        action = %InboxRemoveAction::Resolved,
                        "Removed group from inbox"
                    );
                }
                Ok(group)
            }
            .scope_boxed()
        })
        .await
    }
}
