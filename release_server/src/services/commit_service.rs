//! Commit reconciliation: binding commit lists and repository heads to releases.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ReleaseError, ReleaseResult};
use crate::external::CommitFilter;
use crate::lock::{acquire_with_retry, LockError, LockManager, RetryPolicy, DEFAULT_LOCK_TTL};
use crate::models::commit::{
    sort_newest_first, BindingOutcome, CommitRef, CommitSubmission, PlannedCommit,
};
use crate::models::release::Release;
use crate::queue::{schedule_logged, ScheduledTask, TaskQueue};
use crate::services::resolution_service::ResolutionCascade;
use crate::store::ReleaseStore;

pub struct CommitReconciler {
    store: Arc<dyn ReleaseStore>,
    locks: Arc<dyn LockManager>,
    queue: Arc<dyn TaskQueue>,
    filter: Arc<dyn CommitFilter>,
    cascade: Arc<ResolutionCascade>,
    lock_ttl: Duration,
    retry: RetryPolicy,
}

impl CommitReconciler {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        locks: Arc<dyn LockManager>,
        queue: Arc<dyn TaskQueue>,
        filter: Arc<dyn CommitFilter>,
        cascade: Arc<ResolutionCascade>,
    ) -> Self {
        Self {
            store,
            locks,
            queue,
            filter,
            cascade,
            lock_ttl: DEFAULT_LOCK_TTL,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_lock(mut self, ttl: Duration, retry: RetryPolicy) -> Self {
        self.lock_ttl = ttl;
        self.retry = retry;
        self
    }

    /// Replaces the release's commits with `commits`, newest first, then
    /// records repository heads and resolves linked issues.
    ///
    /// # Errors
    ///
    /// `LockBusy` when another binding for the release is in progress.
    /// Failures of the issue cascade are logged, not returned.
    pub async fn set_commits(
        &self,
        release: &Release,
        commits: Vec<CommitSubmission>,
    ) -> ReleaseResult<BindingOutcome> {
        let started = Instant::now();

        let mut commits: Vec<CommitSubmission> = commits
            .into_iter()
            .filter(|c| !self.filter.should_ignore(c.message.as_deref()))
            .collect();
        sort_newest_first(&mut commits);
        let planned: Vec<PlannedCommit> = commits
            .into_iter()
            .map(|c| PlannedCommit::from_submission(release.organization_id, c))
            .collect();

        let outcome = self.bind_locked(release, &planned).await?;

        for (repository_id, commit_id) in &outcome.head_commits {
            match self
                .store
                .create_head_commit(&outcome.release, *repository_id, *commit_id)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    tracing::warn!(
                        release_id = release.id,
                        repository_id,
                        error = %e,
                        "Failed to record head commit"
                    );
                }
            }
        }

        if let Err(e) = self.cascade.run(&outcome).await {
            tracing::error!(release_id = release.id, error = %e, "Issue resolution cascade failed");
        }

        crate::metrics::commits_bound(outcome.bound.len());
        crate::metrics::set_commits_duration(started.elapsed());
        tracing::info!(
            release_id = release.id,
            commits = outcome.bound.len(),
            repositories = outcome.head_commits.len(),
            "Commits set for release"
        );
        Ok(outcome)
    }

    async fn bind_locked(
        &self,
        release: &Release,
        planned: &[PlannedCommit],
    ) -> ReleaseResult<BindingOutcome> {
        let key = release.lock_key();

        // A binding already in flight is reported at once instead of queued.
        if self.locks.is_locked(&key).await.map_err(lock_error)? {
            crate::metrics::lock_contention();
            return Err(ReleaseError::LockBusy { key, attempts: 1 });
        }

        let lease = acquire_with_retry(self.locks.as_ref(), &key, self.lock_ttl, &self.retry)
            .await
            .map_err(|e| {
                if matches!(e, LockError::Busy { .. }) {
                    crate::metrics::lock_contention();
                }
                lock_error(e)
            })?;

        let bound = self.store.bind_commits(release, planned).await;

        match self.locks.release(&lease).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %lease.key, "Release lock expired before binding finished"),
            Err(e) => tracing::warn!(key = %lease.key, error = %e, "Failed to release lock"),
        }

        bound.map_err(|e| ReleaseError::from_store(e, "release", release.id))
    }

    /// Sets the head commit per repository from explicit refs. A `commit` of
    /// the form `a..b` names the previous commit too.
    ///
    /// # Errors
    ///
    /// `InvalidRepository` listing every unknown repository name; nothing is
    /// written in that case.
    pub async fn set_refs(
        &self,
        release: &Release,
        refs: Vec<CommitRef>,
        user_id: Option<i64>,
        fetch: bool,
    ) -> ReleaseResult<()> {
        let names: BTreeSet<String> = refs.iter().map(|r| r.repository.clone()).collect();
        let names: Vec<String> = names.into_iter().collect();
        let repositories: HashMap<String, i64> = self
            .store
            .find_repositories(release.organization_id, &names)
            .await?
            .into_iter()
            .map(|r| (r.name, r.id))
            .collect();

        let invalid: Vec<String> = names
            .into_iter()
            .filter(|name| !repositories.contains_key(name))
            .collect();
        if !invalid.is_empty() {
            return Err(ReleaseError::InvalidRepository { names: invalid });
        }

        let refs: Vec<CommitRef> = refs.into_iter().map(CommitRef::expand_range).collect();
        for commit_ref in &refs {
            let Some(repository_id) = repositories.get(&commit_ref.repository).copied() else {
                continue;
            };
            let commit = self
                .store
                .get_or_create_commit(release.organization_id, repository_id, &commit_ref.commit)
                .await?;
            self.store
                .set_head_commit(release, repository_id, commit.id)
                .await?;
        }

        if fetch {
            let prev_release_id = self.store.previous_release(release).await?.map(|r| r.id);
            schedule_logged(
                self.queue.as_ref(),
                ScheduledTask::FetchCommits {
                    release_id: release.id,
                    user_id,
                    refs,
                    prev_release_id,
                },
            )
            .await;
        }
        Ok(())
    }
}

fn lock_error(e: LockError) -> ReleaseError {
    match e {
        LockError::Busy { key, attempts } => ReleaseError::LockBusy { key, attempts },
        LockError::Store(e) => ReleaseError::Persistence(e),
    }
}
