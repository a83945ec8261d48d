//! Resolves issues fixed by the commits just bound to a release.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ReleaseResult;
use crate::external::{UserDirectory, UserId};
use crate::models::commit::BindingOutcome;
use crate::models::group::{dedupe_by_group, ResolutionCandidate};
use crate::queue::{schedule_logged, ScheduledTask, TaskQueue};
use crate::signals::{IssueResolved, SignalBus};
use crate::store::ReleaseStore;

/// Groups the cascade touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    pub resolved: Vec<i64>,
    /// Groups whose resolution failed; each failure was logged and skipped.
    pub failed: Vec<i64>,
}

pub struct ResolutionCascade {
    store: Arc<dyn ReleaseStore>,
    users: Arc<dyn UserDirectory>,
    queue: Arc<dyn TaskQueue>,
    signals: SignalBus,
}

impl ResolutionCascade {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        users: Arc<dyn UserDirectory>,
        queue: Arc<dyn TaskQueue>,
        signals: SignalBus,
    ) -> Self {
        Self {
            store,
            users,
            queue,
            signals,
        }
    }

    /// Resolves every issue linked to a bound commit, or to a pull request
    /// merged by one, in the binding's release. Each issue is resolved at
    /// most once per call.
    pub async fn run(&self, outcome: &BindingOutcome) -> ReleaseResult<CascadeReport> {
        let release = &outcome.release;
        let bound = self.store.release_commits(release.id).await?;
        if bound.is_empty() {
            return Ok(CascadeReport::default());
        }

        let commit_ids: Vec<i64> = bound.iter().map(|c| c.commit_id).collect();
        let stored_author: HashMap<i64, Option<i64>> =
            bound.iter().map(|c| (c.commit_id, c.author_id)).collect();

        let mut candidates: Vec<ResolutionCandidate> = self
            .store
            .commit_group_links(&commit_ids)
            .await?
            .into_iter()
            .map(|link| ResolutionCandidate {
                group_id: link.group_id,
                author_id: outcome
                    .author_for(link.linked_id)
                    .or_else(|| stored_author.get(&link.linked_id).copied().flatten()),
            })
            .collect();

        let keys: Vec<String> = bound.iter().map(|c| c.key.clone()).collect();
        let pull_requests = self
            .store
            .pull_requests_merged_by(release.organization_id, &keys)
            .await?;
        if !pull_requests.is_empty() {
            let pr_authors: HashMap<i64, Option<i64>> =
                pull_requests.iter().map(|pr| (pr.id, pr.author_id)).collect();
            let pr_ids: Vec<i64> = pull_requests.iter().map(|pr| pr.id).collect();
            let links = self.store.pull_request_resolution_links(&pr_ids).await?;
            candidates.extend(links.into_iter().map(|link| ResolutionCandidate {
                group_id: link.group_id,
                author_id: pr_authors.get(&link.linked_id).copied().flatten(),
            }));
        }

        let mut users: HashMap<i64, Option<UserId>> = HashMap::new();
        let mut report = CascadeReport::default();
        for candidate in dedupe_by_group(candidates) {
            let actor_id = match candidate.author_id {
                Some(author_id) => self.actor_for(author_id, &mut users).await,
                None => None,
            };

            let group = match self
                .store
                .resolve_group_in_release(candidate.group_id, release.id, actor_id)
                .await
            {
                Ok(group) => group,
                Err(e) => {
                    tracing::error!(
                        group_id = candidate.group_id,
                        release_id = release.id,
                        error = %e,
                        "Failed to resolve issue in release"
                    );
                    report.failed.push(candidate.group_id);
                    continue;
                }
            };

            crate::metrics::group_resolved("in_commit");
            let event = IssueResolved {
                organization_id: release.organization_id,
                project_id: group.project_id,
                group_id: group.id,
                release_id: release.id,
                actor_id,
                resolution_type: IssueResolved::WITH_COMMIT,
            };
            self.signals.send_robust(&event).await;
            schedule_logged(
                self.queue.as_ref(),
                ScheduledTask::KickOffStatusSyncs {
                    project_id: group.project_id,
                    group_id: group.id,
                },
            )
            .await;
            report.resolved.push(group.id);
        }

        if !report.resolved.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                release_id = release.id,
                resolved = report.resolved.len(),
                failed = report.failed.len(),
                "Resolved issues from commits"
            );
        }
        Ok(report)
    }

    /// First platform user matching the author; looked up once per author.
    async fn actor_for(
        &self,
        author_id: i64,
        cache: &mut HashMap<i64, Option<UserId>>,
    ) -> Option<UserId> {
        if let Some(actor) = cache.get(&author_id) {
            return *actor;
        }
        let actor = match self.store.get_commit_author(author_id).await {
            Ok(Some(author)) => match self.users.find_users(&author).await {
                Ok(users) => users.first().copied(),
                Err(e) => {
                    tracing::warn!(author_id, error = %e, "User lookup failed");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(author_id, error = %e, "Commit author lookup failed");
                None
            }
        };
        cache.insert(author_id, actor);
        actor
    }
}
