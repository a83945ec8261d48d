//! Release lifecycle: lookup and creation, project association, merge,
//! safe deletion and distributions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::cache::{release_cache_key, CachedRelease, ReleaseCache};
use crate::error::{
    ReleaseError, ReleaseResult, StoreError, ERR_RELEASE_HEALTH_DATA, ERR_RELEASE_HEALTH_UNKNOWN,
    ERR_RELEASE_REFERENCED,
};
use crate::external::{HealthDataCheck, VersionParser};
use crate::models::project::Project;
use crate::models::release::{project_version, Distribution, NewRelease, Release};
use crate::store::{ReleaseReference, ReleaseStore, ReparentStrategy, RELEASE_REFERENCES};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CACHE_MISS_TTL: Duration = Duration::from_secs(300);

pub struct ReleaseManager {
    store: Arc<dyn ReleaseStore>,
    cache: Arc<dyn ReleaseCache>,
    versions: Arc<dyn VersionParser>,
    health: Arc<dyn HealthDataCheck>,
    cache_ttl: Duration,
    cache_miss_ttl: Duration,
}

impl ReleaseManager {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        cache: Arc<dyn ReleaseCache>,
        versions: Arc<dyn VersionParser>,
        health: Arc<dyn HealthDataCheck>,
    ) -> Self {
        Self {
            store,
            cache,
            versions,
            health,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_miss_ttl: DEFAULT_CACHE_MISS_TTL,
        }
    }

    pub fn with_cache_ttls(mut self, ttl: Duration, miss_ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self.cache_miss_ttl = miss_ttl;
        self
    }

    /// The project's release with this exact version, if any.
    pub async fn get(&self, project: &Project, version: &str) -> ReleaseResult<Option<Release>> {
        let key = release_cache_key(project.organization_id, version);
        match self.cache.get(&key).await {
            Some(CachedRelease::Found(release)) => return Ok(Some(release)),
            Some(CachedRelease::Missing) => return Ok(None),
            None => {}
        }

        let found = self
            .store
            .find_project_releases(project.organization_id, project.id, &[version.to_string()])
            .await?
            .into_iter()
            .next();
        let cached = match &found {
            Some(release) => CachedRelease::Found(release.clone()),
            None => CachedRelease::Missing,
        };
        self.cache.set(&key, cached, self.cache_miss_ttl).await;
        Ok(found)
    }

    /// Finds or creates the release for `version` and associates it with
    /// `project`.
    ///
    /// A release stored under the project-qualified version
    /// (`"{slug}-{version}"`) is preferred over the raw version. Concurrent
    /// callers converge on a single row.
    pub async fn get_or_create(
        &self,
        project: &Project,
        version: &str,
        date_added: Option<DateTime<Utc>>,
    ) -> ReleaseResult<Release> {
        let started = Instant::now();
        let key = release_cache_key(project.organization_id, version);

        if let Some(CachedRelease::Found(release)) = self.cache.get(&key).await {
            crate::metrics::get_or_create_duration(started.elapsed(), false, true);
            return Ok(release);
        }

        let qualified = project_version(&project.slug, version);
        let candidates = self
            .store
            .find_project_releases(
                project.organization_id,
                project.id,
                &[version.to_string(), qualified.clone()],
            )
            .await?;

        let (release, created) = match prefer_qualified(candidates, &qualified) {
            Some(release) => (release, false),
            None => {
                let (release, created) = self
                    .create_or_fetch(project.organization_id, version, date_added)
                    .await?;
                self.add_project(&release, project).await?;
                (release, created)
            }
        };

        self.cache
            .set(&key, CachedRelease::Found(release.clone()), self.cache_ttl)
            .await;
        crate::metrics::get_or_create_duration(started.elapsed(), created, false);
        if created {
            tracing::info!(
                release_id = release.id,
                organization_id = release.organization_id,
                version = %release.version,
                "Release created"
            );
        }
        Ok(release)
    }

    async fn create_or_fetch(
        &self,
        organization_id: i64,
        version: &str,
        date_added: Option<DateTime<Utc>>,
    ) -> ReleaseResult<(Release, bool)> {
        let mut new = NewRelease::new(organization_id, version, date_added.unwrap_or_else(Utc::now));
        match self.versions.parse(version) {
            Ok(info) => new = new.with_version_info(&info),
            Err(e) => tracing::debug!(version, error = %e, "Release version is not semver"),
        }

        match self.store.create_release(new).await {
            Ok(release) => Ok((release, true)),
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_release(organization_id, version)
                    .await?
                    .ok_or(ReleaseError::Persistence(StoreError::NotFound))?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Associates the release with the project. `false` when it already was.
    pub async fn add_project(&self, release: &Release, project: &Project) -> ReleaseResult<bool> {
        match self.store.add_release_project(release.id, project.id).await {
            Ok(created) => Ok(created),
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Folds `sources` into `target` and deletes them.
    ///
    /// Each source is merged independently; a failure leaves earlier sources
    /// merged.
    pub async fn merge(&self, target: &Release, sources: &[Release]) -> ReleaseResult<()> {
        for source in sources {
            if source.id == target.id {
                continue;
            }
            for reference in RELEASE_REFERENCES {
                self.reparent(*reference, source.id, target.id).await?;
            }
            self.reparent(ReleaseReference::GroupFirstRelease, source.id, target.id)
                .await?;
            self.store.delete_release(source.id).await?;
            self.cache
                .expire(&release_cache_key(source.organization_id, &source.version))
                .await;
            tracing::info!(from = source.id, to = target.id, "Release merged");
        }
        self.cache
            .expire(&release_cache_key(target.organization_id, &target.version))
            .await;
        Ok(())
    }

    async fn reparent(&self, reference: ReleaseReference, from: i64, to: i64) -> ReleaseResult<()> {
        let err = match self.store.reparent_all(reference, from, to).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        if !err.is_conflict() || reference.strategy() == ReparentStrategy::Bulk {
            return Err(err.into());
        }

        let rows = self.store.referencing_row_ids(reference, from).await?;
        let mut dropped = 0usize;
        for row_id in rows {
            match self.store.reparent_row(reference, row_id, to).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    self.store.delete_row(reference, row_id).await?;
                    dropped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(
            table = reference.table_name(),
            from,
            to,
            dropped,
            "Reparented row by row after conflict"
        );
        Ok(())
    }

    /// Deletes the release, its files and release files.
    ///
    /// # Errors
    ///
    /// `UnsafeDeletion` when an issue was first seen in this release or the
    /// release has health data. Nothing is modified in that case.
    pub async fn safe_delete(&self, release: &Release) -> ReleaseResult<()> {
        if self.store.is_first_release_of_any_group(release.id).await? {
            return Err(ReleaseError::UnsafeDeletion {
                reason: ERR_RELEASE_REFERENCED.to_string(),
            });
        }

        let pairs: Vec<(i64, String)> = self
            .store
            .release_project_ids(release.id)
            .await?
            .into_iter()
            .map(|project_id| (project_id, release.version.clone()))
            .collect();
        match self.health.has_health_data(&pairs).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(ReleaseError::UnsafeDeletion {
                    reason: ERR_RELEASE_HEALTH_DATA.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(release_id = release.id, error = %e, "Health data check failed");
                return Err(ReleaseError::UnsafeDeletion {
                    reason: ERR_RELEASE_HEALTH_UNKNOWN.to_string(),
                });
            }
        }

        self.store
            .delete_release_and_files(release.id)
            .await
            .map_err(|e| ReleaseError::from_store(e, "release", release.id))?;
        self.cache
            .expire(&release_cache_key(release.organization_id, &release.version))
            .await;
        tracing::info!(release_id = release.id, version = %release.version, "Release deleted");
        Ok(())
    }

    pub async fn add_dist(
        &self,
        release: &Release,
        name: &str,
        date_added: Option<DateTime<Utc>>,
    ) -> ReleaseResult<Distribution> {
        let dist = self
            .store
            .get_or_create_distribution(release, name, date_added.unwrap_or_else(Utc::now))
            .await?;
        Ok(dist)
    }

    pub async fn get_dist(&self, release: &Release, name: &str) -> ReleaseResult<Option<Distribution>> {
        Ok(self.store.find_distribution(release.id, name).await?)
    }
}

fn prefer_qualified(candidates: Vec<Release>, qualified: &str) -> Option<Release> {
    let mut fallback = None;
    for release in candidates {
        if release.version == qualified {
            return Some(release);
        }
        fallback.get_or_insert(release);
    }
    fallback
}
