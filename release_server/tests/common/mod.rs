//! Shared fixtures: services wired to in-memory backends and recording
//! collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use releasetrack_server::cache::InMemoryReleaseCache;
use releasetrack_server::config::ReleaseConfig;
use releasetrack_server::external::{HealthDataCheck, SemverParser, UserDirectory, UserId};
use releasetrack_server::lock::{InMemoryLockManager, LockError, LockLease, LockManager};
use releasetrack_server::models::commit::{CommitAuthor, CommitSubmission, PatchEntry};
use releasetrack_server::models::project::Project;
use releasetrack_server::models::release::Release;
use releasetrack_server::queue::MemoryTaskQueue;
use releasetrack_server::signals::{IssueResolved, ResolutionListener};
use releasetrack_server::store::InMemoryReleaseStore;
use releasetrack_server::{Backends, Collaborators, ReleaseResult, ReleaseServices};
use tokio::sync::Notify;

pub const ORG: i64 = 1;

/// Maps author emails to platform users and counts lookups.
#[derive(Default)]
pub struct StaticUserDirectory {
    users: Mutex<HashMap<String, UserId>>,
    pub lookups: AtomicUsize,
}

impl StaticUserDirectory {
    pub fn insert(&self, email: &str, user_id: UserId) {
        self.users.lock().unwrap().insert(email.to_string(), user_id);
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn find_users(&self, author: &CommitAuthor) -> anyhow::Result<Vec<UserId>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .users
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .get(&author.email)
            .copied()
            .into_iter()
            .collect())
    }
}

#[derive(Default)]
pub struct SwitchableHealth {
    pub has_data: AtomicBool,
    pub unavailable: AtomicBool,
}

#[async_trait]
impl HealthDataCheck for SwitchableHealth {
    async fn has_health_data(&self, _pairs: &[(i64, String)]) -> anyhow::Result<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("analytics store unreachable");
        }
        Ok(self.has_data.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<IssueResolved>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<IssueResolved> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResolutionListener for RecordingListener {
    async fn on_issue_resolved(&self, event: &IssueResolved) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

pub struct FailingListener;

#[async_trait]
impl ResolutionListener for FailingListener {
    async fn on_issue_resolved(&self, _event: &IssueResolved) -> anyhow::Result<()> {
        anyhow::bail!("webhook endpoint returned 500")
    }
}

/// Lock manager that, once armed, parks the next successful acquirer until
/// the test lets it continue.
pub struct GatedLockManager {
    inner: Arc<InMemoryLockManager>,
    armed: AtomicBool,
    pub entered: Notify,
    pub resume: Notify,
}

impl GatedLockManager {
    pub fn new(inner: Arc<InMemoryLockManager>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LockManager for GatedLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let lease = self.inner.try_acquire(key, ttl).await?;
        if lease.is_some() && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.resume.notified().await;
        }
        Ok(lease)
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        self.inner.release(lease).await
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        self.inner.is_locked(key).await
    }
}

pub struct Harness {
    pub store: Arc<InMemoryReleaseStore>,
    pub locks: Arc<InMemoryLockManager>,
    pub gate: Arc<GatedLockManager>,
    pub cache: Arc<InMemoryReleaseCache>,
    pub queue: Arc<MemoryTaskQueue>,
    pub users: Arc<StaticUserDirectory>,
    pub health: Arc<SwitchableHealth>,
    pub listener: Arc<RecordingListener>,
    pub services: ReleaseServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Like `new`, with a listener that always fails registered first.
    pub fn with_failing_listener() -> Self {
        Self::build(true)
    }

    fn build(failing_listener: bool) -> Self {
        let store = Arc::new(InMemoryReleaseStore::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let gate = Arc::new(GatedLockManager::new(locks.clone()));
        let cache = Arc::new(InMemoryReleaseCache::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let users = Arc::new(StaticUserDirectory::default());
        let health = Arc::new(SwitchableHealth::default());
        let listener = Arc::new(RecordingListener::default());

        let mut listeners: Vec<Arc<dyn ResolutionListener>> = Vec::new();
        if failing_listener {
            listeners.push(Arc::new(FailingListener));
        }
        listeners.push(listener.clone());

        let services = ReleaseServices::new(
            &ReleaseConfig::default(),
            Backends {
                store: store.clone(),
                locks: gate.clone(),
                cache: cache.clone(),
                queue: queue.clone(),
            },
            Collaborators {
                versions: Arc::new(SemverParser),
                health: health.clone(),
                users: users.clone(),
                listeners,
            },
        );

        Self {
            store,
            locks,
            gate,
            cache,
            queue,
            users,
            health,
            listener,
            services,
        }
    }

    pub fn project(&self, slug: &str) -> Project {
        self.store.add_project(ORG, slug)
    }

    pub async fn release(&self, project: &Project, version: &str) -> ReleaseResult<Release> {
        self.services.releases.get_or_create(project, version, None).await
    }
}

/// A commit in `repository` at `timestamp` seconds, with no author.
pub fn commit(key: &str, repository: &str, timestamp: Option<i64>) -> CommitSubmission {
    CommitSubmission {
        id: key.to_string(),
        repository: Some(repository.to_string()),
        timestamp: timestamp.and_then(|s| Utc.timestamp_opt(s, 0).single()),
        ..Default::default()
    }
}

pub fn authored(mut submission: CommitSubmission, name: Option<&str>, email: Option<&str>) -> CommitSubmission {
    submission.author_name = name.map(str::to_string);
    submission.author_email = email.map(str::to_string);
    submission
}

pub fn patch(path: Option<&str>, change_type: Option<&str>) -> PatchEntry {
    PatchEntry {
        path: path.map(str::to_string),
        change_type: change_type.map(str::to_string),
    }
}
