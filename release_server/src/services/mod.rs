//! Release tracking services and their wiring.

pub mod commit_service;
pub mod release_service;
pub mod resolution_service;

use std::sync::Arc;

use crate::cache::ReleaseCache;
use crate::config::ReleaseConfig;
use crate::external::{
    HealthDataCheck, IgnoreMarkerFilter, NoHealthData, NoUserDirectory, SemverParser,
    UserDirectory, VersionParser,
};
use crate::lock::{LockManager, RetryPolicy};
use crate::queue::TaskQueue;
use crate::signals::{ResolutionListener, SignalBus};
use crate::store::ReleaseStore;

pub use commit_service::CommitReconciler;
pub use release_service::ReleaseManager;
pub use resolution_service::{CascadeReport, ResolutionCascade};

/// Storage and coordination backends.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ReleaseStore>,
    pub locks: Arc<dyn LockManager>,
    pub cache: Arc<dyn ReleaseCache>,
    pub queue: Arc<dyn TaskQueue>,
}

/// Systems owned elsewhere that the services consult.
#[derive(Clone)]
pub struct Collaborators {
    pub versions: Arc<dyn VersionParser>,
    pub health: Arc<dyn HealthDataCheck>,
    pub users: Arc<dyn UserDirectory>,
    pub listeners: Vec<Arc<dyn ResolutionListener>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            versions: Arc::new(SemverParser),
            health: Arc::new(NoHealthData),
            users: Arc::new(NoUserDirectory),
            listeners: Vec::new(),
        }
    }
}

pub struct ReleaseServices {
    pub releases: ReleaseManager,
    pub commits: CommitReconciler,
}

impl ReleaseServices {
    pub fn new(config: &ReleaseConfig, backends: Backends, collaborators: Collaborators) -> Self {
        let releases = ReleaseManager::new(
            backends.store.clone(),
            backends.cache.clone(),
            collaborators.versions,
            collaborators.health,
        )
        .with_cache_ttls(config.cache_ttl, config.cache_miss_ttl);

        let mut signals = SignalBus::new();
        for listener in collaborators.listeners {
            signals.subscribe(listener);
        }
        let cascade = Arc::new(ResolutionCascade::new(
            backends.store.clone(),
            collaborators.users,
            backends.queue.clone(),
            signals,
        ));

        let commits = CommitReconciler::new(
            backends.store,
            backends.locks,
            backends.queue,
            Arc::new(IgnoreMarkerFilter::new(config.commit_ignore_marker.clone())),
            cascade,
        )
        .with_lock(
            config.lock_duration,
            RetryPolicy::with_max_attempts(config.lock_max_retries),
        );

        Self { releases, commits }
    }
}
