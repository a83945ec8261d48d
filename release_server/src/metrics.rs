//! Prometheus metrics for release tracking.

use std::time::Duration;

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a release lookup-or-create.
pub fn get_or_create_duration(elapsed: Duration, created: bool, cache_hit: bool) {
    histogram!(
        "release_get_or_create_duration_seconds",
        "created" => created.to_string(),
        "cache_hit" => cache_hit.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn set_commits_duration(elapsed: Duration) {
    histogram!("release_set_commits_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn commits_bound(count: usize) {
    counter!("release_commits_bound_total").increment(count as u64);
}

/// Record a commit binding refused because the release lock was held.
pub fn lock_contention() {
    counter!("release_lock_contention_total").increment(1);
}

pub fn group_resolved(instance: &'static str) {
    counter!("release_groups_resolved_total", "instance" => instance).increment(1);
}

pub fn task_scheduled(job: &'static str) {
    counter!("release_tasks_scheduled_total", "job" => job).increment(1);
}
