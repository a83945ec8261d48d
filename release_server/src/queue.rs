//! Fire-and-forget background work.
//!
//! Tasks are handed to an external worker pool; the services never wait on
//! them. The PostgreSQL queue writes an outbox row the workers poll.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::models::commit::CommitRef;
use crate::schema::release_tasks;
use crate::store::pg::DieselPool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduledTask {
    /// Fetch the commit history between the release's refs and the previous
    /// release from the VCS provider.
    FetchCommits {
        release_id: i64,
        user_id: Option<i64>,
        refs: Vec<CommitRef>,
        prev_release_id: Option<i64>,
    },
    /// Push a resolved issue's new state to linked external trackers.
    KickOffStatusSyncs { project_id: i64, group_id: i64 },
}

impl ScheduledTask {
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::FetchCommits { .. } => "fetch_commits",
            Self::KickOffStatusSyncs { .. } => "kick_off_status_syncs",
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn schedule(&self, task: ScheduledTask) -> anyhow::Result<()>;
}

/// Schedules `task`, logging instead of failing when the queue is unavailable.
pub async fn schedule_logged(queue: &dyn TaskQueue, task: ScheduledTask) {
    let job = task.job_name();
    match queue.schedule(task).await {
        Ok(()) => crate::metrics::task_scheduled(job),
        Err(e) => tracing::warn!(job, error = %e, "Failed to schedule task"),
    }
}

#[derive(Insertable)]
#[diesel(table_name = release_tasks)]
struct NewTaskRow<'a> {
    job_name: &'a str,
    payload: serde_json::Value,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: DieselPool,
}

impl PgTaskQueue {
    pub fn new(pool: DieselPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn schedule(&self, task: ScheduledTask) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(release_tasks::table)
            .values(NewTaskRow {
                job_name: task.job_name(),
                payload: serde_json::to_value(&task)?,
                created_at: Utc::now(),
            })
            .execute(&mut conn)
            .await?;
        tracing::debug!(job = task.job_name(), "Task queued");
        Ok(())
    }
}

/// Records scheduled tasks in memory.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl MemoryTaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn schedule(&self, task: ScheduledTask) -> anyhow::Result<()> {
        self.tasks
            .lock()
            .map_err(|_| anyhow::anyhow!("task queue lock poisoned"))?
            .push(task);
        Ok(())
    }
}
