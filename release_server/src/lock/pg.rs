//! Lease rows in PostgreSQL, effective across processes.
//!
//! Acquisition is a single upsert that only takes over an existing row when
//! its lease has expired, so two contenders can never both succeed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Timestamptz, Uuid as SqlUuid, Varchar};
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use super::{lease_expiry, LockError, LockLease, LockManager};
use crate::error::StoreError;
use crate::schema::release_locks;
use crate::store::pg::DieselPool;

const ACQUIRE_SQL: &str = "\
INSERT INTO release_locks (lock_key, holder_id, token, acquired_at, expires_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (lock_key) DO UPDATE
    SET holder_id = EXCLUDED.holder_id,
        token = EXCLUDED.token,
        acquired_at = EXCLUDED.acquired_at,
        expires_at = EXCLUDED.expires_at
    WHERE release_locks.expires_at <= EXCLUDED.acquired_at
RETURNING token";

#[derive(QueryableByName)]
struct AcquiredToken {
    #[diesel(sql_type = SqlUuid)]
    token: Uuid,
}

#[derive(Clone)]
pub struct PgLockManager {
    pool: DieselPool,
    holder_id: String,
}

impl PgLockManager {
    pub fn new(pool: DieselPool) -> Self {
        Self {
            pool,
            holder_id: format!("pg-{}", Uuid::new_v4()),
        }
    }
}

fn pool_err(e: impl std::fmt::Display) -> LockError {
    LockError::Store(StoreError::Backend(e.to_string()))
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl);
        let token = Uuid::new_v4();

        let acquired: Option<AcquiredToken> = diesel::sql_query(ACQUIRE_SQL)
            .bind::<Varchar, _>(key)
            .bind::<Varchar, _>(&self.holder_id)
            .bind::<SqlUuid, _>(token)
            .bind::<Timestamptz, _>(now)
            .bind::<Timestamptz, _>(expires_at)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(StoreError::from)?;

        Ok(acquired
            .filter(|row| row.token == token)
            .map(|_| LockLease {
                key: key.to_string(),
                holder_id: self.holder_id.clone(),
                token,
                expires_at,
            }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let deleted = diesel::delete(
            release_locks::table
                .filter(release_locks::lock_key.eq(&lease.key))
                .filter(release_locks::token.eq(lease.token)),
        )
        .execute(&mut conn)
        .await
        .map_err(StoreError::from)?;
        Ok(deleted == 1)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let expires_at: Option<DateTime<Utc>> = release_locks::table
            .filter(release_locks::lock_key.eq(key))
            .select(release_locks::expires_at)
            .first(&mut conn)
            .await
            .optional()
            .map_err(StoreError::from)?;
        Ok(expires_at.is_some_and(|at| at > Utc::now()))
    }
}
