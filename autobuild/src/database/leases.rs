//! Lease rows backing named locks shared by every instance on one datastore.
//!
//! A lease is taken by inserting a row, or by overwriting a row whose lease
//! already expired. Dropping the guard deletes the row; a crashed holder's
//! row simply expires.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Pool, Sqlite};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::Database;
use crate::resource_lock::{ResourceGuard, ResourceLocks};

#[derive(Clone)]
pub struct LeaseLocks {
    pool: Pool<Sqlite>,
    holder: String,
    lease: Duration,
}

impl LeaseLocks {
    pub fn new(pool: Pool<Sqlite>, lease: Duration) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
            lease,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Database {
    pub fn lease_locks(&self, lease: Duration) -> LeaseLocks {
        LeaseLocks::new(self.pool.clone(), lease)
    }
}

#[async_trait]
impl ResourceLocks for LeaseLocks {
    #[instrument(skip_all, fields(resource = %resource, holder = %self.holder))]
    async fn try_lock(&self, resource: &str) -> Result<Option<ResourceGuard>> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO resource_leases (resource, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(resource) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE julianday(resource_leases.expires_at) < julianday(?4)
            "#,
        )
        .bind(resource)
        .bind(&self.holder)
        .bind(now + self.lease)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            debug!("Lease on {} held by another instance", resource);
            return Ok(None);
        }

        let pool = self.pool.clone();
        let holder = self.holder.clone();
        let key = resource.to_string();
        Ok(Some(ResourceGuard::new(resource, move || {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("No runtime to release lease on {}; it will expire", key);
                return;
            };
            handle.spawn(async move {
                let released = sqlx::query(
                    "DELETE FROM resource_leases WHERE resource = ? AND holder = ?",
                )
                .bind(&key)
                .bind(&holder)
                .execute(&pool)
                .await;
                if let Err(e) = released {
                    warn!("Failed to release lease on {}: {}", key, e);
                }
            });
        })))
    }
}
