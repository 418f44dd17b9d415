//! Short-TTL cache over the single `storage_config` row.
//!
//! The row is owned by an external admin surface; this service only reads
//! it. Every component resolves the active configuration through `get`, so
//! an out-of-band change is picked up within one TTL, or immediately after
//! `invalidate`.

use crate::errors::{UploadError, UploadResult};
use crate::models::storage_config::StorageConfiguration;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ConfigCache {
    db: Arc<SqlitePool>,
    ttl: Duration,
    slot: Arc<RwLock<Option<(Instant, StorageConfiguration)>>>,
}

impl ConfigCache {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self::with_ttl(db, DEFAULT_TTL)
    }

    pub fn with_ttl(db: Arc<SqlitePool>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Return the cached configuration, refreshing from the database when
    /// the cached copy is older than the TTL.
    pub async fn get(&self) -> UploadResult<StorageConfiguration> {
        {
            let slot = self.slot.read().await;
            if let Some((fetched_at, cfg)) = slot.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(cfg.clone());
                }
            }
        }

        let mut slot = self.slot.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some((fetched_at, cfg)) = slot.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(cfg.clone());
            }
        }

        let cfg = self.load().await?;
        *slot = Some((Instant::now(), cfg.clone()));
        Ok(cfg)
    }

    /// Drop the cached copy so the next `get` re-reads the row.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        *slot = None;
    }

    async fn load(&self) -> UploadResult<StorageConfiguration> {
        sqlx::query_as::<_, StorageConfiguration>(
            "SELECT provider, s3_bucket, s3_region, s3_endpoint, s3_access_key, s3_secret_key,
                    s3_force_path_style, max_file_size, default_quota, session_ttl_hours,
                    retention_days, presign_ttl_secs
             FROM storage_config WHERE id = 1",
        )
        .fetch_one(&*self.db)
        .await
        .map_err(UploadError::Sqlx)
    }
}
