//! Per-user storage quota ledger.
//!
//! Reservation is the correctness mechanism: every reservation is matched
//! by exactly one release (cancel, reaper expiry) or consumed by a
//! successful finalize. Reconciliation only corrects drift left behind by
//! crashes and is advisory.

use crate::errors::{UploadError, UploadResult};
use crate::models::quota::UserQuota;
use crate::services::config_cache::ConfigCache;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct QuotaLedger {
    db: Arc<SqlitePool>,
    cache: ConfigCache,
}

impl QuotaLedger {
    pub fn new(db: Arc<SqlitePool>, cache: ConfigCache) -> Self {
        Self { db, cache }
    }

    /// Create the owner's ledger row if missing, with the configured
    /// default limit.
    async fn ensure_row(&self, owner: Uuid) -> UploadResult<()> {
        let default_quota = self.cache.get().await?.default_quota;
        sqlx::query(
            "INSERT INTO user_quotas (owner_id, used_bytes, limit_bytes, upload_count)
             VALUES (?, 0, ?, 0)
             ON CONFLICT(owner_id) DO NOTHING",
        )
        .bind(owner)
        .bind(default_quota)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Reserve `bytes` against the owner's ledger.
    ///
    /// The check and the increment are one conditional UPDATE, so two
    /// concurrent reservations cannot both observe room and overcommit:
    /// SQLite serializes writers and the condition is re-evaluated under
    /// the write lock. Privileged owners bypass the ceiling but still
    /// accumulate `used_bytes`.
    pub async fn reserve(&self, owner: Uuid, bytes: i64, privileged: bool) -> UploadResult<()> {
        if bytes < 0 {
            return Err(UploadError::Validation("negative reservation".into()));
        }
        self.ensure_row(owner).await?;

        let result = sqlx::query(
            "UPDATE user_quotas
             SET used_bytes = used_bytes + ?1, upload_count = upload_count + 1
             WHERE owner_id = ?2 AND (?3 OR used_bytes + ?1 <= limit_bytes)",
        )
        .bind(bytes)
        .bind(owner)
        .bind(privileged)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            let quota = self.usage(owner).await?;
            return Err(UploadError::QuotaExceeded {
                used: quota.used_bytes,
                requested: bytes,
                limit: quota.limit_bytes,
            });
        }
        Ok(())
    }

    /// Unconditionally return `bytes` to the owner. The counter never goes
    /// below zero, so a double release is harmless.
    pub async fn release(&self, owner: Uuid, bytes: i64) -> UploadResult<()> {
        self.ensure_row(owner).await?;
        sqlx::query(
            "UPDATE user_quotas
             SET used_bytes = MAX(used_bytes - ?1, 0)
             WHERE owner_id = ?2",
        )
        .bind(bytes.max(0))
        .bind(owner)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Recompute `used_bytes` from the authoritative sum of the owner's
    /// durable videos plus currently reserved session bytes, replacing the
    /// stored counter. Advisory drift correction only.
    pub async fn reconcile(&self, owner: Uuid) -> UploadResult<i64> {
        self.ensure_row(owner).await?;

        let (committed,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM videos WHERE owner_id = ?",
        )
        .bind(owner)
        .fetch_one(&*self.db)
        .await?;

        let (reserved,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(reserved_bytes), 0) FROM upload_sessions
             WHERE owner_id = ? AND quota_reserved = 1",
        )
        .bind(owner)
        .fetch_one(&*self.db)
        .await?;

        let truth = committed + reserved;
        let result = sqlx::query(
            "UPDATE user_quotas SET used_bytes = ?1 WHERE owner_id = ?2 AND used_bytes != ?1",
        )
        .bind(truth)
        .bind(owner)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() > 0 {
            debug!("reconciled quota for {} to {} bytes", owner, truth);
        }
        Ok(truth)
    }

    /// Current ledger row, creating it lazily first.
    pub async fn usage(&self, owner: Uuid) -> UploadResult<UserQuota> {
        self.ensure_row(owner).await?;
        sqlx::query_as::<_, UserQuota>(
            "SELECT owner_id, used_bytes, limit_bytes, upload_count
             FROM user_quotas WHERE owner_id = ?",
        )
        .bind(owner)
        .fetch_one(&*self.db)
        .await
        .map_err(UploadError::Sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;

    const MIB: i64 = 1024 * 1024;

    async fn ledger() -> (Arc<SqlitePool>, QuotaLedger) {
        let pool = memory_pool().await;
        let ledger = QuotaLedger::new(pool.clone(), ConfigCache::new(pool.clone()));
        (pool, ledger)
    }

    async fn set_quota(pool: &SqlitePool, owner: Uuid, used: i64, limit: i64) {
        sqlx::query(
            "INSERT INTO user_quotas (owner_id, used_bytes, limit_bytes, upload_count)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(owner_id) DO UPDATE SET used_bytes = excluded.used_bytes,
                                                 limit_bytes = excluded.limit_bytes",
        )
        .bind(owner)
        .bind(used)
        .bind(limit)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn reserve_then_release_restores_prior_usage() {
        let (_pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();

        let before = ledger.usage(owner).await.unwrap().used_bytes;
        ledger.reserve(owner, 42 * MIB, false).await.unwrap();
        assert_eq!(
            ledger.usage(owner).await.unwrap().used_bytes,
            before + 42 * MIB
        );
        ledger.release(owner, 42 * MIB).await.unwrap();
        assert_eq!(ledger.usage(owner).await.unwrap().used_bytes, before);
    }

    #[tokio::test]
    async fn rejects_reservation_over_limit() {
        let (pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();
        // 20 MiB used against a 512 MiB ceiling; 500 MiB more will not fit.
        set_quota(&pool, owner, 20 * MIB, 512 * MIB).await;

        let err = ledger.reserve(owner, 500 * MIB, false).await.unwrap_err();
        match err {
            UploadError::QuotaExceeded {
                used,
                requested,
                limit,
            } => {
                assert_eq!(used, 20 * MIB);
                assert_eq!(requested, 500 * MIB);
                assert_eq!(limit, 512 * MIB);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        // the failed attempt charged nothing
        assert_eq!(ledger.usage(owner).await.unwrap().used_bytes, 20 * MIB);
    }

    #[tokio::test]
    async fn exact_fit_is_accepted() {
        let (pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();
        set_quota(&pool, owner, 12 * MIB, 512 * MIB).await;

        ledger.reserve(owner, 500 * MIB, false).await.unwrap();
        assert_eq!(ledger.usage(owner).await.unwrap().used_bytes, 512 * MIB);
    }

    #[tokio::test]
    async fn privileged_owner_bypasses_ceiling_but_accumulates() {
        let (pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();
        set_quota(&pool, owner, 0, 10 * MIB).await;

        ledger.reserve(owner, 100 * MIB, true).await.unwrap();
        let quota = ledger.usage(owner).await.unwrap();
        assert_eq!(quota.used_bytes, 100 * MIB);
        assert!(quota.used_bytes > quota.limit_bytes);
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let (_pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();

        ledger.reserve(owner, 5 * MIB, false).await.unwrap();
        ledger.release(owner, 5 * MIB).await.unwrap();
        // double release must not drive the counter negative
        ledger.release(owner, 5 * MIB).await.unwrap();
        assert_eq!(ledger.usage(owner).await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn reconcile_replaces_drifted_counter() {
        let (pool, ledger) = ledger().await;
        let owner = Uuid::new_v4();
        set_quota(&pool, owner, 999 * MIB, 10_240 * MIB).await;

        sqlx::query(
            "INSERT INTO videos (id, owner_id, title, storage_locator, media_type, size_bytes,
                                 etag, share_id, created_at, expires_at)
             VALUES (?, ?, 'clip', 'local:videos/x.mp4', 'video/mp4', ?, NULL, ?, ?, NULL)",
        )
        .bind(Uuid::new_v4())
        .bind(owner)
        .bind(300 * MIB)
        .bind(Uuid::new_v4())
        .bind(chrono::Utc::now())
        .execute(&*pool)
        .await
        .unwrap();

        let truth = ledger.reconcile(owner).await.unwrap();
        assert_eq!(truth, 300 * MIB);
        assert_eq!(ledger.usage(owner).await.unwrap().used_bytes, 300 * MIB);
    }
}
