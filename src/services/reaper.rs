//! Background sweep that expires stale sessions and reclaims their
//! resources.
//!
//! Unfinished sessions past their expiry are cancelled and their quota
//! reservation released; terminal sessions older than the retention window
//! are hard-deleted. A failure on one session is logged and never aborts
//! the sweep of the remainder.

use crate::models::session::UploadSession;
use crate::services::{config_cache::ConfigCache, upload_service::UploadService};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STARTUP_DELAY: Duration = Duration::from_secs(30);

/// What one sweep accomplished.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Stale sessions cancelled and released.
    pub expired: usize,
    /// Terminal rows hard-deleted past retention.
    pub purged: usize,
    /// Sessions the sweep failed on (logged, not fatal).
    pub failures: usize,
}

#[derive(Clone)]
pub struct Reaper {
    db: Arc<SqlitePool>,
    svc: UploadService,
    cache: ConfigCache,
}

impl Reaper {
    pub fn new(db: Arc<SqlitePool>, svc: UploadService, cache: ConfigCache) -> Self {
        Self { db, svc, cache }
    }

    /// Run forever: once shortly after start, then on a fixed interval.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DELAY).await;
            loop {
                match self.sweep().await {
                    Ok(report) => info!(
                        "reaper sweep: {} expired, {} purged, {} failures",
                        report.expired, report.purged, report.failures
                    ),
                    Err(err) => error!("reaper sweep aborted: {}", err),
                }
                tokio::time::sleep(SWEEP_INTERVAL).await;
            }
        })
    }

    /// One full sweep over stale and retired sessions.
    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        // `failed` sessions keep their reservation for a finalize retry;
        // past the expiry horizon that retry window is over and they are
        // reclaimed with the rest.
        let stale = sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, total_size, media_type, total_chunks,
                    chunks_uploaded, status, share_id, quota_reserved, reserved_bytes,
                    created_at, expires_at, storage_locator, error
             FROM upload_sessions
             WHERE status IN ('pending', 'uploading', 'failed') AND expires_at < ?",
        )
        .bind(now)
        .fetch_all(&*self.db)
        .await?;

        for session in stale {
            match self.svc.release_and_scrub(&session).await {
                Ok(()) => {
                    info!(
                        "reaper expired session {} ({} of {} chunks uploaded)",
                        session.id, session.chunks_uploaded, session.total_chunks
                    );
                    self.svc.quota_ledger().reconcile(session.owner_id).await.ok();
                    report.expired += 1;
                }
                Err(err) => {
                    warn!("failed to expire session {}: {}", session.id, err);
                    report.failures += 1;
                }
            }
        }

        let retention_days = self.cache.get().await?.retention_days;
        let cutoff = now - ChronoDuration::days(retention_days);

        // A crash can leave a terminal row still holding its reservation;
        // release it before the row is hard-deleted, or the owner's
        // used_bytes would stay inflated forever.
        let lingering = sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, total_size, media_type, total_chunks,
                    chunks_uploaded, status, share_id, quota_reserved, reserved_bytes,
                    created_at, expires_at, storage_locator, error
             FROM upload_sessions
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND created_at < ? AND quota_reserved = 1",
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        for session in lingering {
            match self
                .svc
                .quota_ledger()
                .release(session.owner_id, session.reserved_bytes)
                .await
            {
                Ok(()) => info!(
                    "released {} lingering reserved bytes from session {}",
                    session.reserved_bytes, session.id
                ),
                Err(err) => {
                    warn!("failed to release session {}: {}", session.id, err);
                    report.failures += 1;
                }
            }
        }

        let purged = sqlx::query(
            "DELETE FROM upload_sessions
             WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&*self.db)
        .await?;
        report.purged = purged.rows_affected() as usize;

        Ok(report)
    }
}
