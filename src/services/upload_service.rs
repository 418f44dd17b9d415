//! Upload session manager.
//!
//! Owns the session state machine and the chunk bookkeeping, and
//! orchestrates quota reservation, assembly and cleanup. Sessions and
//! chunk rows are mutated exclusively here (and by the reaper through the
//! crate-visible scrub path).

use crate::auth::Owner;
use crate::errors::{UploadError, UploadResult};
use crate::models::{
    chunk::UploadChunk,
    quota::UserQuota,
    session::{SessionStatus, UploadSession},
    video::Video,
};
use crate::services::{
    assembler::Assembler,
    catalog_service::{CatalogService, NewVideo},
    config_cache::ConfigCache,
    quota_service::QuotaLedger,
    storage_provider::{
        Locator, StorageProvider, chunk_object_key, chunk_rel_path, session_chunk_dir,
    },
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::stream;
use sqlx::SqlitePool;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// MIME types accepted at `start`.
const ALLOWED_MEDIA_TYPES: [&str; 7] = [
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "video/x-msvideo",
    "video/mpeg",
    "video/ogg",
];

const MAX_TOTAL_CHUNKS: i64 = 10_000;

/// Parameters of a `start` call, as declared by the client.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub filename: String,
    pub file_size: i64,
    pub mimetype: String,
    pub total_chunks: i64,
}

/// A presigned direct-upload target for one chunk.
#[derive(Debug)]
pub struct PresignedChunk {
    pub url: String,
    pub key: String,
}

#[derive(Clone)]
pub struct UploadService {
    db: Arc<SqlitePool>,
    quota: QuotaLedger,
    provider: StorageProvider,
    assembler: Assembler,
    catalog: CatalogService,
    cache: ConfigCache,
}

impl UploadService {
    pub fn new(
        db: Arc<SqlitePool>,
        quota: QuotaLedger,
        provider: StorageProvider,
        catalog: CatalogService,
        cache: ConfigCache,
    ) -> Self {
        let assembler = Assembler::new(provider.clone());
        Self {
            db,
            quota,
            provider,
            assembler,
            catalog,
            cache,
        }
    }

    pub fn quota_ledger(&self) -> &QuotaLedger {
        &self.quota
    }

    /// Validate the declared upload, reserve quota, and create the session.
    ///
    /// The reservation is taken before the row insert; if the insert fails
    /// the reservation is returned immediately so no quota is dropped.
    pub async fn start(&self, owner: Owner, req: StartRequest) -> UploadResult<UploadSession> {
        let cfg = self.cache.get().await?;

        let mimetype = req.mimetype.trim().to_ascii_lowercase();
        if !ALLOWED_MEDIA_TYPES.contains(&mimetype.as_str()) {
            return Err(UploadError::Validation(format!(
                "media type `{}` is not allowed",
                req.mimetype
            )));
        }
        if req.filename.trim().is_empty() {
            return Err(UploadError::Validation("filename must not be empty".into()));
        }
        if req.file_size <= 0 {
            return Err(UploadError::Validation(
                "file size must be positive".into(),
            ));
        }
        if req.file_size > cfg.max_file_size {
            return Err(UploadError::Validation(format!(
                "file size {} exceeds the {} byte ceiling",
                req.file_size, cfg.max_file_size
            )));
        }
        if req.total_chunks < 1 || req.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(UploadError::Validation(format!(
                "total chunks must be between 1 and {}",
                MAX_TOTAL_CHUNKS
            )));
        }

        self.quota
            .reserve(owner.id, req.file_size, owner.privileged)
            .await?;

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            owner_id: owner.id,
            filename: req.filename.trim().to_string(),
            total_size: req.file_size,
            media_type: mimetype,
            total_chunks: req.total_chunks,
            chunks_uploaded: 0,
            status: SessionStatus::Pending,
            share_id: Uuid::new_v4(),
            quota_reserved: true,
            reserved_bytes: req.file_size,
            created_at: now,
            expires_at: now + Duration::hours(cfg.session_ttl_hours),
            storage_locator: None,
            error: None,
        };

        let inserted = sqlx::query(
            "INSERT INTO upload_sessions (id, owner_id, filename, total_size, media_type,
                                          total_chunks, chunks_uploaded, status, share_id,
                                          quota_reserved, reserved_bytes, created_at, expires_at,
                                          storage_locator, error)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, 1, ?, ?, ?, NULL, NULL)",
        )
        .bind(session.id)
        .bind(session.owner_id)
        .bind(&session.filename)
        .bind(session.total_size)
        .bind(&session.media_type)
        .bind(session.total_chunks)
        .bind(session.status)
        .bind(session.share_id)
        .bind(session.reserved_bytes)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&*self.db)
        .await;

        if let Err(err) = inserted {
            self.quota.release(owner.id, req.file_size).await.ok();
            return Err(UploadError::Sqlx(err));
        }

        info!(
            "started session {} for {} ({} bytes, {} chunks)",
            session.id, owner.id, session.total_size, session.total_chunks
        );
        Ok(session)
    }

    /// Accept one chunk routed through this process; bytes land under the
    /// local chunk tree regardless of the active backend.
    ///
    /// Re-submission of an already-recorded index is a no-op success
    /// returning the unchanged counts — the resumability contract.
    pub async fn accept_chunk(
        &self,
        owner: Owner,
        session_id: Uuid,
        index: i64,
        data: Bytes,
    ) -> UploadResult<UploadSession> {
        let session = self.fetch_owned(session_id, owner).await?;
        self.ensure_index_in_range(&session, index)?;

        if let Some(_existing) = self.fetch_chunk(session_id, index).await? {
            debug!("chunk {} of session {} re-submitted", index, session_id);
            return Ok(session);
        }
        self.ensure_accepts_chunks(&session)?;

        let rel = chunk_rel_path(session_id, index);
        let written = self
            .provider
            .write_local(&rel, stream::iter(vec![io::Result::Ok(data)]))
            .await?;

        self.record_chunk(
            &session,
            index,
            written.size_bytes,
            Locator::Local(rel).to_string(),
        )
        .await
    }

    /// Presigned URL for writing one chunk straight to the object store.
    /// Only available when that backend is configured.
    pub async fn presign_chunk(
        &self,
        owner: Owner,
        session_id: Uuid,
        index: i64,
    ) -> UploadResult<PresignedChunk> {
        let session = self.fetch_owned(session_id, owner).await?;
        self.ensure_index_in_range(&session, index)?;
        self.ensure_accepts_chunks(&session)?;

        let store = self.provider.object_store().await?;
        let key = chunk_object_key(session_id, index);
        let url = store.presign_put(&key).await?;
        Ok(PresignedChunk { url, key })
    }

    /// Record a chunk the client uploaded directly via a presigned URL.
    /// Same idempotence contract as `accept_chunk`.
    pub async fn complete_direct_chunk(
        &self,
        owner: Owner,
        session_id: Uuid,
        index: i64,
        key: String,
        size: i64,
    ) -> UploadResult<UploadSession> {
        let session = self.fetch_owned(session_id, owner).await?;
        self.ensure_index_in_range(&session, index)?;

        if key != chunk_object_key(session_id, index) {
            return Err(UploadError::Validation("unexpected chunk key".into()));
        }
        if size < 0 {
            return Err(UploadError::Validation("negative chunk size".into()));
        }

        if self.fetch_chunk(session_id, index).await?.is_some() {
            debug!("chunk {} of session {} re-notified", index, session_id);
            return Ok(session);
        }
        self.ensure_accepts_chunks(&session)?;

        self.record_chunk(&session, index, size, Locator::Remote(key).to_string())
            .await
    }

    /// Assemble the session into its durable artifact and publish it to the
    /// video catalog.
    ///
    /// Allowed from `uploading`, and from `failed` as a retry after a
    /// transient assembly fault. The quota reservation is consumed by the
    /// commit; no further ledger call is made. On assembly failure the
    /// session is marked `failed` with the reason and the reservation is
    /// deliberately kept so the upload can be retried without re-uploading.
    pub async fn finalize(
        &self,
        owner: Owner,
        session_id: Uuid,
    ) -> UploadResult<(Video, UploadSession)> {
        let session = self.fetch_owned(session_id, owner).await?;

        match session.status {
            SessionStatus::Uploading | SessionStatus::Failed => {}
            SessionStatus::Pending => {
                return Err(UploadError::Validation(format!(
                    "chunk count mismatch: {} of {} uploaded",
                    session.chunks_uploaded, session.total_chunks
                )));
            }
            other => return Err(UploadError::InvalidState(other)),
        }
        if !session.is_complete() {
            return Err(UploadError::Validation(format!(
                "chunk count mismatch: {} of {} uploaded",
                session.chunks_uploaded, session.total_chunks
            )));
        }

        // Optimistic transition; a concurrent finalize loses this race.
        let promoted = sqlx::query(
            "UPDATE upload_sessions SET status = 'assembling', error = NULL
             WHERE id = ? AND status IN ('uploading', 'failed')",
        )
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        if promoted.rows_affected() == 0 {
            let current = self.fetch_owned(session_id, owner).await?;
            return Err(UploadError::InvalidState(current.status));
        }

        let chunks = self.fetch_chunks(session_id).await?;
        let artifact = match self.assembler.assemble(&session, &chunks).await {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!("assembly failed for session {}: {}", session_id, err);
                self.mark_failed(session_id, &err).await?;
                return Err(err);
            }
        };

        // Publish and commit must not leave the session in `assembling`:
        // nothing can cancel or retry that state, so any fault here lands
        // the session in `failed` where the retry path applies.
        let locator = artifact.locator.to_string();
        let video = match self
            .catalog
            .publish(NewVideo {
                owner_id: session.owner_id,
                title: session.filename.clone(),
                storage_locator: locator.clone(),
                media_type: Some(session.media_type.clone()),
                size_bytes: artifact.size_bytes,
                etag: artifact.etag.clone(),
                share_id: session.share_id,
                expires_at: None,
            })
            .await
        {
            Ok(video) => video,
            Err(err) => {
                warn!("publish failed for session {}: {}", session_id, err);
                self.mark_failed(session_id, &err).await?;
                return Err(err);
            }
        };

        if let Err(err) = sqlx::query(
            "UPDATE upload_sessions
             SET status = 'completed', storage_locator = ?, quota_reserved = 0, error = NULL
             WHERE id = ?",
        )
        .bind(&locator)
        .bind(session_id)
        .execute(&*self.db)
        .await
        {
            let err = UploadError::Sqlx(err);
            self.mark_failed(session_id, &err).await?;
            return Err(err);
        }

        self.delete_chunk_rows(session_id).await?;
        self.provider
            .delete_local_dir(&session_chunk_dir(session_id))
            .await
            .ok();

        info!(
            "session {} completed: video {} at {}",
            session_id, video.id, locator
        );

        let refreshed = self.fetch_owned(session_id, owner).await?;
        Ok((video, refreshed))
    }

    /// Cancel a session: release its reservation and scrub its chunks.
    ///
    /// Idempotent — cancelling a `completed` or already-cancelled session
    /// is a no-op success. A `failed` session still holds its reservation
    /// for a finalize retry, so cancelling one releases and scrubs it like
    /// any live session. An in-flight assembly cannot be interrupted, so
    /// `assembling` sessions are rejected.
    pub async fn cancel(&self, owner: Owner, session_id: Uuid) -> UploadResult<()> {
        let session = self.fetch_owned(session_id, owner).await?;
        match session.status {
            SessionStatus::Completed | SessionStatus::Cancelled => return Ok(()),
            SessionStatus::Assembling => {
                return Err(UploadError::InvalidState(session.status));
            }
            _ => {}
        }

        self.release_and_scrub(&session).await?;
        self.quota.reconcile(session.owner_id).await.ok();
        info!("session {} cancelled by owner", session_id);
        Ok(())
    }

    /// Read-only projection of the session row.
    pub async fn status(&self, owner: Owner, session_id: Uuid) -> UploadResult<UploadSession> {
        self.fetch_owned(session_id, owner).await
    }

    /// The owner's current ledger row.
    pub async fn quota(&self, owner: Owner) -> UploadResult<UserQuota> {
        self.quota.usage(owner.id).await
    }

    /// Release the session's reservation, delete its chunk payloads and
    /// rows, and mark it cancelled. Shared by `cancel` and the reaper.
    pub(crate) async fn release_and_scrub(&self, session: &UploadSession) -> UploadResult<()> {
        if session.quota_reserved {
            self.quota
                .release(session.owner_id, session.reserved_bytes)
                .await?;
        }

        let chunks = self.fetch_chunks(session.id).await?;
        let remote_keys: Vec<String> = chunks
            .iter()
            .filter_map(|c| match Locator::parse(&c.locator) {
                Some(Locator::Remote(key)) => Some(key),
                _ => None,
            })
            .collect();
        if !remote_keys.is_empty() {
            match self.provider.object_store().await {
                Ok(store) => {
                    for key in &remote_keys {
                        if let Err(err) = store.delete(key).await {
                            debug!("failed to delete chunk object {}: {}", key, err);
                        }
                    }
                }
                Err(err) => debug!(
                    "object store unavailable while scrubbing session {}: {}",
                    session.id, err
                ),
            }
        }
        self.provider
            .delete_local_dir(&session_chunk_dir(session.id))
            .await
            .ok();

        self.delete_chunk_rows(session.id).await?;
        sqlx::query(
            "UPDATE upload_sessions SET status = 'cancelled', quota_reserved = 0 WHERE id = ?",
        )
        .bind(session.id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, session_id: Uuid, err: &UploadError) -> UploadResult<()> {
        sqlx::query("UPDATE upload_sessions SET status = 'failed', error = ? WHERE id = ?")
            .bind(err.to_string())
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn record_chunk(
        &self,
        session: &UploadSession,
        index: i64,
        size_bytes: i64,
        locator: String,
    ) -> UploadResult<UploadSession> {
        let inserted = sqlx::query(
            "INSERT INTO upload_chunks (session_id, chunk_index, size_bytes, locator, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, chunk_index) DO NOTHING",
        )
        .bind(session.id)
        .bind(index)
        .bind(size_bytes)
        .bind(&locator)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        // A concurrent submission of the same index won the insert; treat
        // this one as the no-op duplicate.
        if inserted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE upload_sessions
                 SET chunks_uploaded = chunks_uploaded + 1,
                     status = CASE WHEN status = 'pending' THEN 'uploading' ELSE status END
                 WHERE id = ?",
            )
            .bind(session.id)
            .execute(&*self.db)
            .await?;
        }

        self.fetch_session(session.id).await
    }

    fn ensure_index_in_range(&self, session: &UploadSession, index: i64) -> UploadResult<()> {
        if index < 0 || index >= session.total_chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {} outside [0, {})",
                index, session.total_chunks
            )));
        }
        Ok(())
    }

    fn ensure_accepts_chunks(&self, session: &UploadSession) -> UploadResult<()> {
        match session.status {
            SessionStatus::Pending | SessionStatus::Uploading => Ok(()),
            other => Err(UploadError::InvalidState(other)),
        }
    }

    async fn fetch_owned(&self, session_id: Uuid, owner: Owner) -> UploadResult<UploadSession> {
        let session = self.fetch_session(session_id).await?;
        if session.owner_id != owner.id {
            return Err(UploadError::Unauthorized);
        }
        Ok(session)
    }

    async fn fetch_session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, total_size, media_type, total_chunks,
                    chunks_uploaded, status, share_id, quota_reserved, reserved_bytes,
                    created_at, expires_at, storage_locator, error
             FROM upload_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::NotFound,
            other => UploadError::Sqlx(other),
        })
    }

    async fn fetch_chunk(
        &self,
        session_id: Uuid,
        index: i64,
    ) -> UploadResult<Option<UploadChunk>> {
        sqlx::query_as::<_, UploadChunk>(
            "SELECT session_id, chunk_index, size_bytes, locator, created_at
             FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id)
        .bind(index)
        .fetch_optional(&*self.db)
        .await
        .map_err(UploadError::Sqlx)
    }

    async fn fetch_chunks(&self, session_id: Uuid) -> UploadResult<Vec<UploadChunk>> {
        sqlx::query_as::<_, UploadChunk>(
            "SELECT session_id, chunk_index, size_bytes, locator, created_at
             FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await
        .map_err(UploadError::Sqlx)
    }

    async fn delete_chunk_rows(&self, session_id: Uuid) -> UploadResult<()> {
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use tempfile::TempDir;

    const MIB: i64 = 1024 * 1024;

    struct Stack {
        dir: TempDir,
        pool: Arc<SqlitePool>,
        svc: UploadService,
    }

    fn build_service(pool: Arc<SqlitePool>, root: &std::path::Path) -> UploadService {
        let cache = ConfigCache::new(pool.clone());
        let provider = StorageProvider::new(root, cache.clone());
        let quota = QuotaLedger::new(pool.clone(), cache.clone());
        let catalog = CatalogService::new(pool.clone());
        UploadService::new(pool, quota, provider, catalog, cache)
    }

    async fn stack() -> Stack {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let svc = build_service(pool.clone(), dir.path());
        Stack { dir, pool, svc }
    }

    fn user() -> Owner {
        Owner {
            id: Uuid::new_v4(),
            privileged: false,
        }
    }

    async fn set_quota(pool: &SqlitePool, owner: Owner, used: i64, limit: i64) {
        sqlx::query(
            "INSERT INTO user_quotas (owner_id, used_bytes, limit_bytes, upload_count)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(owner_id) DO UPDATE SET used_bytes = excluded.used_bytes,
                                                 limit_bytes = excluded.limit_bytes",
        )
        .bind(owner.id)
        .bind(used)
        .bind(limit)
        .execute(pool)
        .await
        .unwrap();
    }

    fn start_req(file_size: i64, total_chunks: i64) -> StartRequest {
        StartRequest {
            filename: "movie.mp4".into(),
            file_size,
            mimetype: "video/mp4".into(),
            total_chunks,
        }
    }

    async fn put_chunk(svc: &UploadService, owner: Owner, session_id: Uuid, index: i64) {
        let data = Bytes::from(format!("chunk-{index:03};"));
        svc.accept_chunk(owner, session_id, index, data)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_validates_declared_upload() {
        let stack = stack().await;
        let owner = user();

        let bad_type = StartRequest {
            mimetype: "application/zip".into(),
            ..start_req(1024, 1)
        };
        assert!(matches!(
            stack.svc.start(owner, bad_type).await,
            Err(UploadError::Validation(_))
        ));

        assert!(matches!(
            stack.svc.start(owner, start_req(0, 1)).await,
            Err(UploadError::Validation(_))
        ));

        // over the configured 2 GiB ceiling
        assert!(matches!(
            stack.svc.start(owner, start_req(3 * 1024 * MIB, 700)).await,
            Err(UploadError::Validation(_))
        ));

        assert!(matches!(
            stack.svc.start(owner, start_req(1024, 0)).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            stack.svc.start(owner, start_req(1024, MAX_TOTAL_CHUNKS + 1)).await,
            Err(UploadError::Validation(_))
        ));

        // nothing was reserved by the failed attempts
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn scenario_a_start_rejected_when_quota_would_overcommit() {
        let stack = stack().await;
        let owner = user();
        // 20 MiB already used against a 512 MiB limit
        set_quota(&stack.pool, owner, 20 * MIB, 512 * MIB).await;

        // 500 MiB more would put the owner at 520 MiB
        let err = stack
            .svc
            .start(owner, start_req(524_288_000, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::QuotaExceeded { .. }));
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 20 * MIB);
    }

    #[tokio::test]
    async fn scenario_b_full_upload_charges_quota_exactly_once() {
        let stack = stack().await;
        let owner = user();
        set_quota(&stack.pool, owner, 0, 512 * MIB).await;

        let session = stack
            .svc
            .start(owner, start_req(524_288_000, 100))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.quota_reserved);
        assert_eq!(session.reserved_bytes, 524_288_000);
        assert_eq!(
            stack.svc.quota(owner).await.unwrap().used_bytes,
            524_288_000
        );

        for index in 0..100 {
            put_chunk(&stack.svc, owner, session.id, index).await;
        }
        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Uploading);
        assert_eq!(current.chunks_uploaded, 100);

        let (video, done) = stack.svc.finalize(owner, session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.storage_locator.as_deref(), Some(video.storage_locator.as_str()));
        assert_eq!(video.share_id, session.share_id);

        // committed, not double-charged
        assert_eq!(
            stack.svc.quota(owner).await.unwrap().used_bytes,
            524_288_000
        );
        assert!(!done.quota_reserved);

        // artifact is the chunks in index order
        let rel = match Locator::parse(&video.storage_locator).unwrap() {
            Locator::Local(rel) => rel,
            other => panic!("expected local artifact, got {other:?}"),
        };
        let bytes = tokio::fs::read(stack.dir.path().join(rel)).await.unwrap();
        let expected: String = (0..100).map(|i| format!("chunk-{i:03};")).collect();
        assert_eq!(bytes, expected.as_bytes());

        // chunk rows and payloads are gone
        let (rows,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?")
                .bind(session.id)
                .fetch_one(&*stack.pool)
                .await
                .unwrap();
        assert_eq!(rows, 0);
        assert!(!stack.dir.path().join(format!("chunks/{}", session.id)).exists());
    }

    #[tokio::test]
    async fn scenario_c_cancel_restores_quota_and_scrubs_chunks() {
        let stack = stack().await;
        let owner = user();
        set_quota(&stack.pool, owner, 0, 512 * MIB).await;

        let session = stack
            .svc
            .start(owner, start_req(524_288_000, 100))
            .await
            .unwrap();
        for index in 0..50 {
            put_chunk(&stack.svc, owner, session.id, index).await;
        }

        stack.svc.cancel(owner, session.id).await.unwrap();

        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 0);
        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Cancelled);
        assert!(!current.quota_reserved);

        let (rows,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?")
                .bind(session.id)
                .fetch_one(&*stack.pool)
                .await
                .unwrap();
        assert_eq!(rows, 0);
        assert!(!stack.dir.path().join(format!("chunks/{}", session.id)).exists());

        // cancelling a terminal session is a no-op success
        stack.svc.cancel(owner, session.id).await.unwrap();
    }

    #[tokio::test]
    async fn scenario_d_resume_after_restart() {
        let stack = stack().await;
        let owner = user();

        let session = stack.svc.start(owner, start_req(100 * MIB, 100)).await.unwrap();
        for index in 0..51 {
            put_chunk(&stack.svc, owner, session.id, index).await;
        }

        // new service over the same store simulates a process restart
        let restarted = build_service(stack.pool.clone(), stack.dir.path());

        let resubmitted = restarted
            .accept_chunk(owner, session.id, 50, Bytes::from_static(b"ignored"))
            .await
            .unwrap();
        assert_eq!(resubmitted.chunks_uploaded, 51);

        for index in 51..100 {
            put_chunk(&restarted, owner, session.id, index).await;
        }
        let (_, done) = restarted.finalize(owner, session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_chunk_submission_is_idempotent() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 3)).await.unwrap();

        let first = stack
            .svc
            .accept_chunk(owner, session.id, 1, Bytes::from_static(b"original"))
            .await
            .unwrap();
        assert_eq!(first.chunks_uploaded, 1);

        let second = stack
            .svc
            .accept_chunk(owner, session.id, 1, Bytes::from_static(b"different"))
            .await
            .unwrap();
        assert_eq!(second.chunks_uploaded, 1);

        // the recorded payload is untouched
        let bytes = tokio::fs::read(
            stack
                .dir
                .path()
                .join(format!("chunks/{}/1.part", session.id)),
        )
        .await
        .unwrap();
        assert_eq!(bytes, b"original");
    }

    #[tokio::test]
    async fn finalize_requires_every_chunk() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 4)).await.unwrap();

        for index in [0, 1, 3] {
            put_chunk(&stack.svc, owner, session.id, index).await;
        }
        let err = stack.svc.finalize(owner, session.id).await.unwrap_err();
        match err {
            UploadError::Validation(msg) => assert!(msg.contains("chunk count mismatch")),
            other => panic!("expected Validation, got {other:?}"),
        }

        // fresh pending session is rejected the same way
        let empty = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();
        assert!(matches!(
            stack.svc.finalize(owner, empty.id).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let stack = stack().await;
        let owner = user();
        let stranger = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();

        assert!(matches!(
            stack.svc.status(stranger, session.id).await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            stack
                .svc
                .accept_chunk(stranger, session.id, 0, Bytes::from_static(b"x"))
                .await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            stack.svc.cancel(stranger, session.id).await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            stack.svc.status(owner, Uuid::new_v4()).await,
            Err(UploadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn chunk_index_must_be_in_range() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();

        for bad in [-1i64, 2, 100] {
            assert!(matches!(
                stack
                    .svc
                    .accept_chunk(owner, session.id, bad, Bytes::from_static(b"x"))
                    .await,
                Err(UploadError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn completed_session_rejects_further_operations() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 1)).await.unwrap();
        put_chunk(&stack.svc, owner, session.id, 0).await;
        stack.svc.finalize(owner, session.id).await.unwrap();

        assert!(matches!(
            stack.svc.finalize(owner, session.id).await,
            Err(UploadError::InvalidState(SessionStatus::Completed))
        ));
        assert!(matches!(
            stack
                .svc
                .accept_chunk(owner, session.id, 0, Bytes::from_static(b"x"))
                .await,
            Err(UploadError::InvalidState(SessionStatus::Completed))
        ));
    }

    #[tokio::test]
    async fn failed_assembly_keeps_reservation_and_allows_retry() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();
        put_chunk(&stack.svc, owner, session.id, 0).await;
        put_chunk(&stack.svc, owner, session.id, 1).await;

        // lose chunk 1's payload behind the bookkeeping's back
        let chunk_path = stack
            .dir
            .path()
            .join(format!("chunks/{}/1.part", session.id));
        tokio::fs::remove_file(&chunk_path).await.unwrap();

        let err = stack.svc.finalize(owner, session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::Assembly(_)));

        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Failed);
        assert_eq!(current.error.as_deref(), Some("assembly failed: chunk 1 not found"));
        // reservation is deliberately kept for a retry
        assert!(current.quota_reserved);
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, MIB);

        // restore the payload and retry finalize from `failed`
        tokio::fs::write(&chunk_path, b"chunk-001;").await.unwrap();
        let (_, done) = stack.svc.finalize(owner, session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn cancel_of_failed_session_releases_reservation() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();
        put_chunk(&stack.svc, owner, session.id, 0).await;
        put_chunk(&stack.svc, owner, session.id, 1).await;

        let chunk_path = stack
            .dir
            .path()
            .join(format!("chunks/{}/1.part", session.id));
        tokio::fs::remove_file(&chunk_path).await.unwrap();
        stack.svc.finalize(owner, session.id).await.unwrap_err();

        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Failed);
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, MIB);

        // a failed session must still have a way out of its reservation
        stack.svc.cancel(owner, session.id).await.unwrap();
        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Cancelled);
        assert!(!current.quota_reserved);
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 0);

        // and re-cancelling stays a no-op
        stack.svc.cancel(owner, session.id).await.unwrap();
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn publish_fault_lands_in_failed_not_assembling() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 1)).await.unwrap();
        put_chunk(&stack.svc, owner, session.id, 0).await;

        // occupy the session's share id so the catalog insert must fail
        sqlx::query(
            "INSERT INTO videos (id, owner_id, title, storage_locator, media_type, size_bytes,
                                 etag, share_id, created_at, expires_at)
             VALUES (?, ?, 'squatter', 'local:videos/x.mp4', 'video/mp4', 1, NULL, ?, ?, NULL)",
        )
        .bind(Uuid::new_v4())
        .bind(Uuid::new_v4())
        .bind(session.share_id)
        .bind(Utc::now())
        .execute(&*stack.pool)
        .await
        .unwrap();

        let err = stack.svc.finalize(owner, session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::Sqlx(_)));

        // not stranded in `assembling`: failed with the reason recorded,
        // and cancel can still release the reservation
        let current = stack.svc.status(owner, session.id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Failed);
        assert!(current.error.is_some());
        assert!(current.quota_reserved);

        stack.svc.cancel(owner, session.id).await.unwrap();
        assert_eq!(stack.svc.quota(owner).await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn presign_requires_object_store_backend() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();

        assert!(matches!(
            stack.svc.presign_chunk(owner, session.id, 0).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn direct_chunk_completion_validates_key() {
        let stack = stack().await;
        let owner = user();
        let session = stack.svc.start(owner, start_req(MIB, 2)).await.unwrap();

        assert!(matches!(
            stack
                .svc
                .complete_direct_chunk(owner, session.id, 0, "uploads/forged/0.part".into(), 10)
                .await,
            Err(UploadError::Validation(_))
        ));

        let key = chunk_object_key(session.id, 0);
        let after = stack
            .svc
            .complete_direct_chunk(owner, session.id, 0, key.clone(), 10)
            .await;
        // accepted and recorded with the remote locator
        let after = after.unwrap();
        assert_eq!(after.chunks_uploaded, 1);
        let (locator,): (String,) = sqlx::query_as(
            "SELECT locator FROM upload_chunks WHERE session_id = ? AND chunk_index = 0",
        )
        .bind(session.id)
        .fetch_one(&*stack.pool)
        .await
        .unwrap();
        assert_eq!(locator, format!("s3:{}", key));
    }
}
