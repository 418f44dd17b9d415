//! Video catalog collaborator: persists durable artifact records produced
//! by finalized sessions and resolves share identifiers for downloads.

use crate::errors::{UploadError, UploadResult};
use crate::models::video::Video;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a finalized session hands to the catalog.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub owner_id: Uuid,
    pub title: String,
    pub storage_locator: String,
    pub media_type: Option<String>,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub share_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CatalogService {
    db: Arc<SqlitePool>,
}

impl CatalogService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a durable video record and return it with its fresh id.
    pub async fn publish(&self, video: NewVideo) -> UploadResult<Video> {
        let record = Video {
            id: Uuid::new_v4(),
            owner_id: video.owner_id,
            title: video.title,
            storage_locator: video.storage_locator,
            media_type: video.media_type,
            size_bytes: video.size_bytes,
            etag: video.etag,
            share_id: video.share_id,
            created_at: Utc::now(),
            expires_at: video.expires_at,
        };

        sqlx::query(
            "INSERT INTO videos (id, owner_id, title, storage_locator, media_type, size_bytes,
                                 etag, share_id, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.owner_id)
        .bind(&record.title)
        .bind(&record.storage_locator)
        .bind(&record.media_type)
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(record.share_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&*self.db)
        .await?;

        Ok(record)
    }

    /// Resolve a public share identifier to its video record.
    pub async fn find_by_share_id(&self, share_id: Uuid) -> UploadResult<Video> {
        sqlx::query_as::<_, Video>(
            "SELECT id, owner_id, title, storage_locator, media_type, size_bytes,
                    etag, share_id, created_at, expires_at
             FROM videos WHERE share_id = ?",
        )
        .bind(share_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::NotFound,
            other => UploadError::Sqlx(other),
        })
    }
}
