//! HTTP handlers for the chunked-upload surface.
//!
//! Thin request/response plumbing: parsing bodies, mapping domain errors to
//! HTTP statuses, and shaping camelCase JSON. All decisions live in
//! `UploadService`.

use crate::auth::Owner;
use crate::errors::AppError;
use crate::models::session::{SessionStatus, UploadSession};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::upload_service::StartRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadReq {
    pub filename: String,
    pub file_size: i64,
    pub mimetype: String,
    pub total_chunks: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResp {
    session_id: Uuid,
    share_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResp {
    success: bool,
    chunk_number: i64,
    chunks_uploaded: i64,
    total_chunks: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUrlResp {
    url: String,
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCompleteReq {
    pub key: String,
    pub size: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCompleteResp {
    success: bool,
    chunks_uploaded: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResp {
    success: bool,
    video_id: Uuid,
    share_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResp {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProjection {
    session_id: Uuid,
    status: SessionStatus,
    filename: String,
    file_size: i64,
    mimetype: String,
    chunks_uploaded: i64,
    total_chunks: i64,
    share_id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    error: Option<String>,
}

impl From<UploadSession> for SessionProjection {
    fn from(s: UploadSession) -> Self {
        Self {
            session_id: s.id,
            status: s.status,
            filename: s.filename,
            file_size: s.total_size,
            mimetype: s.media_type,
            chunks_uploaded: s.chunks_uploaded,
            total_chunks: s.total_chunks,
            share_id: s.share_id,
            created_at: s.created_at,
            expires_at: s.expires_at,
            error: s.error,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResp {
    used_bytes: i64,
    limit_bytes: i64,
    remaining_bytes: i64,
}

/// `POST /api/uploads/start`
pub async fn start_upload(
    State(state): State<AppState>,
    owner: Owner,
    Json(req): Json<StartUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .uploads
        .start(
            owner,
            StartRequest {
                filename: req.filename,
                file_size: req.file_size,
                mimetype: req.mimetype,
                total_chunks: req.total_chunks,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartUploadResp {
            session_id: session.id,
            share_id: session.share_id,
            expires_at: session.expires_at,
        }),
    ))
}

/// `POST /api/uploads/chunk/{sessionId}`
///
/// Multipart body carrying a binary `chunk` field and an integer
/// `chunkNumber` field.
pub async fn upload_chunk(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResp>, AppError> {
    let mut chunk_number: Option<i64> = None;
    let mut data: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        match field.name() {
            Some("chunkNumber") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                let parsed = text.trim().parse::<i64>().map_err(|_| {
                    AppError::new(StatusCode::BAD_REQUEST, "chunkNumber must be an integer")
                })?;
                chunk_number = Some(parsed);
            }
            Some("chunk") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                data = Some(bytes);
            }
            _ => {}
        }
    }

    let chunk_number = chunk_number
        .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "missing chunkNumber field"))?;
    let data =
        data.ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "missing chunk field"))?;

    let session = state
        .uploads
        .accept_chunk(owner, session_id, chunk_number, data)
        .await?;

    Ok(Json(ChunkResp {
        success: true,
        chunk_number,
        chunks_uploaded: session.chunks_uploaded,
        total_chunks: session.total_chunks,
    }))
}

/// `POST /api/uploads/chunk-url/{sessionId}/{chunkNumber}`
///
/// Presigned direct-upload URL; 400 when the object store is not
/// configured.
pub async fn chunk_url(
    State(state): State<AppState>,
    owner: Owner,
    Path((session_id, chunk_number)): Path<(Uuid, i64)>,
) -> Result<Json<ChunkUrlResp>, AppError> {
    let presigned = state
        .uploads
        .presign_chunk(owner, session_id, chunk_number)
        .await?;
    Ok(Json(ChunkUrlResp {
        url: presigned.url,
        key: presigned.key,
    }))
}

/// `POST /api/uploads/chunk-complete/{sessionId}/{chunkNumber}`
///
/// Notification that a chunk was written directly to the object store.
pub async fn chunk_complete(
    State(state): State<AppState>,
    owner: Owner,
    Path((session_id, chunk_number)): Path<(Uuid, i64)>,
    Json(req): Json<ChunkCompleteReq>,
) -> Result<Json<ChunkCompleteResp>, AppError> {
    let session = state
        .uploads
        .complete_direct_chunk(owner, session_id, chunk_number, req.key, req.size)
        .await?;
    Ok(Json(ChunkCompleteResp {
        success: true,
        chunks_uploaded: session.chunks_uploaded,
    }))
}

/// `POST /api/uploads/complete/{sessionId}`
pub async fn complete_upload(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<Uuid>,
) -> Result<Json<CompleteResp>, AppError> {
    let (video, session) = state.uploads.finalize(owner, session_id).await?;
    Ok(Json(CompleteResp {
        success: true,
        video_id: video.id,
        share_id: session.share_id,
    }))
}

/// `DELETE /api/uploads/cancel/{sessionId}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SuccessResp>, AppError> {
    state.uploads.cancel(owner, session_id).await?;
    Ok(Json(SuccessResp { success: true }))
}

/// `GET /api/uploads/status/{sessionId}`
pub async fn session_status(
    State(state): State<AppState>,
    owner: Owner,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionProjection>, AppError> {
    let session = state.uploads.status(owner, session_id).await?;
    Ok(Json(session.into()))
}

/// `GET /api/uploads/quota`
pub async fn quota_status(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<QuotaResp>, AppError> {
    let quota = state.uploads.quota(owner).await?;
    Ok(Json(QuotaResp {
        used_bytes: quota.used_bytes,
        limit_bytes: quota.limit_bytes,
        remaining_bytes: quota.remaining_bytes(),
    }))
}
