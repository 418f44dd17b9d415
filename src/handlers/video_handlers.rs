//! Shareable-link downloads.
//!
//! `GET /files/{shareId}` streams a completed artifact stored locally, or
//! redirects to a presigned object-store URL when the artifact was moved
//! there. The share id is the only credential; ownership is deliberately
//! not checked here — that is what makes the links shareable.

use crate::errors::AppError;
use crate::services::storage_provider::Locator;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header, HeaderValue},
    response::{IntoResponse, Redirect, Response},
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// `GET /files/{shareId}` — stream or redirect to the artifact.
pub async fn download_video(
    State(state): State<AppState>,
    Path(share_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let video = state.catalog.find_by_share_id(share_id).await?;

    let locator = Locator::parse(&video.storage_locator)
        .ok_or_else(|| AppError::internal("unreadable storage locator"))?;

    match locator {
        Locator::Local(rel) => {
            let file = state.provider.open_local(&rel).await?;
            let stream = ReaderStream::new(file);
            let body = Body::from_stream(stream);

            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;
            let headers = response.headers_mut();
            let content_type = video
                .media_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into());
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&video.size_bytes.max(0).to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("0")),
            );
            headers.insert(
                header::LAST_MODIFIED,
                HeaderValue::from_str(&video.created_at.to_rfc2822())
                    .unwrap_or_else(|_| HeaderValue::from_static("")),
            );
            Ok(response)
        }
        Locator::Remote(key) => {
            let store = state.provider.object_store().await?;
            let url = store.presign_get(&key).await?;
            Ok(Redirect::temporary(&url).into_response())
        }
    }
}
