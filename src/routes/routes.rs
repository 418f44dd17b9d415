//! Defines routes for the chunked-upload surface and shareable downloads.
//!
//! ## Structure
//! - **Upload session endpoints** (all owner-scoped via `x-user-id`)
//!   - `POST   /api/uploads/start` — validate, reserve quota, create session
//!   - `POST   /api/uploads/chunk/{sessionId}` — accept one multipart chunk
//!   - `POST   /api/uploads/chunk-url/{sessionId}/{chunkNumber}` — presigned direct-upload URL
//!   - `POST   /api/uploads/chunk-complete/{sessionId}/{chunkNumber}` — record a direct upload
//!   - `POST   /api/uploads/complete/{sessionId}` — assemble and publish
//!   - `DELETE /api/uploads/cancel/{sessionId}` — release and scrub
//!   - `GET    /api/uploads/status/{sessionId}` — session projection
//!   - `GET    /api/uploads/quota` — owner's ledger row
//!
//! - **Other endpoints**
//!   - `POST /api/admin/reap` — on-demand reaper sweep (admin role)
//!   - `GET  /files/{shareId}` — stream or redirect to a published video
//!   - `GET  /healthz`, `GET /readyz` — probes

use crate::{
    handlers::{
        admin_handlers::trigger_reap,
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, chunk_complete, chunk_url, complete_upload, quota_status,
            session_status, start_upload, upload_chunk,
        },
        video_handlers::download_video,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build and return the router for the whole HTTP surface.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload session endpoints
        .route("/api/uploads/start", post(start_upload))
        .route("/api/uploads/chunk/{session_id}", post(upload_chunk))
        .route(
            "/api/uploads/chunk-url/{session_id}/{chunk_number}",
            post(chunk_url),
        )
        .route(
            "/api/uploads/chunk-complete/{session_id}/{chunk_number}",
            post(chunk_complete),
        )
        .route("/api/uploads/complete/{session_id}", post(complete_upload))
        .route("/api/uploads/cancel/{session_id}", delete(cancel_upload))
        .route("/api/uploads/status/{session_id}", get(session_status))
        .route("/api/uploads/quota", get(quota_status))
        // administration
        .route("/api/admin/reap", post(trigger_reap))
        // shareable downloads
        .route("/files/{share_id}", get(download_video))
}
